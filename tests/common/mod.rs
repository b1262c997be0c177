#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use otf_ctrie::{Collector, CollectorThread, Config, Ctrie};

pub const FIXTURE_KEYS: usize = 26 * 64;

/// Collector that runs small, frequent cycles.
pub fn busy_collector() -> Arc<Collector> {
    Collector::new(Config {
        trigger_bytes: 32 * 1024,
        cycle_interval: Some(Duration::from_millis(1)),
        ..Config::default()
    })
}

pub fn fixture_keys() -> impl Iterator<Item = (String, usize)> {
    (b'a'..=b'z').flat_map(|c| (1..=64).map(move |len| ((c as char).to_string().repeat(len), len)))
}

/// Running collector thread plus a trie holding every key of one to 64
/// repetitions of a lowercase letter, mapped to its length.
pub struct Fixture {
    pub trie: Ctrie<usize>,
    pub gc: Option<CollectorThread>,
}

impl Fixture {
    pub fn new() -> Self {
        let collector = busy_collector();
        let gc = Ctrie::<usize>::spawn_collector(&collector).unwrap();
        let trie = Ctrie::new(&collector).unwrap();
        for (key, value) in fixture_keys() {
            trie.insert(&key, value).unwrap();
        }
        Self { trie, gc: Some(gc) }
    }

    pub fn assert_intact(&self) {
        for (key, value) in fixture_keys() {
            assert_eq!(self.trie.lookup(&key).unwrap(), Some(value), "key {:?}", key);
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if let Some(gc) = self.gc.take() {
            gc.shutdown().unwrap();
        }
    }
}
