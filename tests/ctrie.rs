mod common;

use std::collections::HashSet;

use common::{fixture_keys, Fixture, FIXTURE_KEYS};
use otf_ctrie::{Collector, Config, Ctrie};

#[test]
fn fixture_contains_every_key() {
    let fixture = Fixture::new();
    assert_eq!(fixture_keys().count(), FIXTURE_KEYS);
    fixture.assert_intact();
    assert_eq!(fixture.trie.lookup("A").unwrap(), None);
    assert_eq!(fixture.trie.lookup(&"a".repeat(65)).unwrap(), None);
}

#[test]
fn remove_leaves_other_keys() {
    let fixture = Fixture::new();
    assert_eq!(fixture.trie.remove("aaaaa").unwrap(), Some(5));
    assert_eq!(fixture.trie.lookup("aaaaa").unwrap(), None);
    assert_eq!(fixture.trie.remove("aaaaa").unwrap(), None);
    for (key, value) in fixture_keys().filter(|(key, _)| key != "aaaaa") {
        assert_eq!(fixture.trie.lookup(&key).unwrap(), Some(value));
    }
    fixture.trie.insert("aaaaa", 5).unwrap();
    fixture.assert_intact();
}

#[test]
fn insert_replaces_value() {
    let fixture = Fixture::new();
    fixture.trie.insert("zz", 200).unwrap();
    assert_eq!(fixture.trie.lookup("zz").unwrap(), Some(200));
    fixture.trie.insert("zz", 2).unwrap();
    fixture.assert_intact();
}

#[test]
fn concurrent_disjoint_inserts_and_removes() {
    let fixture = Fixture::new();
    let trie = &fixture.trie;
    std::thread::scope(|scope| {
        for thread in 0..10usize {
            scope.spawn(move || {
                let lengths: Vec<usize> = (65 + thread..1000).step_by(10).collect();
                for &len in &lengths {
                    trie.insert(&"k".repeat(len), len).unwrap();
                }
                for &len in &lengths {
                    assert_eq!(trie.lookup(&"k".repeat(len)).unwrap(), Some(len));
                }
                for &len in lengths.iter().filter(|&&len| len % 3 != 0) {
                    assert_eq!(trie.remove(&"k".repeat(len)).unwrap(), Some(len));
                }
                trie.collector().deregister_current_thread();
            });
        }
    });
    fixture.assert_intact();
    for len in 65..1000 {
        let expected = (len % 3 == 0).then_some(len);
        assert_eq!(trie.lookup(&"k".repeat(len)).unwrap(), expected, "length {}", len);
    }
}

#[test]
fn interleaved_operations_keep_fixture() {
    let fixture = Fixture::new();
    let trie = &fixture.trie;
    std::thread::scope(|scope| {
        for thread in 0..4usize {
            scope.spawn(move || {
                for round in 0..40usize {
                    let len = 65 + thread + 4 * round;
                    let key = "m".repeat(len);
                    trie.insert(&key, len).unwrap();
                    let letter = (b'a' + (round % 26) as u8) as char;
                    let probe = letter.to_string().repeat(1 + round % 64);
                    assert_eq!(trie.lookup(&probe).unwrap(), Some(1 + round % 64));
                    assert_eq!(trie.remove(&key).unwrap(), Some(len));
                }
            });
        }
    });
    fixture.assert_intact();
}

#[test]
fn single_threaded_churn() {
    let fixture = Fixture::new();
    for len in (65..2500).step_by(10) {
        fixture.trie.insert(&"c".repeat(len), len).unwrap();
    }
    for len in (65..2500).step_by(10) {
        assert_eq!(fixture.trie.remove(&"c".repeat(len)).unwrap(), Some(len));
    }
    fixture.assert_intact();
    let stats = fixture.trie.collector().stats();
    assert!(stats.allocated_objects > 0);
}

#[test]
fn snapshots_are_isolated() {
    let fixture = Fixture::new();
    let snapshot = fixture.trie.snapshot().unwrap();

    assert_eq!(fixture.trie.remove("bb").unwrap(), Some(2));
    fixture.trie.insert("new-in-original", 1).unwrap();
    snapshot.insert("new-in-snapshot", 2).unwrap();
    assert_eq!(snapshot.remove("ccc").unwrap(), Some(3));

    assert_eq!(snapshot.lookup("bb").unwrap(), Some(2));
    assert_eq!(snapshot.lookup("new-in-original").unwrap(), None);
    assert_eq!(fixture.trie.lookup("ccc").unwrap(), Some(3));
    assert_eq!(fixture.trie.lookup("new-in-snapshot").unwrap(), None);

    let collector = fixture.trie.collector();
    let roots: HashSet<_> = collector.roots().into_iter().collect();
    let expected: HashSet<_> = fixture
        .trie
        .roots()
        .into_iter()
        .chain(snapshot.roots())
        .collect();
    assert_eq!(roots, expected);

    drop(snapshot);
    fixture.trie.insert("bb", 2).unwrap();
    fixture.assert_intact();
}

#[test]
fn snapshot_survives_collections_until_dropped() {
    let collector = Collector::new(Config {
        cycle_interval: None,
        ..Config::default()
    });
    let trie = Ctrie::<usize>::new(&collector).unwrap();
    for index in 0..300 {
        trie.insert(&format!("old{}", index), index).unwrap();
    }
    let snapshot = trie.snapshot().unwrap();
    for index in 0..300 {
        assert_eq!(trie.remove(&format!("old{}", index)).unwrap(), Some(index));
        trie.insert(&format!("new{}", index), index).unwrap();
    }

    Ctrie::<usize>::collect(&collector).unwrap();
    Ctrie::<usize>::collect(&collector).unwrap();
    for index in 0..300 {
        assert_eq!(snapshot.lookup(&format!("old{}", index)).unwrap(), Some(index));
        assert_eq!(snapshot.lookup(&format!("new{}", index)).unwrap(), None);
        assert_eq!(trie.lookup(&format!("new{}", index)).unwrap(), Some(index));
    }
    let with_snapshot = collector.stats().live_objects;

    drop(snapshot);
    Ctrie::<usize>::collect(&collector).unwrap();
    Ctrie::<usize>::collect(&collector).unwrap();
    assert!(collector.stats().live_objects < with_snapshot);
    for index in 0..300 {
        assert_eq!(trie.lookup(&format!("old{}", index)).unwrap(), None);
        assert_eq!(trie.lookup(&format!("new{}", index)).unwrap(), Some(index));
    }
}

#[test]
fn snapshot_of_snapshot() {
    let collector = Collector::new(Config::default());
    let trie = Ctrie::<u64>::new(&collector).unwrap();
    trie.insert("one", 1).unwrap();
    let first = trie.snapshot().unwrap();
    first.insert("two", 2).unwrap();
    let second = first.snapshot().unwrap();
    first.remove("one").unwrap();
    assert_eq!(second.lookup("one").unwrap(), Some(1));
    assert_eq!(second.lookup("two").unwrap(), Some(2));
    assert_eq!(trie.lookup("two").unwrap(), None);
    assert_eq!(first.lookup("one").unwrap(), None);
}

#[test]
fn colliding_hashes() {
    let collector = Collector::new(Config::default());
    let trie = Ctrie::<u32>::with_hasher(&collector, |_| 0).unwrap();
    for index in 0..20u32 {
        trie.insert(&format!("key{}", index), index).unwrap();
    }
    for index in 0..20u32 {
        assert_eq!(trie.lookup(&format!("key{}", index)).unwrap(), Some(index));
    }
    for index in (0..20u32).step_by(2) {
        assert_eq!(trie.remove(&format!("key{}", index)).unwrap(), Some(index));
    }
    for index in 0..20u32 {
        let expected = (index % 2 == 1).then_some(index);
        assert_eq!(trie.lookup(&format!("key{}", index)).unwrap(), expected);
    }
    let snapshot = trie.snapshot().unwrap();
    for index in (1..20u32).step_by(2) {
        assert_eq!(trie.remove(&format!("key{}", index)).unwrap(), Some(index));
    }
    assert_eq!(trie.lookup("key1").unwrap(), None);
    assert_eq!(snapshot.lookup("key1").unwrap(), Some(1));
}

#[test]
fn partial_collisions_below_the_root() {
    let collector = Collector::new(Config::default());
    // Three buckets of fully colliding keys.
    let trie = Ctrie::<usize>::with_hasher(&collector, |key| (key.len() % 3) as u64).unwrap();
    let keys: Vec<String> = (0..30).map(|index| "p".repeat(index + 1)).collect();
    for (index, key) in keys.iter().enumerate() {
        trie.insert(key, index).unwrap();
    }
    for (index, key) in keys.iter().enumerate() {
        assert_eq!(trie.lookup(key).unwrap(), Some(index));
    }
    for (index, key) in keys.iter().enumerate() {
        assert_eq!(trie.remove(key).unwrap(), Some(index));
    }
    assert!(keys.iter().all(|key| trie.lookup(key).unwrap().is_none()));
}
