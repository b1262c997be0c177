use crate::errors::GcError;
use atomic::Ordering;
use modular_bitfield::prelude::*;
use std::{fmt, mem::size_of, sync::atomic::AtomicU64};

// Every heap object is prefixed with one header word.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | color           |    2 | Epoch color, doubles as the mark state.  |
// | tag             |    4 | NodeTag of the payload.                  |
// | count           |   58 | Element count of vector segments, 0 for  |
// |                 |      | fixed-size kinds.                        |
// +-----------------+------+------------------------------------------+
//
// Log-pointer slots, when a kind has any, sit immediately before the
// header word.

pub const COLOR_BITS: u32 = 2;
pub const TAG_BITS: u32 = 4;
pub const COLOR_MASK: u64 = (1 << COLOR_BITS) - 1;
pub const TAG_MASK: u64 = ((1 << TAG_BITS) - 1) << COLOR_BITS;
pub const HEADER_SIZE: usize = size_of::<u64>();

/// Closed alphabet of heap object kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum NodeTag {
    Inode = 0,
    Cnode = 1,
    Snode = 2,
    Tnode = 3,
    Lnode = 4,
    Failure = 5,
    BranchVector = 6,
    StringVector = 7,
    PlistNode = 8,
    Rdcss = 9,
}

impl NodeTag {
    pub const ALL: [NodeTag; 10] = [
        NodeTag::Inode,
        NodeTag::Cnode,
        NodeTag::Snode,
        NodeTag::Tnode,
        NodeTag::Lnode,
        NodeTag::Failure,
        NodeTag::BranchVector,
        NodeTag::StringVector,
        NodeTag::PlistNode,
        NodeTag::Rdcss,
    ];

    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => NodeTag::Inode,
            1 => NodeTag::Cnode,
            2 => NodeTag::Snode,
            3 => NodeTag::Tnode,
            4 => NodeTag::Lnode,
            5 => NodeTag::Failure,
            6 => NodeTag::BranchVector,
            7 => NodeTag::StringVector,
            8 => NodeTag::PlistNode,
            9 => NodeTag::Rdcss,
            _ => return None,
        })
    }
}

/// Epoch color. The collector alternates between two colors, an object
/// carrying the current one is considered marked.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Color(u8);

impl Color {
    pub const INITIAL: Color = Color(1);

    pub const fn new(bits: u8) -> Self {
        Self(bits & COLOR_MASK as u8)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// The other epoch color.
    pub const fn flipped(self) -> Self {
        match self.0 {
            1 => Color(2),
            _ => Color(1),
        }
    }
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy, PartialEq, Eq)]
struct EncodedHeader {
    color: B2,
    tag: B4,
    count: B58,
}

/// Decoded, always valid header word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    bits: EncodedHeader,
}

impl Header {
    pub const MAX_COUNT: usize = (1 << 58) - 1;

    /// Packs `tag`, `color` and `count` into one word.
    ///
    /// `count` is truncated to the 58 bits the field provides.
    pub fn encode(tag: NodeTag, color: Color, count: usize) -> Self {
        let bits = EncodedHeader::new()
            .with_color(color.bits())
            .with_tag(tag as u8)
            .with_count((count & Self::MAX_COUNT) as u64);
        Self { bits }
    }

    pub fn decode(self) -> (NodeTag, Color, usize) {
        (self.tag(), self.color(), self.count())
    }

    /// Validates a raw header word, rejecting tags outside the alphabet.
    pub fn from_raw(raw: u64) -> Result<Self, GcError> {
        let bits = EncodedHeader::from_bytes(raw.to_le_bytes());
        match NodeTag::from_bits(bits.tag()) {
            Some(_) => Ok(Self { bits }),
            None => Err(GcError::CorruptHeader { raw }),
        }
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        u64::from_le_bytes(self.bits.into_bytes())
    }

    #[inline(always)]
    pub fn tag(self) -> NodeTag {
        match NodeTag::from_bits(self.bits.tag()) {
            Some(tag) => tag,
            None => corrupt_header(self.raw(), std::ptr::null_mut()),
        }
    }

    #[inline(always)]
    pub fn color(self) -> Color {
        Color(self.bits.color())
    }

    #[inline(always)]
    pub fn count(self) -> usize {
        self.bits.count() as usize
    }

    /// Same tag and count, different color.
    #[inline(always)]
    pub fn recolored(self, color: Color) -> Self {
        Self {
            bits: self.bits.with_color(color.bits()),
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("tag", &self.tag())
            .field("color", &self.color().bits())
            .field("count", &self.count())
            .finish()
    }
}

/// In-memory header word. Written by the allocator once and afterwards only
/// re-colored, always through atomic read-modify-write on the color bits.
#[repr(transparent)]
pub struct HeapObjectHeader {
    word: AtomicU64,
}

impl HeapObjectHeader {
    pub(crate) fn new(header: Header) -> Self {
        Self {
            word: AtomicU64::new(header.raw()),
        }
    }

    /// Header preceding the payload at `object`.
    ///
    /// # Safety
    /// `object` must be the payload address of a live heap allocation.
    #[inline(always)]
    pub unsafe fn from_object<'a>(object: *const u8) -> &'a Self {
        &*object.sub(HEADER_SIZE).cast::<Self>()
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + HEADER_SIZE) as _
    }

    #[inline]
    pub fn load(&self) -> Header {
        let raw = self.word.load(Ordering::Acquire);
        Header::from_raw(raw).unwrap_or_else(|_| corrupt_header(raw, self.payload()))
    }

    #[inline(always)]
    pub fn color(&self) -> Color {
        Color((self.word.load(Ordering::Acquire) & COLOR_MASK) as u8)
    }

    /// Replaces the color bits, leaving tag and count untouched.
    pub fn recolor(&self, color: Color) {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some((raw & !COLOR_MASK) | color.bits() as u64)
            });
    }

    /// Sets `color` if the object does not carry it yet. Returns `true` when
    /// this call changed the color.
    pub fn try_mark(&self, color: Color) -> bool {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if (raw & COLOR_MASK) as u8 == color.bits() {
                    None
                } else {
                    Some((raw & !COLOR_MASK) | color.bits() as u64)
                }
            })
            .is_ok()
    }
}

#[cold]
#[inline(never)]
fn corrupt_header(raw: u64, object: *mut u8) -> ! {
    tracing::error!(raw, ?object, "corrupt object header");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode() {
        for tag in NodeTag::ALL {
            let header = Header::encode(tag, Color::INITIAL, 17);
            assert_eq!(header.decode(), (tag, Color::INITIAL, 17));
        }
    }

    #[test]
    fn tag_sits_above_color_and_count_above_tag() {
        let header = Header::encode(NodeTag::StringVector, Color::new(2), 5);
        let raw = header.raw();
        assert_eq!(raw & COLOR_MASK, 2);
        assert_eq!((raw & TAG_MASK) >> COLOR_BITS, NodeTag::StringVector as u64);
        assert_eq!(raw >> (COLOR_BITS + TAG_BITS), 5);
    }

    #[test]
    fn recolor_keeps_tag_and_count() {
        let header = Header::encode(NodeTag::BranchVector, Color::INITIAL, 31);
        let recolored = header.recolored(Color::INITIAL.flipped());
        assert_eq!(recolored.tag(), NodeTag::BranchVector);
        assert_eq!(recolored.count(), 31);
        assert_eq!(recolored.color(), Color::new(2));
        assert_eq!(recolored.raw() & !COLOR_MASK, header.raw() & !COLOR_MASK);
    }

    #[test]
    fn in_memory_recolor_and_mark() {
        let cell = HeapObjectHeader::new(Header::encode(NodeTag::Cnode, Color::INITIAL, 0));
        assert!(!cell.try_mark(Color::INITIAL));
        assert!(cell.try_mark(Color::INITIAL.flipped()));
        assert_eq!(cell.load().tag(), NodeTag::Cnode);
        cell.recolor(Color::INITIAL);
        assert_eq!(cell.color(), Color::INITIAL);
        assert_eq!(cell.load().count(), 0);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = (12u64 << COLOR_BITS) | 1;
        assert!(matches!(
            Header::from_raw(raw),
            Err(GcError::CorruptHeader { raw: r }) if r == raw
        ));
    }

    #[test]
    fn colors_alternate() {
        assert_eq!(Color::INITIAL.flipped().flipped(), Color::INITIAL);
        assert_ne!(Color::INITIAL.flipped(), Color::INITIAL);
    }
}
