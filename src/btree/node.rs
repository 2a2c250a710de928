//! Fixed-layout node codec and in-node search.
//!
//! A page is a little-endian block: `type:u16 | nkeys:u16`, then (internal
//! nodes only) `nkeys` child page ids of 8 bytes, then `nkeys` cumulative
//! entry-end offsets of 2 bytes (the offset before entry 0 is implicitly
//! zero), then the packed entries, each `klen:u16 | vlen:u16 | key | value`.
//! Internal entries carry an empty value; the child pointer lives in the
//! id array instead.

use std::cmp::Ordering;
use std::convert::TryInto;

use crate::types::{Error, PageId, Result};

/// Fixed page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Bytes taken by the `type | nkeys` node header.
pub const HEADER_LEN: usize = 4;
/// Maximum accepted key length.
pub const MAX_KEY_LEN: usize = 1000;
/// Maximum accepted value length.
pub const MAX_VAL_LEN: usize = 3000;

const CHILD_LEN: usize = 8;
const OFFSET_LEN: usize = 2;
const ENTRY_PREFIX_LEN: usize = 4;

/// Working buffers hold up to two pages so one oversized insert can be
/// staged before the split pass brings every node back under capacity.
pub(crate) const WORK_BUF_LEN: usize = 2 * PAGE_SIZE;

// One maximal entry plus header, child pointer, offset slot and length
// prefixes must stage inside the working buffer.
const _: () = assert!(
    HEADER_LEN + CHILD_LEN + OFFSET_LEN + ENTRY_PREFIX_LEN + MAX_KEY_LEN + MAX_VAL_LEN
        <= WORK_BUF_LEN
);

/// Logical kind of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Internal node: child page ids plus one separator key per child.
    Internal = 1,
    /// Leaf node: ordered key/value pairs.
    Leaf = 2,
}

impl NodeKind {
    /// Parse the on-page type tag.
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            _ => Err(Error::Corruption("unknown node type tag")),
        }
    }
}

/// Decoded, independently-owned view of one page.
///
/// A `Node` is a transient value: it is produced either by [`Node::decode`]
/// on a fetched page or by a builder constructing a replacement, and its
/// content is committed through [`Node::page`] before the value is dropped.
pub struct Node {
    kind: NodeKind,
    buf: Vec<u8>,
}

impl Node {
    /// Start a node in a zeroed double-page working buffer.
    pub fn build(kind: NodeKind, nkeys: u16) -> Self {
        let mut node = Self {
            kind,
            buf: vec![0u8; WORK_BUF_LEN],
        };
        node.set_header(kind, nkeys);
        node
    }

    /// Decode and validate a fetched page.
    ///
    /// Every inconsistency is fatal ([`Error::Corruption`]): guessing the
    /// intent of a damaged page risks silently returning wrong data.
    pub fn decode(page: Vec<u8>) -> Result<Self> {
        if page.len() < HEADER_LEN {
            return Err(Error::Corruption("page shorter than header"));
        }
        let kind = NodeKind::from_u16(read_u16(&page, 0))?;
        let node = Self { kind, buf: page };
        let nkeys = node.nkeys();
        let entries_base = node.offsets_pos() + OFFSET_LEN * nkeys as usize;
        if entries_base > node.buf.len() {
            return Err(Error::Corruption("entry arrays exceed page"));
        }
        let mut prev = 0u16;
        for idx in 1..=nkeys {
            let off = node.offset(idx);
            if off < prev {
                return Err(Error::Corruption("non-monotonic entry offsets"));
            }
            prev = off;
        }
        if entries_base + prev as usize > node.buf.len() {
            return Err(Error::Corruption("entry data exceeds page"));
        }
        for idx in 0..nkeys {
            let span = (node.offset(idx + 1) - node.offset(idx)) as usize;
            if span < ENTRY_PREFIX_LEN {
                return Err(Error::Corruption("entry shorter than length prefixes"));
            }
            let pos = node.entry_pos(idx);
            let klen = read_u16(&node.buf, pos) as usize;
            let vlen = read_u16(&node.buf, pos + 2) as usize;
            if ENTRY_PREFIX_LEN + klen + vlen != span {
                return Err(Error::Corruption("length prefixes disagree with offsets"));
            }
            if kind == NodeKind::Internal && node.child(idx).is_none() {
                return Err(Error::Corruption("internal child pointer is zero"));
            }
        }
        Ok(node)
    }

    /// Node kind recorded in the header.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Number of entries (and, for internal nodes, children).
    pub fn nkeys(&self) -> u16 {
        read_u16(&self.buf, 2)
    }

    /// Write the header, fixing the node kind and entry count for all
    /// subsequent position arithmetic.
    pub fn set_header(&mut self, kind: NodeKind, nkeys: u16) {
        self.kind = kind;
        write_u16(&mut self.buf, 0, kind as u16);
        write_u16(&mut self.buf, 2, nkeys);
    }

    /// Child page id at `idx`. Internal nodes only.
    pub fn child(&self, idx: u16) -> Option<PageId> {
        debug_assert_eq!(self.kind, NodeKind::Internal);
        debug_assert!(idx < self.nkeys());
        let pos = HEADER_LEN + CHILD_LEN * idx as usize;
        crate::types::decode_page_id(read_u64(&self.buf, pos))
    }

    fn set_child(&mut self, idx: u16, child: PageId) {
        debug_assert_eq!(self.kind, NodeKind::Internal);
        let pos = HEADER_LEN + CHILD_LEN * idx as usize;
        write_u64(&mut self.buf, pos, child.0);
    }

    fn child_area_len(&self) -> usize {
        match self.kind {
            NodeKind::Internal => CHILD_LEN * self.nkeys() as usize,
            NodeKind::Leaf => 0,
        }
    }

    fn offsets_pos(&self) -> usize {
        HEADER_LEN + self.child_area_len()
    }

    /// Cumulative end offset of entry `idx - 1`; zero for `idx == 0`.
    fn offset(&self, idx: u16) -> u16 {
        if idx == 0 {
            return 0;
        }
        let pos = self.offsets_pos() + OFFSET_LEN * (idx - 1) as usize;
        read_u16(&self.buf, pos)
    }

    fn set_offset(&mut self, idx: u16, offset: u16) {
        debug_assert!(idx >= 1);
        let pos = self.offsets_pos() + OFFSET_LEN * (idx - 1) as usize;
        write_u16(&mut self.buf, pos, offset);
    }

    /// Byte position of entry `idx` in the packed data region; `idx ==
    /// nkeys` yields the end of the encoded node.
    fn entry_pos(&self, idx: u16) -> usize {
        self.offsets_pos() + OFFSET_LEN * self.nkeys() as usize + self.offset(idx) as usize
    }

    /// Key bytes of entry `idx`.
    pub fn key(&self, idx: u16) -> &[u8] {
        debug_assert!(idx < self.nkeys());
        let pos = self.entry_pos(idx);
        let klen = read_u16(&self.buf, pos) as usize;
        &self.buf[pos + ENTRY_PREFIX_LEN..pos + ENTRY_PREFIX_LEN + klen]
    }

    /// Value bytes of entry `idx`. Empty for internal entries.
    pub fn val(&self, idx: u16) -> &[u8] {
        debug_assert!(idx < self.nkeys());
        let pos = self.entry_pos(idx);
        let klen = read_u16(&self.buf, pos) as usize;
        let vlen = read_u16(&self.buf, pos + 2) as usize;
        let start = pos + ENTRY_PREFIX_LEN + klen;
        &self.buf[start..start + vlen]
    }

    /// Total encoded size: header, child ids, offsets, and packed entries.
    pub fn encoded_len(&self) -> usize {
        self.entry_pos(self.nkeys())
    }

    /// Encoded size the entries `[from, to)` would have as their own node,
    /// counting one header plus per-entry child ids and offset slots.
    pub(crate) fn range_len(&self, from: u16, to: u16) -> usize {
        debug_assert!(from <= to && to <= self.nkeys());
        let n = (to - from) as usize;
        let per_entry = match self.kind {
            NodeKind::Internal => CHILD_LEN + OFFSET_LEN,
            NodeKind::Leaf => OFFSET_LEN,
        };
        HEADER_LEN + per_entry * n + (self.offset(to) - self.offset(from)) as usize
    }

    /// Largest index whose key is `<=` the target, scanning from index 1:
    /// the first key of an internal node is a sentinel copied from its
    /// first child and compares `<=` everything reachable below it.
    pub fn lookup_le(&self, key: &[u8]) -> u16 {
        let nkeys = self.nkeys();
        let mut found = 0;
        for idx in 1..nkeys {
            match self.key(idx).cmp(key) {
                Ordering::Less => found = idx,
                Ordering::Equal => return idx,
                Ordering::Greater => break,
            }
        }
        found
    }

    /// Copy `n` entries of `src` starting at `src_idx` into this node at
    /// `dst_idx`, rebasing the offset table by the cumulative size delta.
    /// Entries at `[0, dst_idx)` must already be in place.
    pub fn append_range(&mut self, src: &Node, dst_idx: u16, src_idx: u16, n: u16) {
        debug_assert_eq!(self.kind, src.kind);
        debug_assert!(src_idx + n <= src.nkeys());
        debug_assert!(dst_idx + n <= self.nkeys());
        if n == 0 {
            return;
        }
        if self.kind == NodeKind::Internal {
            for i in 0..n {
                if let Some(child) = src.child(src_idx + i) {
                    self.set_child(dst_idx + i, child);
                }
            }
        }
        let dst_begin = self.offset(dst_idx);
        let src_begin = src.offset(src_idx);
        for i in 1..=n {
            let rebased = dst_begin + (src.offset(src_idx + i) - src_begin);
            self.set_offset(dst_idx + i, rebased);
        }
        let from = src.entry_pos(src_idx);
        let to = src.entry_pos(src_idx + n);
        let at = self.entry_pos(dst_idx);
        self.buf[at..at + (to - from)].copy_from_slice(&src.buf[from..to]);
    }

    /// Write one entry at `idx`, updating the child array (internal nodes),
    /// data region, and the offset slot for `idx + 1`. Entries must be
    /// appended left to right.
    pub fn append_entry(&mut self, idx: u16, child: Option<PageId>, key: &[u8], val: &[u8]) {
        debug_assert!(idx < self.nkeys());
        debug_assert_eq!(child.is_some(), self.kind == NodeKind::Internal);
        if let Some(child) = child {
            self.set_child(idx, child);
        }
        let pos = self.entry_pos(idx);
        write_u16(&mut self.buf, pos, key.len() as u16);
        write_u16(&mut self.buf, pos + 2, val.len() as u16);
        self.buf[pos + ENTRY_PREFIX_LEN..pos + ENTRY_PREFIX_LEN + key.len()].copy_from_slice(key);
        let vpos = pos + ENTRY_PREFIX_LEN + key.len();
        self.buf[vpos..vpos + val.len()].copy_from_slice(val);
        let end = self.offset(idx) + (ENTRY_PREFIX_LEN + key.len() + val.len()) as u16;
        self.set_offset(idx + 1, end);
    }

    /// Committed single-page image of the node.
    ///
    /// Failing the capacity check here means a mutation skipped its split
    /// pass; aborting is required because a committed oversized page would
    /// corrupt persisted state irrecoverably.
    pub fn page(&self) -> Result<&[u8]> {
        if self.encoded_len() > PAGE_SIZE {
            return Err(Error::Corruption("node exceeds one page"));
        }
        Ok(&self.buf[..PAGE_SIZE])
    }
}

fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap())
}

fn write_u64(buf: &mut [u8], pos: usize, value: u64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
}
