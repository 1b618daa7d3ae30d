//! Slotted-page format for B-tree pages.
//!
//! Every page carries the fixed outer header (see [`crate::types::page`])
//! followed by the payload this module owns: a 36-byte payload header, a slot
//! directory growing upward, and record bytes growing downward from the end
//! of the page. Slot order is key order; record placement is arbitrary.
//!
//! Mutations do not shuffle bytes in place. Callers [`snapshot`] a page into
//! owned [`RecEntry`] values, edit the vector, [`build_layout`] to check fit,
//! and [`apply_layout`] to rewrite the payload. A rebuild is also a
//! reorganize: it packs records densely and clears the last-insert marker.

use core::ops::Range;

use smallvec::SmallVec;

use crate::types::{page::PAGE_HDR_LEN, Error, IndexId, PageId, Result};

/// Length of the payload header in bytes.
pub const PAYLOAD_HDR_LEN: usize = 36;
/// Bytes per slot directory entry: record offset and record length, both u16.
pub const SLOT_ENTRY_LEN: usize = 4;
/// Info bit marking the leftmost record of a non-leaf level.
pub const REC_INFO_MIN_REC: u8 = 0x01;
/// Fixed prefix of a node-pointer record: info byte, child id, key length.
pub const NODE_PTR_HDR_LEN: usize = 1 + 8 + 2;

/// Byte offsets of the payload header fields, relative to the payload.
pub mod hdr {
    use core::ops::Range;

    /// Level, u16; 0 is a leaf.
    pub const LEVEL: Range<usize> = 0..2;
    /// Flag byte, reserved.
    pub const FLAGS: usize = 2;
    /// Always zero.
    pub const RESERVED: usize = 3;
    /// Live slot count, u16.
    pub const SLOT_COUNT: Range<usize> = 4..6;
    /// End of the slot directory, u16.
    pub const FREE_START: Range<usize> = 6..8;
    /// Start of the record area, u16.
    pub const FREE_END: Range<usize> = 8..10;
    /// Last-insert slot + 1, u16; 0 when cleared.
    pub const LAST_INSERT: Range<usize> = 10..12;
    /// Owning index id, u64.
    pub const INDEX_ID: Range<usize> = 12..20;
    /// Left sibling page id, u64; 0 when absent.
    pub const PREV_SIB: Range<usize> = 20..28;
    /// Right sibling page id, u64; 0 when absent.
    pub const NEXT_SIB: Range<usize> = 28..36;
}

/// The payload region of a full page image.
pub fn payload(page: &[u8]) -> &[u8] {
    &page[PAGE_HDR_LEN.min(page.len())..]
}

/// Mutable payload region of a full page image.
pub fn payload_mut(page: &mut [u8]) -> &mut [u8] {
    let start = PAGE_HDR_LEN.min(page.len());
    &mut page[start..]
}

fn read_u16(buf: &[u8], range: Range<usize>) -> u16 {
    u16::from_be_bytes(buf[range].try_into().unwrap())
}

fn read_u64(buf: &[u8], range: Range<usize>) -> u64 {
    u64::from_be_bytes(buf[range].try_into().unwrap())
}

fn sibling(raw: u64) -> Option<PageId> {
    if raw == 0 {
        None
    } else {
        Some(PageId(raw))
    }
}

/// Decoded payload header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Distance from the leaf level; 0 means leaf.
    pub level: u16,
    /// Reserved flag byte, currently always zero.
    pub flags: u8,
    /// Number of live slots.
    pub slot_count: usize,
    /// First free byte after the slot directory.
    pub free_start: usize,
    /// First used record byte; the free gap ends here.
    pub free_end: usize,
    /// Slot of the most recent in-place insert, if the page has not been
    /// rebuilt since. Drives the sequential-split heuristic.
    pub last_insert: Option<usize>,
    /// Owning index tree.
    pub index_id: IndexId,
    /// Left sibling at the same level.
    pub prev: Option<PageId>,
    /// Right sibling at the same level.
    pub next: Option<PageId>,
}

impl Header {
    /// Parse and cross-check the payload header.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < PAYLOAD_HDR_LEN {
            return Err(Error::Corruption("payload shorter than header"));
        }
        if payload.len() > u16::MAX as usize {
            return Err(Error::Corruption("payload exceeds addressable range"));
        }
        let level = read_u16(payload, hdr::LEVEL);
        let flags = payload[hdr::FLAGS];
        if payload[hdr::RESERVED] != 0 {
            return Err(Error::Corruption("payload header reserved byte not zero"));
        }
        let slot_count = read_u16(payload, hdr::SLOT_COUNT) as usize;
        let free_start = read_u16(payload, hdr::FREE_START) as usize;
        let free_end = read_u16(payload, hdr::FREE_END) as usize;
        if free_start != PAYLOAD_HDR_LEN + slot_count * SLOT_ENTRY_LEN {
            return Err(Error::Corruption("free_start disagrees with slot count"));
        }
        if free_start > free_end || free_end > payload.len() {
            return Err(Error::Corruption("free gap out of bounds"));
        }
        let last_raw = read_u16(payload, hdr::LAST_INSERT) as usize;
        if last_raw > slot_count {
            return Err(Error::Corruption("last-insert marker past slot count"));
        }
        let last_insert = last_raw.checked_sub(1);
        let index_id = IndexId(read_u64(payload, hdr::INDEX_ID));
        let prev = sibling(read_u64(payload, hdr::PREV_SIB));
        let next = sibling(read_u64(payload, hdr::NEXT_SIB));
        Ok(Self {
            level,
            flags,
            slot_count,
            free_start,
            free_end,
            last_insert,
            index_id,
            prev,
            next,
        })
    }

    /// Whether this page stores user records.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Initialize the payload of a fresh page: empty slot directory, full free
/// gap, no siblings.
pub fn write_initial_header(payload: &mut [u8], level: u16, index_id: IndexId) -> Result<()> {
    if payload.len() < PAYLOAD_HDR_LEN + SLOT_ENTRY_LEN {
        return Err(Error::Invalid("payload too small for any record"));
    }
    if payload.len() > u16::MAX as usize {
        return Err(Error::Invalid("payload exceeds addressable range"));
    }
    let free_end = payload.len() as u16;
    payload[..PAYLOAD_HDR_LEN].fill(0);
    payload[hdr::LEVEL].copy_from_slice(&level.to_be_bytes());
    payload[hdr::FREE_START].copy_from_slice(&(PAYLOAD_HDR_LEN as u16).to_be_bytes());
    payload[hdr::FREE_END].copy_from_slice(&free_end.to_be_bytes());
    payload[hdr::INDEX_ID].copy_from_slice(&index_id.0.to_be_bytes());
    Ok(())
}

/// Store the left sibling link, 0 meaning none.
pub fn set_prev(payload: &mut [u8], prev: Option<PageId>) {
    let raw = prev.map_or(0, |p| p.0);
    payload[hdr::PREV_SIB].copy_from_slice(&raw.to_be_bytes());
}

/// Store the right sibling link, 0 meaning none.
pub fn set_next(payload: &mut [u8], next: Option<PageId>) {
    let raw = next.map_or(0, |p| p.0);
    payload[hdr::NEXT_SIB].copy_from_slice(&raw.to_be_bytes());
}

/// Store the last-insert marker.
pub fn set_last_insert(payload: &mut [u8], slot: Option<usize>) {
    let raw = slot.map_or(0, |s| s as u16 + 1);
    payload[hdr::LAST_INSERT].copy_from_slice(&raw.to_be_bytes());
}

/// Where one record lives in the payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotExtent {
    /// Record offset within the payload.
    pub offset: usize,
    /// Record length in bytes.
    pub len: usize,
}

/// Parsed slot directory. Extents are validated against the free gap and
/// against each other before any record byte is trusted.
pub struct SlotExtents {
    extents: SmallVec<[SlotExtent; 16]>,
}

impl SlotExtents {
    /// Parse the slot directory described by `header`.
    pub fn parse(payload: &[u8], header: &Header) -> Result<Self> {
        let mut extents: SmallVec<[SlotExtent; 16]> = SmallVec::with_capacity(header.slot_count);
        for slot in 0..header.slot_count {
            let base = PAYLOAD_HDR_LEN + slot * SLOT_ENTRY_LEN;
            let offset = read_u16(payload, base..base + 2) as usize;
            let len = read_u16(payload, base + 2..base + 4) as usize;
            if len == 0 {
                return Err(Error::Corruption("zero-length slot extent"));
            }
            if offset < header.free_end || offset + len > payload.len() {
                return Err(Error::Corruption("slot extent outside record area"));
            }
            extents.push(SlotExtent { offset, len });
        }
        let mut by_offset: SmallVec<[SlotExtent; 16]> = extents.clone();
        by_offset.sort_unstable_by_key(|e| e.offset);
        for pair in by_offset.windows(2) {
            if pair[0].offset + pair[0].len > pair[1].offset {
                return Err(Error::Corruption("overlapping slot extents"));
            }
        }
        Ok(Self { extents })
    }

    /// Extent of `slot`.
    pub fn get(&self, slot: usize) -> Result<SlotExtent> {
        self.extents
            .get(slot)
            .copied()
            .ok_or(Error::Corruption("slot index out of range"))
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Iterate extents in slot (key) order.
    pub fn iter(&self) -> impl Iterator<Item = SlotExtent> + '_ {
        self.extents.iter().copied()
    }

    /// Sum of record bytes plus slot directory bytes.
    pub fn data_size(&self) -> usize {
        self.extents.iter().map(|e| e.len).sum::<usize>() + self.extents.len() * SLOT_ENTRY_LEN
    }
}

/// The record bytes behind one extent.
pub fn record<'a>(payload: &'a [u8], ext: &SlotExtent) -> &'a [u8] {
    &payload[ext.offset..ext.offset + ext.len]
}

pub mod var {
    //! Variable-length unsigned integers, 7 bits per byte, little groups
    //! first, high bit as continuation.

    use crate::types::{Error, Result};

    /// Append `value` to `out`.
    pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    /// Encoded length of `value`.
    pub fn encoded_len(mut value: u64) -> usize {
        let mut n = 1;
        while value >= 0x80 {
            value >>= 7;
            n += 1;
        }
        n
    }

    /// Read one value from the front of `buf`, returning it and the bytes
    /// consumed.
    pub fn read_u64(buf: &[u8]) -> Result<(u64, usize)> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for (i, &byte) in buf.iter().enumerate() {
            if shift >= 64 {
                return Err(Error::Corruption("varint overflows u64"));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok((value, i + 1));
            }
            shift += 7;
        }
        Err(Error::Corruption("varint truncated"))
    }
}

/// Borrowed view of a decoded leaf record.
#[derive(Debug, Eq, PartialEq)]
pub struct LeafRecordRef<'a> {
    /// Record info bits.
    pub info: u8,
    /// User key.
    pub key: &'a [u8],
    /// User value.
    pub value: &'a [u8],
}

/// Decode a leaf record: info byte, varint key length, varint value length,
/// key bytes, value bytes.
pub fn decode_leaf_record(rec: &[u8]) -> Result<LeafRecordRef<'_>> {
    if rec.is_empty() {
        return Err(Error::Corruption("empty leaf record"));
    }
    let info = rec[0];
    let mut at = 1;
    let (key_len, used) = var::read_u64(&rec[at..])?;
    at += used;
    let (val_len, used) = var::read_u64(&rec[at..])?;
    at += used;
    let key_len = usize::try_from(key_len)
        .map_err(|_| Error::Corruption("leaf record length mismatch"))?;
    let val_len = usize::try_from(val_len)
        .map_err(|_| Error::Corruption("leaf record length mismatch"))?;
    // The lengths are untrusted bytes; their sum must not be allowed to wrap.
    let total = at.checked_add(key_len).and_then(|t| t.checked_add(val_len));
    if total != Some(rec.len()) {
        return Err(Error::Corruption("leaf record length mismatch"));
    }
    Ok(LeafRecordRef {
        info,
        key: &rec[at..at + key_len],
        value: &rec[at + key_len..],
    })
}

/// Borrowed view of a decoded node-pointer record.
#[derive(Debug, Eq, PartialEq)]
pub struct NodePtrRef<'a> {
    /// Record info bits; the min-rec bit lives here.
    pub info: u8,
    /// The child page this pointer leads to.
    pub child: PageId,
    /// Separator key: lower bound of every key under `child`.
    pub key: &'a [u8],
}

/// Decode a node-pointer record: info byte, child id, u16 key length, key.
pub fn decode_node_ptr(rec: &[u8]) -> Result<NodePtrRef<'_>> {
    if rec.len() < NODE_PTR_HDR_LEN {
        return Err(Error::Corruption("node pointer truncated"));
    }
    let info = rec[0];
    let child = PageId(u64::from_be_bytes(rec[1..9].try_into().unwrap()));
    let key_len = u16::from_be_bytes(rec[9..11].try_into().unwrap()) as usize;
    if NODE_PTR_HDR_LEN + key_len != rec.len() {
        return Err(Error::Corruption("node pointer length mismatch"));
    }
    if child.0 == 0 {
        return Err(Error::Corruption("node pointer to page zero"));
    }
    Ok(NodePtrRef {
        info,
        child,
        key: &rec[NODE_PTR_HDR_LEN..],
    })
}

/// Rewrite the child-id field of a node pointer in place. The only in-place
/// record mutation the format permits; everything else goes through a
/// rebuild.
pub fn rewrite_node_ptr_child(payload: &mut [u8], ext: &SlotExtent, child: PageId) -> Result<()> {
    if ext.len < NODE_PTR_HDR_LEN || ext.offset + ext.len > payload.len() {
        return Err(Error::Corruption("node pointer extent out of bounds"));
    }
    payload[ext.offset + 1..ext.offset + 9].copy_from_slice(&child.0.to_be_bytes());
    Ok(())
}

/// One record in owned form, the unit the rebuild pipeline works with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecEntry {
    /// A user record on a leaf page.
    Leaf {
        /// Record info bits.
        info: u8,
        /// User key.
        key: Vec<u8>,
        /// User value.
        value: Vec<u8>,
    },
    /// A node pointer on a non-leaf page.
    NodePtr {
        /// Record info bits.
        info: u8,
        /// Separator key.
        key: Vec<u8>,
        /// Child page.
        child: PageId,
    },
}

impl RecEntry {
    /// The record's key.
    pub fn key(&self) -> &[u8] {
        match self {
            RecEntry::Leaf { key, .. } | RecEntry::NodePtr { key, .. } => key,
        }
    }

    /// The record's info bits.
    pub fn info(&self) -> u8 {
        match self {
            RecEntry::Leaf { info, .. } | RecEntry::NodePtr { info, .. } => *info,
        }
    }

    /// Whether the min-rec bit is set.
    pub fn is_min_rec(&self) -> bool {
        self.info() & REC_INFO_MIN_REC != 0
    }

    /// Set or clear the min-rec bit.
    pub fn set_min_rec(&mut self, on: bool) {
        let info = match self {
            RecEntry::Leaf { info, .. } | RecEntry::NodePtr { info, .. } => info,
        };
        if on {
            *info |= REC_INFO_MIN_REC;
        } else {
            *info &= !REC_INFO_MIN_REC;
        }
    }

    /// Encoded length in record bytes, excluding the slot entry.
    pub fn encoded_len(&self) -> usize {
        match self {
            RecEntry::Leaf { key, value, .. } => {
                1 + var::encoded_len(key.len() as u64)
                    + var::encoded_len(value.len() as u64)
                    + key.len()
                    + value.len()
            }
            RecEntry::NodePtr { key, .. } => NODE_PTR_HDR_LEN + key.len(),
        }
    }

    /// Append the encoded record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RecEntry::Leaf { info, key, value } => {
                out.push(*info);
                var::encode_u64(key.len() as u64, out);
                var::encode_u64(value.len() as u64, out);
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
            RecEntry::NodePtr { info, key, child } => {
                out.push(*info);
                out.extend_from_slice(&child.0.to_be_bytes());
                out.push((key.len() >> 8) as u8);
                out.push(key.len() as u8);
                out.extend_from_slice(key);
            }
        }
    }
}

/// Enforce min-rec placement on an entry vector: the bit belongs on the
/// first record of a non-leaf page with no left sibling, and nowhere else.
pub fn apply_min_rec_rule(entries: &mut [RecEntry], level: u16, has_prev: bool) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.set_min_rec(level > 0 && !has_prev && i == 0);
    }
}

/// A placement of entries that is known to fit a payload.
pub struct Layout {
    entries: Vec<RecEntry>,
    offsets: Vec<usize>,
    free_start: usize,
    free_end: usize,
}

impl Layout {
    /// The entries this layout places, in slot order.
    pub fn entries(&self) -> &[RecEntry] {
        &self.entries
    }

    /// Record bytes plus slot bytes the layout occupies.
    pub fn data_size(&self) -> usize {
        self.entries.iter().map(|e| e.encoded_len()).sum::<usize>()
            + self.entries.len() * SLOT_ENTRY_LEN
    }
}

/// Try to place `entries` into a payload of `payload_len` bytes. Returns
/// `Ok(None)` when they do not fit even densely packed.
pub fn build_layout(payload_len: usize, entries: Vec<RecEntry>) -> Result<Option<Layout>> {
    if payload_len < PAYLOAD_HDR_LEN || payload_len > u16::MAX as usize {
        return Err(Error::Invalid("payload length out of range"));
    }
    let free_start = PAYLOAD_HDR_LEN + entries.len() * SLOT_ENTRY_LEN;
    let mut cursor = payload_len;
    let mut offsets = Vec::with_capacity(entries.len());
    for entry in &entries {
        let len = entry.encoded_len();
        if len > u16::MAX as usize {
            return Err(Error::Invalid("record larger than addressable range"));
        }
        cursor = match cursor.checked_sub(len) {
            Some(c) => c,
            None => return Ok(None),
        };
        offsets.push(cursor);
    }
    if cursor < free_start {
        return Ok(None);
    }
    Ok(Some(Layout {
        entries,
        offsets,
        free_start,
        free_end: cursor,
    }))
}

/// Rewrite a payload from a layout. The page identity fields (`level`,
/// `index_id`, siblings) are supplied by the caller; the last-insert marker
/// is cleared, so every rebuild doubles as a reorganize.
pub fn apply_layout(
    payload: &mut [u8],
    level: u16,
    index_id: IndexId,
    prev: Option<PageId>,
    next: Option<PageId>,
    layout: &Layout,
) -> Result<()> {
    write_initial_header(payload, level, index_id)?;
    set_prev(payload, prev);
    set_next(payload, next);
    payload[hdr::SLOT_COUNT].copy_from_slice(&(layout.entries.len() as u16).to_be_bytes());
    payload[hdr::FREE_START].copy_from_slice(&(layout.free_start as u16).to_be_bytes());
    payload[hdr::FREE_END].copy_from_slice(&(layout.free_end as u16).to_be_bytes());
    // Stale bytes from the previous layout must not survive a rebuild; the
    // compressed twin and the checksum cover the whole payload.
    payload[PAYLOAD_HDR_LEN..].fill(0);
    let mut scratch = Vec::new();
    for (slot, (entry, &offset)) in layout.entries.iter().zip(&layout.offsets).enumerate() {
        scratch.clear();
        entry.encode(&mut scratch);
        payload[offset..offset + scratch.len()].copy_from_slice(&scratch);
        let base = PAYLOAD_HDR_LEN + slot * SLOT_ENTRY_LEN;
        payload[base..base + 2].copy_from_slice(&(offset as u16).to_be_bytes());
        payload[base + 2..base + 4].copy_from_slice(&(scratch.len() as u16).to_be_bytes());
    }
    Ok(())
}

/// Decode every record of a payload into owned entries, in slot order.
pub fn snapshot(payload: &[u8]) -> Result<(Header, Vec<RecEntry>)> {
    let header = Header::parse(payload)?;
    let extents = SlotExtents::parse(payload, &header)?;
    let mut entries = Vec::with_capacity(extents.len());
    for ext in extents.iter() {
        let rec = record(payload, &ext);
        let entry = if header.is_leaf() {
            let leaf = decode_leaf_record(rec)?;
            RecEntry::Leaf {
                info: leaf.info,
                key: leaf.key.to_vec(),
                value: leaf.value.to_vec(),
            }
        } else {
            let ptr = decode_node_ptr(rec)?;
            RecEntry::NodePtr {
                info: ptr.info,
                key: ptr.key.to_vec(),
                child: ptr.child,
            }
        };
        entries.push(entry);
    }
    Ok((header, entries))
}

/// The key stored at `slot`, decoded per the page's level.
pub fn key_at<'a>(
    payload: &'a [u8],
    header: &Header,
    extents: &SlotExtents,
    slot: usize,
) -> Result<&'a [u8]> {
    let ext = extents.get(slot)?;
    let rec = record(payload, &ext);
    if header.is_leaf() {
        Ok(decode_leaf_record(rec)?.key)
    } else {
        Ok(decode_node_ptr(rec)?.key)
    }
}

/// Largest record that fits without a rebuild: the free gap minus its slot
/// entry.
pub fn max_insert_size(header: &Header) -> usize {
    (header.free_end - header.free_start).saturating_sub(SLOT_ENTRY_LEN)
}

/// Largest record that fits after packing the page densely.
pub fn max_insert_size_after_reorg(payload_len: usize, occupied: usize) -> usize {
    (payload_len - PAYLOAD_HDR_LEN)
        .saturating_sub(occupied)
        .saturating_sub(SLOT_ENTRY_LEN)
}

/// Percentage of the record area in use, for allocator placement hints.
pub fn fill_pct(payload_len: usize, occupied: usize) -> u8 {
    let capacity = payload_len - PAYLOAD_HDR_LEN;
    ((occupied * 100) / capacity.max(1)).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &[u8], value: &[u8]) -> RecEntry {
        RecEntry::Leaf {
            info: 0,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn initial_header_is_empty_page() {
        let mut payload = vec![0u8; 512];
        write_initial_header(&mut payload, 3, IndexId(9)).unwrap();
        let header = Header::parse(&payload).unwrap();
        assert_eq!(header.level, 3);
        assert_eq!(header.slot_count, 0);
        assert_eq!(header.free_start, PAYLOAD_HDR_LEN);
        assert_eq!(header.free_end, 512);
        assert_eq!(header.index_id, IndexId(9));
        assert_eq!(header.prev, None);
        assert_eq!(header.next, None);
        assert_eq!(header.last_insert, None);
    }

    #[test]
    fn layout_roundtrips_leaf_records() {
        let mut payload = vec![0u8; 512];
        let entries = vec![leaf(b"apple", b"1"), leaf(b"pear", b"2"), leaf(b"plum", b"3")];
        let layout = build_layout(payload.len(), entries.clone()).unwrap().unwrap();
        apply_layout(&mut payload, 0, IndexId(1), None, Some(PageId(7)), &layout).unwrap();
        let (header, decoded) = snapshot(&payload).unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(header.next, Some(PageId(7)));
        assert_eq!(header.last_insert, None);
    }

    #[test]
    fn layout_roundtrips_node_pointers() {
        let mut payload = vec![0u8; 256];
        let entries = vec![
            RecEntry::NodePtr {
                info: REC_INFO_MIN_REC,
                key: b"a".to_vec(),
                child: PageId(4),
            },
            RecEntry::NodePtr {
                info: 0,
                key: b"m".to_vec(),
                child: PageId(5),
            },
        ];
        let layout = build_layout(payload.len(), entries.clone()).unwrap().unwrap();
        apply_layout(&mut payload, 1, IndexId(2), None, None, &layout).unwrap();
        let (_, decoded) = snapshot(&payload).unwrap();
        assert_eq!(decoded, entries);
        assert!(decoded[0].is_min_rec());
    }

    #[test]
    fn build_layout_reports_overflow_as_none() {
        let entries = vec![leaf(&[0u8; 100], &[0u8; 100])];
        assert!(build_layout(PAYLOAD_HDR_LEN + 64, entries).unwrap().is_none());
    }

    #[test]
    fn child_rewrite_is_in_place() {
        let mut payload = vec![0u8; 256];
        let entries = vec![RecEntry::NodePtr {
            info: 0,
            key: b"k".to_vec(),
            child: PageId(10),
        }];
        let layout = build_layout(payload.len(), entries).unwrap().unwrap();
        apply_layout(&mut payload, 2, IndexId(1), None, None, &layout).unwrap();
        let header = Header::parse(&payload).unwrap();
        let extents = SlotExtents::parse(&payload, &header).unwrap();
        let ext = extents.get(0).unwrap();
        rewrite_node_ptr_child(&mut payload, &ext, PageId(99)).unwrap();
        let ptr = decode_node_ptr(record(&payload, &ext)).unwrap();
        assert_eq!(ptr.child, PageId(99));
        assert_eq!(ptr.key, b"k");
    }

    #[test]
    fn min_rec_rule_targets_first_nonleaf_record_only() {
        let mut entries = vec![
            RecEntry::NodePtr {
                info: 0,
                key: b"a".to_vec(),
                child: PageId(2),
            },
            RecEntry::NodePtr {
                info: REC_INFO_MIN_REC,
                key: b"b".to_vec(),
                child: PageId(3),
            },
        ];
        apply_min_rec_rule(&mut entries, 1, false);
        assert!(entries[0].is_min_rec());
        assert!(!entries[1].is_min_rec());
        apply_min_rec_rule(&mut entries, 1, true);
        assert!(!entries[0].is_min_rec());
    }

    #[test]
    fn parse_rejects_inconsistent_free_start() {
        let mut payload = vec![0u8; 128];
        write_initial_header(&mut payload, 0, IndexId(1)).unwrap();
        payload[hdr::SLOT_COUNT].copy_from_slice(&5u16.to_be_bytes());
        assert!(matches!(
            Header::parse(&payload),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn parse_rejects_overlapping_extents() {
        let mut payload = vec![0u8; 256];
        let entries = vec![leaf(b"a", b"xx"), leaf(b"b", b"yy")];
        let layout = build_layout(payload.len(), entries).unwrap().unwrap();
        apply_layout(&mut payload, 0, IndexId(1), None, None, &layout).unwrap();
        // Point slot 1 at slot 0's extent.
        let base0 = PAYLOAD_HDR_LEN;
        let base1 = PAYLOAD_HDR_LEN + SLOT_ENTRY_LEN;
        let (off, len) = (
            payload[base0..base0 + 2].to_vec(),
            payload[base0 + 2..base0 + 4].to_vec(),
        );
        payload[base1..base1 + 2].copy_from_slice(&off);
        payload[base1 + 2..base1 + 4].copy_from_slice(&len);
        let header = Header::parse(&payload).unwrap();
        assert!(SlotExtents::parse(&payload, &header).is_err());
    }

    #[test]
    fn leaf_record_with_absurd_lengths_is_corrupt() {
        let mut rec = vec![0u8];
        var::encode_u64(u64::MAX, &mut rec);
        var::encode_u64(1, &mut rec);
        rec.push(b'x');
        assert!(matches!(
            decode_leaf_record(&rec),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            var::encode_u64(v, &mut buf);
            assert_eq!(buf.len(), var::encoded_len(v));
            let (decoded, used) = var::read_u64(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(used, buf.len());
        }
    }
}
