//! Identifier newtypes, the crate error type, and the fixed outer page header
//! shared by every page in a space.

use std::fmt;

/// Identifier of a tablespace (a collection of index trees sharing one
/// allocator).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Identifier of one index tree within a space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u64);

/// Identifier of a page within a space. Page number 0 is never handed out;
/// the engine uses it as the "no page" sentinel in sibling links.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The page cache could not honor a read.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Byte-level page damage detected while decoding.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A tree invariant violation, reported with full identification.
    #[error("corruption: {detail} (space {space}, index {index}, page {page})")]
    CorruptPage {
        /// Space the damaged page belongs to.
        space: SpaceId,
        /// Index tree the damaged page belongs to.
        index: IndexId,
        /// The damaged page.
        page: PageId,
        /// What was violated.
        detail: &'static str,
    },
    /// Caller broke a contract of the API.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The allocator cannot supply a page. Fatal to the in-progress
    /// operation; callers pre-reserve extents so this is unreachable in
    /// well-formed use.
    #[error("out of space: {0}")]
    NoSpace(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

pub mod page {
    //! The fixed outer header carried by every page, ahead of the B-tree
    //! payload.

    use super::{Error, PageId, Result, SpaceId};

    /// Magic bytes at offset 0 of every page.
    pub const PAGE_MAGIC: [u8; 4] = *b"CEDR";
    /// On-disk format version this build reads and writes.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default page size when the embedder does not choose one.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Length of the outer header in bytes.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for the fixed outer header fields.
        use core::ops::Range;

        /// Magic bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version, u16.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// Page kind byte.
        pub const PAGE_KIND: usize = 6;
        /// Always zero.
        pub const RESERVED: usize = 7;
        /// Page size, u32.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// The page's own number, u64.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// Owning space, u32.
        pub const SPACE: Range<usize> = 20..24;
        /// Payload checksum, u32.
        pub const CRC32: Range<usize> = 24..28;
        /// Zero padding to the header length.
        pub const PAD: Range<usize> = 28..32;
    }

    /// Physical kind of a page.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// A live B-tree page (leaf or non-leaf; the payload header carries
        /// the level).
        BTree = 1,
        /// A page returned to its segment. Stamped on free so stale sibling
        /// or node-pointer references are caught instead of followed.
        Free = 2,
    }

    impl PageKind {
        /// The raw byte stored in the header.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = Error;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::BTree),
                2 => Ok(PageKind::Free),
                _ => Err(Error::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded form of the outer header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version stamped on the page.
        pub format_version: u16,
        /// Physical kind.
        pub kind: PageKind,
        /// Page size the page was written with.
        pub page_size: u32,
        /// The page's own number.
        pub page_no: PageId,
        /// Owning space.
        pub space: SpaceId,
        /// Checksum of the payload, refreshed at mtr commit.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Build a header for a freshly initialized page.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, space: SpaceId) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(Error::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                space,
                crc32: 0,
            })
        }

        /// Serialize into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(Error::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::SPACE].copy_from_slice(&self.space.0.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            hdr[header::PAD].fill(0);
            Ok(())
        }

        /// Parse the first [`PAGE_HDR_LEN`] bytes of `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(Error::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            let magic: [u8; 4] = hdr[header::MAGIC].try_into().unwrap();
            if magic != PAGE_MAGIC {
                return Err(Error::Corruption("invalid page magic"));
            }
            let format_version = u16::from_be_bytes(hdr[header::FORMAT_VERSION].try_into().unwrap());
            if format_version != PAGE_FORMAT_VERSION {
                return Err(Error::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(Error::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_be_bytes(hdr[header::PAGE_SIZE].try_into().unwrap());
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(Error::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u64::from_be_bytes(hdr[header::PAGE_NO].try_into().unwrap()));
            let space = SpaceId(u32::from_be_bytes(hdr[header::SPACE].try_into().unwrap()));
            let crc32 = u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap());
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                space,
                crc32,
            })
        }
    }

    /// Checksum of everything after the outer header.
    pub fn crc32_of(page: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page[PAGE_HDR_LEN.min(page.len())..]);
        hasher.finalize()
    }

    /// Recompute and store the payload checksum.
    pub fn refresh_crc32(page: &mut [u8]) -> Result<()> {
        if page.len() < PAGE_HDR_LEN {
            return Err(Error::Invalid("page buffer shorter than header"));
        }
        let crc = crc32_of(page);
        page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Re-stamp the physical kind of an already-initialized page.
    pub fn set_kind(page: &mut [u8], kind: PageKind) -> Result<()> {
        if page.len() < PAGE_HDR_LEN {
            return Err(Error::Invalid("page buffer shorter than header"));
        }
        page[header::PAGE_KIND] = kind.as_u8();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::page::{self, PageHeader, PageKind};
    use super::{PageId, SpaceId};

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let header = PageHeader::new(
            PageId(42),
            PageKind::BTree,
            page::DEFAULT_PAGE_SIZE,
            SpaceId(7),
        )
        .unwrap();
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn page_kind_rejects_unknown() {
        assert!(PageKind::try_from(0).is_err());
        assert!(PageKind::try_from(9).is_err());
    }

    #[test]
    fn crc_refresh_tracks_payload() {
        let mut buf = vec![0u8; 256];
        let header = PageHeader::new(PageId(3), PageKind::BTree, 256, SpaceId(1)).unwrap();
        header.encode(&mut buf).unwrap();
        page::refresh_crc32(&mut buf).unwrap();
        let before = PageHeader::decode(&buf).unwrap().crc32;
        buf[page::PAGE_HDR_LEN + 10] = 0xAA;
        page::refresh_crc32(&mut buf).unwrap();
        let after = PageHeader::decode(&buf).unwrap().crc32;
        assert_ne!(before, after);
    }
}
