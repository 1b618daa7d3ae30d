//! Compressed page twins.
//!
//! A frame can carry a compressed image of its page payload alongside the
//! uncompressed one. After any mutation the twin must be refreshed; when the
//! compressed form no longer fits its budget the twin is dropped and the page
//! continues uncompressed. Dropping is always legal, staleness never is.
//!
//! The outer header is not part of the image: its checksum is restamped at
//! mtr commit, after twins have been refreshed.

use crate::btree::page;
use crate::pool::Frame;
use crate::types::{Error, Result};

/// Recompress the payload of `frame.buf` into the twin under `budget` bytes.
/// Returns whether the twin was kept; on overflow the twin is dropped.
pub fn refresh(frame: &mut Frame, budget: usize) -> Result<bool> {
    let compressed = snap::raw::Encoder::new()
        .compress_vec(page::payload(&frame.buf))
        .map_err(|_| Error::Corruption("page image not compressible"))?;
    if compressed.len() <= budget {
        frame.zip = Some(compressed);
        Ok(true)
    } else {
        frame.zip = None;
        Ok(false)
    }
}

/// Check that the twin, when present, decompresses to exactly the
/// uncompressed payload.
pub fn verify(frame: &Frame) -> Result<bool> {
    let Some(zip) = &frame.zip else {
        return Ok(true);
    };
    let restored = snap::raw::Decoder::new()
        .decompress_vec(zip)
        .map_err(|_| Error::Corruption("compressed twin undecodable"))?;
    Ok(restored == page::payload(&frame.buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::{header, PAGE_HDR_LEN};

    fn frame(fill: u8) -> Frame {
        Frame {
            buf: vec![fill; 1024],
            zip: None,
        }
    }

    #[test]
    fn refresh_keeps_twin_within_budget() {
        let mut f = frame(0);
        assert!(refresh(&mut f, 512).unwrap());
        assert!(f.zip.is_some());
        assert!(verify(&f).unwrap());
    }

    #[test]
    fn refresh_drops_twin_over_budget() {
        let mut f = frame(0);
        f.buf = (0..4096).map(|i| (i % 251) as u8).collect();
        assert!(!refresh(&mut f, 16).unwrap());
        assert!(f.zip.is_none());
    }

    #[test]
    fn verify_flags_stale_twin() {
        let mut f = frame(7);
        refresh(&mut f, 512).unwrap();
        f.buf[100] = 0xFF;
        assert!(!verify(&f).unwrap());
    }

    #[test]
    fn twin_covers_payload_not_outer_header() {
        let mut f = frame(7);
        refresh(&mut f, 512).unwrap();
        // The checksum field changes at every commit without another refresh.
        f.buf[header::CRC32.start] ^= 0xFF;
        assert!(verify(&f).unwrap());
        f.buf[PAGE_HDR_LEN] ^= 0xFF;
        assert!(!verify(&f).unwrap());
    }
}
