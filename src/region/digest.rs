//! Streaming SHA-256 over a byte range that may be far larger than memory.

use std::cmp;

use sha2::{Digest as _, Sha256};

use crate::details::Digest;
use crate::error::Error;

/// Hash `length` bytes starting at `offset`, reading through `read` at most `buf.len()` bytes at a
/// time.
///
/// The result does not depend on the buffer size. Any read error aborts the whole computation.
pub fn compute<R>(mut read: R, offset: u64, length: u64, buf: &mut [u8]) -> Result<Digest, Error>
where
    R: FnMut(u64, &mut [u8]) -> Result<(), Error>,
{
    if buf.is_empty() && length > 0 {
        return Err(Error::ConfigurationFault("zero-sized digest buffer".into()));
    }

    let rpt = howudoin::new()
        .label("Hashing")
        .set_len((!buf.is_empty()).then(|| length.div_ceil(buf.len() as u64)));

    let mut hasher = Sha256::new();
    let mut remaining = length;
    while remaining > 0 {
        let chunk = cmp::min(remaining, buf.len() as u64) as usize;
        let buf = &mut buf[..chunk];

        read(offset + (length - remaining), buf)?;
        hasher.update(&*buf);

        remaining -= chunk as u64;
        rpt.inc();
    }

    rpt.close();

    let mut digest = Digest::default();
    digest.0.copy_from_slice(&hasher.finalize());
    Ok(digest)
}
