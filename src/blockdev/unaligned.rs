//! Byte-granular access on top of a [`BlockDevice`].
//!
//! Aligned runs of whole blocks go straight to the device. The partial blocks at either end of
//! an IO go through a one-block scratch buffer; programs do a read-modify-write of that block.

use std::cmp;

use super::{BlockDevice, ByteDevice};
use crate::flash::FlashError;

#[derive(Debug)]
pub struct Unaligned<B: BlockDevice> {
    inner: B,
    scratch: Vec<u8>,
}

impl<B: BlockDevice> Unaligned<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    /// Split the IO at `offset` into the part that can be handled this iteration: either a
    /// run of whole blocks (`true`), or a piece of a single block (`false`).
    fn next_piece(&self, offset: u64, remaining: usize) -> (u64, usize, usize, bool) {
        let block_size = self.inner.block_size();
        let block = offset - offset % block_size;
        let within = (offset - block) as usize;

        if within == 0 && remaining as u64 >= block_size {
            let len = remaining - remaining % block_size as usize;
            (block, within, len, true)
        } else {
            let len = cmp::min(remaining, block_size as usize - within);
            (block, within, len, false)
        }
    }
}

impl<B: BlockDevice> ByteDevice for Unaligned<B> {
    fn init(&mut self) -> Result<(), FlashError> {
        self.inner.init()?;
        self.scratch = vec![0; self.inner.block_size() as usize];
        Ok(())
    }

    fn read(&mut self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), FlashError> {
        self.scratch.resize(self.inner.block_size() as usize, 0);
        while !buf.is_empty() {
            let (block, within, len, whole) = self.next_piece(offset, buf.len());
            let (piece, rest) = std::mem::take(&mut buf).split_at_mut(len);

            if whole {
                self.inner.read(block, piece)?;
            } else {
                self.inner.read(block, &mut self.scratch)?;
                piece.copy_from_slice(&self.scratch[within..][..len]);
            }

            offset += len as u64;
            buf = rest;
        }
        Ok(())
    }

    fn program(&mut self, mut offset: u64, mut data: &[u8]) -> Result<(), FlashError> {
        self.scratch.resize(self.inner.block_size() as usize, 0);
        while !data.is_empty() {
            let (block, within, len, whole) = self.next_piece(offset, data.len());
            let (piece, rest) = data.split_at(len);

            if whole {
                self.inner.program(block, piece)?;
            } else {
                self.inner.read(block, &mut self.scratch)?;
                self.scratch[within..][..len].copy_from_slice(piece);
                self.inner.program(block, &self.scratch)?;
            }

            offset += len as u64;
            data = rest;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blockdev::SimBlockDevice;

    #[test]
    fn test_unaligned_program() -> anyhow::Result<()> {
        let mut dev = Unaligned::new(SimBlockDevice::new(64, 8));
        dev.init()?;

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        dev.program(37, &data)?;

        let raw = dev.inner().contents();
        assert_eq!(raw[..37], [0xFF; 37]);
        assert_eq!(raw[37..237], data[..]);
        assert_eq!(raw[237..], [0xFF; 512 - 237]);

        // Partial head block, two whole blocks, partial tail block
        assert_eq!(dev.inner().bytes_programmed(), 64 + 128 + 64);
        Ok(())
    }

    #[test]
    fn test_unaligned_read() -> anyhow::Result<()> {
        let mut dev = Unaligned::new(SimBlockDevice::new(64, 8));
        dev.init()?;

        let data: Vec<u8> = (0..255).collect();
        dev.inner_mut().contents_mut()[100..355].copy_from_slice(&data);

        let mut buf = vec![0; 255];
        dev.read(100, &mut buf)?;
        assert_eq!(buf, data);

        let mut buf = [0; 3];
        dev.read(130, &mut buf)?;
        assert_eq!(buf, [30, 31, 32]);

        assert!(dev.read(510, &mut buf).is_err());
        Ok(())
    }
}
