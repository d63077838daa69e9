//! Secondary storage that the active firmware is mirrored into.
//!
//! Such devices are block-granular underneath ([`BlockDevice`]), but the mirror needs to place a
//! details record and a payload at an arbitrary offset, so it works through the byte-granular
//! [`ByteDevice`] interface. [`Unaligned`] bridges the two.

use std::cell::Cell;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::flash::{FlashError, ERASED_VALUE};

mod unaligned;
pub use unaligned::Unaligned;

/// Represents a block-granular storage device, such as an SD card or SPI flash with a translation
/// layer. Programs overwrite previous contents; no erase is needed.
pub trait BlockDevice {
    fn init(&mut self) -> Result<(), FlashError>;

    /// Size of the device in bytes
    fn size(&self) -> u64;

    /// Reads and programs must be aligned to, and a multiple of, this many bytes
    fn block_size(&self) -> u64;

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), FlashError>;

    fn program(&mut self, addr: u64, data: &[u8]) -> Result<(), FlashError>;
}

/// A device that may be read and programmed at any byte offset and length
pub trait ByteDevice {
    fn init(&mut self) -> Result<(), FlashError>;

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError>;

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError>;
}

/// Check that an IO lies within `size` bytes and on `block_size` boundaries
fn check_io(addr: u64, len: usize, size: u64, block_size: u64) -> Result<(), FlashError> {
    let end = addr + len as u64;
    if end > size {
        return Err(FlashError::OutOfBounds(format!(
            "{addr:#x}..{end:#x} past end of {size:#x}-byte device"
        )));
    }
    if addr % block_size != 0 || len as u64 % block_size != 0 {
        return Err(FlashError::Misaligned(format!(
            "{len} bytes at {addr:#x} with {block_size}-byte blocks"
        )));
    }
    Ok(())
}

/// A simulated in-memory block device, for testing purposes
#[derive(Debug, Clone)]
pub struct SimBlockDevice {
    data: Vec<u8>,
    block_size: u64,
    initialized: bool,
    bytes_read: Cell<u64>,
    bytes_programmed: u64,
}

impl SimBlockDevice {
    /// Create a device of `blocks` blocks, reading as erased
    pub fn new(block_size: u64, blocks: u64) -> Self {
        Self {
            data: vec![ERASED_VALUE; (block_size * blocks) as usize],
            block_size,
            initialized: false,
            bytes_read: Cell::new(0),
            bytes_programmed: 0,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    pub fn bytes_programmed(&self) -> u64 {
        self.bytes_programmed
    }
}

impl BlockDevice for SimBlockDevice {
    fn init(&mut self) -> Result<(), FlashError> {
        self.initialized = true;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        check_io(addr, buf.len(), self.size(), self.block_size)?;
        buf.copy_from_slice(&self.data[addr as usize..][..buf.len()]);
        self.bytes_read.set(self.bytes_read.get() + buf.len() as u64);
        Ok(())
    }

    fn program(&mut self, addr: u64, data: &[u8]) -> Result<(), FlashError> {
        check_io(addr, data.len(), self.size(), self.block_size)?;
        self.data[addr as usize..][..data.len()].copy_from_slice(data);
        self.bytes_programmed += data.len() as u64;
        Ok(())
    }
}

/// A block device backed by a file, or by a device node such as `/dev/mmcblk0p3`
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    size: u64,
    block_size: u64,
}

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(path: P, block_size: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(block_size > 0, "block size must be nonzero");

        let file = File::options().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        let size = size - size % block_size;

        Ok(Self {
            file,
            size,
            block_size,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn init(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        check_io(addr, buf.len(), self.size, self.block_size)?;
        Ok(self.file.read_exact_at(buf, addr)?)
    }

    fn program(&mut self, addr: u64, data: &[u8]) -> Result<(), FlashError> {
        check_io(addr, data.len(), self.size, self.block_size)?;
        Ok(self.file.write_all_at(data, addr)?)
    }
}

#[test]
fn test_sim_block_device() -> anyhow::Result<()> {
    let mut dev = SimBlockDevice::new(512, 4);
    dev.init()?;
    assert_eq!(dev.size(), 2048);

    dev.program(512, &[0xA5; 1024])?;
    let mut buf = [0u8; 512];
    dev.read(1024, &mut buf)?;
    assert_eq!(buf, [0xA5; 512]);
    dev.read(0, &mut buf)?;
    assert_eq!(buf, [ERASED_VALUE; 512]);

    assert!(dev.read(1, &mut buf).is_err());
    assert!(dev.program(2048, &[0; 512]).is_err());
    assert_eq!(dev.bytes_programmed(), 1024);
    Ok(())
}
