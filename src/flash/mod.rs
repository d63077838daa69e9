//! Abstractions and code to access the internal program flash

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::ops::Range;
use std::str::FromStr;

use anyhow::ensure;
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// The value of every byte after an erase. Also used to pad partial pages before programming.
pub const ERASED_VALUE: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
    #[error("misaligned: {0}")]
    Misaligned(String),
    #[error("hardware fault at {0:#010x}")]
    Fault(u32),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this contain only the erased bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == ERASED_VALUE)
    }
}

/// Represents the storage driver of the internal flash.
///
/// Addresses are absolute. `program` and `erase` lengths must be multiples of the page size and of
/// the sector size at that address respectively; callers are responsible for that, and drivers
/// may reject violations.
pub trait FlashDriver {
    fn init(&mut self) -> Result<(), FlashError>;

    fn deinit(&mut self);

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError>;

    /// The program unit, constant across the device
    fn page_size(&self) -> u32;

    /// The erase unit containing `addr`. This may differ from sector to sector.
    fn sector_size(&self, addr: u32) -> u32;
}

/// Describes the sector map and page size of a flash device
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashLayout {
    /// Runs of `(sector_size, count)`, starting at address 0
    pub sectors: Vec<(u32, u32)>,
    pub page_size: u32,
}

impl FlashLayout {
    pub fn total_size(&self) -> u32 {
        self.sectors.iter().map(|&(size, count)| size * count).sum()
    }

    /// Find the sector containing `addr`, returned as `(base, size)`
    pub fn sector_at(&self, addr: u32) -> Option<(u32, u32)> {
        let mut base = 0;
        for &(size, count) in &self.sectors {
            let run = size * count;
            if addr < base + run {
                return Some((base + (addr - base) / size * size, size));
            }
            base += run;
        }
        None
    }
}

/// Parse strings like "SIZExCOUNT,SIZExCOUNT/PAGE", e.g. "16384x4,65536x1,131072x7/256"
impl FromStr for FlashLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (sectors, page_size) = s
            .split_once('/')
            .ok_or(anyhow::anyhow!("expected SIZExCOUNT[,...]/PAGE"))?;

        let sectors = sectors
            .split(',')
            .map(|run| {
                let (size, count) = run
                    .split_once('x')
                    .ok_or(anyhow::anyhow!("expected SIZExCOUNT"))?;
                Ok((size.parse()?, count.parse()?))
            })
            .collect::<anyhow::Result<Vec<(u32, u32)>>>()?;
        let page_size: u32 = page_size.parse()?;

        ensure!(page_size > 0, "page size must be nonzero");
        for &(size, count) in &sectors {
            ensure!(count > 0, "sector count must be nonzero");
            ensure!(
                size > 0 && size % page_size == 0,
                "sector size {size} not a multiple of page size {page_size}"
            );
        }

        Ok(FlashLayout { sectors, page_size })
    }
}

/// A simulated in-memory NOR flash, for testing purposes.
///
/// Programming can only clear bits, as on real NOR: a page must be erased before it can take
/// arbitrary new content. Faults can be injected to exercise the error paths.
#[derive(Debug, Clone)]
pub struct SimFlash {
    data: Vec<u8>,
    layout: FlashLayout,
    initialized: bool,

    /// Sector base addresses whose erase reports failure
    failing_erases: Vec<u32>,

    /// Address ranges where programming silently does nothing
    stuck: Vec<Range<u32>>,

    bytes_read: Cell<u64>,
    bytes_programmed: u64,
    sectors_erased: u32,
}

impl SimFlash {
    /// Create a fully-erased SimFlash with the specified layout
    pub fn new(layout: FlashLayout) -> Self {
        Self {
            data: vec![ERASED_VALUE; layout.total_size() as usize],
            layout,
            initialized: false,
            failing_erases: Vec::new(),
            stuck: Vec::new(),
            bytes_read: Cell::new(0),
            bytes_programmed: 0,
            sectors_erased: 0,
        }
    }

    /// Initialize the flash contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        read.read_exact(&mut self.data)?;
        Ok(())
    }

    /// Write the contents of this simulated flash out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        write.write_all(&self.data)?;
        Ok(())
    }

    /// Direct access to the raw contents, bypassing the driver semantics
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the raw contents, for corrupting data in tests
    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Make erasing the sector containing `addr` fail
    pub fn fail_erase_at(&mut self, addr: u32) {
        if let Some((base, _)) = self.layout.sector_at(addr) {
            self.failing_erases.push(base);
        }
    }

    /// Make programs into `range` report success without changing anything
    pub fn stick(&mut self, range: Range<u32>) {
        self.stuck.push(range);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    pub fn bytes_programmed(&self) -> u64 {
        self.bytes_programmed
    }

    pub fn sectors_erased(&self) -> u32 {
        self.sectors_erased
    }

    fn check_bounds(&self, addr: u32, len: usize) -> Result<Range<usize>, FlashError> {
        let start = addr as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(FlashError::OutOfBounds(format!(
                "{start:#x}..{end:#x} past end of device"
            )));
        }
        Ok(start..end)
    }
}

impl FlashDriver for SimFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) {
        self.initialized = false;
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.check_bounds(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        self.bytes_read.set(self.bytes_read.get() + buf.len() as u64);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.check_bounds(addr, data.len())?;
        let page_size = self.layout.page_size as usize;
        if range.start % page_size != 0 || data.len() % page_size != 0 {
            return Err(FlashError::Misaligned(format!(
                "program of {} bytes at {addr:#x}",
                data.len()
            )));
        }

        self.bytes_programmed += data.len() as u64;

        for (i, (cell, &byte)) in self.data[range].iter_mut().zip(data).enumerate() {
            let cell_addr = addr + i as u32;
            if !self.stuck.iter().any(|r| r.contains(&cell_addr)) {
                *cell &= byte;
            }
        }

        Ok(())
    }

    /// Be strict, and make sure the range is exactly on sector boundaries
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        let range = self.check_bounds(addr, len as usize)?;

        let mut sectors = Vec::new();
        let mut cursor = addr;
        while cursor < addr + len {
            let (base, size) = self
                .layout
                .sector_at(cursor)
                .ok_or(FlashError::OutOfBounds(format!("{cursor:#x}")))?;
            if base != cursor || cursor + size > addr + len {
                return Err(FlashError::Misaligned(format!(
                    "erase {addr:#x}+{len:#x} not on sector boundaries"
                )));
            }
            sectors.push(base);
            cursor += size;
        }

        if let Some(&bad) = sectors.iter().find(|s| self.failing_erases.contains(s)) {
            return Err(FlashError::Fault(bad));
        }

        self.data[range].fill(ERASED_VALUE);
        self.sectors_erased += sectors.len() as u32;
        Ok(())
    }

    fn page_size(&self) -> u32 {
        self.layout.page_size
    }

    fn sector_size(&self, addr: u32) -> u32 {
        self.layout.sector_at(addr).map_or(0, |(_, size)| size)
    }
}

#[cfg(test)]
const TEST_LAYOUT: &str = "1024x4,4096x2/64";

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: FlashLayout = TEST_LAYOUT.parse()?;
    assert_eq!(layout.sectors, [(1024, 4), (4096, 2)]);
    assert_eq!(layout.page_size, 64);
    assert_eq!(layout.total_size(), 12288);

    assert_eq!(layout.sector_at(0), Some((0, 1024)));
    assert_eq!(layout.sector_at(1500), Some((1024, 1024)));
    assert_eq!(layout.sector_at(4096), Some((4096, 4096)));
    assert_eq!(layout.sector_at(12287), Some((8192, 4096)));
    assert_eq!(layout.sector_at(12288), None);

    assert!("1024x4".parse::<FlashLayout>().is_err());
    assert!("1000x4/64".parse::<FlashLayout>().is_err());
    assert!("1024x0/64".parse::<FlashLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_program_clears_bits() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_LAYOUT.parse()?);

    flash.program(0, &[0xF0; 64])?;
    flash.program(0, &[0x3C; 64])?;

    let mut buf = [0u8; 64];
    flash.read(0, &mut buf)?;
    assert_eq!(buf, [0x30; 64]);
    assert_eq!(flash.bytes_read(), 64);
    assert_eq!(flash.bytes_programmed(), 128);

    flash.erase(0, 1024)?;
    flash.read(0, &mut buf)?;
    assert!(buf.is_erased());
    Ok(())
}

#[test]
fn test_sim_alignment() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_LAYOUT.parse()?);

    assert!(flash.program(1, &[0; 64]).is_err());
    assert!(flash.program(0, &[0; 63]).is_err());
    assert!(flash.erase(512, 1024).is_err());
    assert!(flash.erase(0, 1500).is_err());
    assert!(flash.erase(8192, 8192).is_err());

    // Heterogeneous sectors may be erased in one call if the range is exact
    flash.erase(3072, 1024 + 4096)?;
    assert_eq!(flash.sectors_erased(), 2);
    Ok(())
}

#[test]
fn test_sim_faults() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_LAYOUT.parse()?);

    flash.fail_erase_at(1100);
    flash.program(1024, &[0u8; 64])?;
    assert!(matches!(flash.erase(0, 2048), Err(FlashError::Fault(1024))));

    // A failed erase leaves everything as it was
    assert_eq!(flash.contents()[1024], 0);
    flash.erase(0, 1024)?;

    flash.stick(128..192);
    flash.program(128, &[0u8; 128])?;
    assert!(flash.contents()[128..192].is_erased());
    assert_eq!(flash.contents()[192..256], [0u8; 64]);
    Ok(())
}
