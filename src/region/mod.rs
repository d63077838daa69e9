//! The active firmware region: its layout, the handle that owns the driver for the duration of a
//! run, and the header and verification operations.
//!
//! ```text
//! header_address                app_start                          app_start + max_app_size
//! | header (header_size bytes)  | payload (details.size bytes) ... |
//! ```
//!
//! Erase, write and digest live in the submodules; the replace and mirror orchestrators are in
//! [`crate::replace`] and [`crate::mirror`].

use std::mem;
use std::time::Duration;

use crate::details::FirmwareDetails;
use crate::error::{DriverOp, Error};
use crate::flash::{FlashDriver, ERASED_VALUE};
use crate::header;
use crate::source::{Completion, DetailsReader, Event, InternalHeader, PendingOp};

pub mod digest;
mod erase;
mod write;

/// Where the header and the application live
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionLayout {
    pub header_address: u32,
    /// Space reserved for the header, which must be at least the padded encoded header
    pub header_size: u32,
    /// Must be page aligned
    pub app_start: u32,
    pub max_app_size: u32,
}

impl RegionLayout {
    /// First address past the region
    pub fn limit(&self) -> u64 {
        u64::from(self.app_start) + u64::from(self.max_app_size)
    }
}

/// Tunables of an [`ActiveRegion`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Config {
    buffer_size: usize,
    timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            timeout: None,
        }
    }
}

impl Config {
    /// Capacity of the staging buffer; this bounds memory use for any image size
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Give up on an asynchronous capability after this long
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The bounded buffer shared by every streaming operation of a run
#[derive(Debug)]
pub(crate) struct StagingBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl StagingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrow the first `len` bytes
    pub(crate) fn slice(&mut self, len: usize) -> &mut [u8] {
        if self.buf.len() < self.capacity {
            self.buf.resize(self.capacity, 0);
        }
        &mut self.buf[..len]
    }

    /// Lend `len` bytes out by value, filled with the erase value. A buffer that never comes
    /// back is replaced on the next use.
    pub(crate) fn lend(&mut self, len: usize) -> Vec<u8> {
        let mut buf = mem::take(&mut self.buf);
        if buf.capacity() < self.capacity {
            buf = Vec::with_capacity(self.capacity);
        }
        buf.clear();
        buf.resize(len, ERASED_VALUE);
        buf
    }

    pub(crate) fn restore(&mut self, buf: Vec<u8>) {
        if buf.capacity() >= self.capacity {
            self.buf = buf;
        }
    }
}

/// The classification of a region
#[derive(Debug)]
pub enum VerifyOutcome {
    /// The header is valid and the payload matches its digest
    Valid(FirmwareDetails),
    /// The header is valid and declares no application
    Empty,
    Invalid(Error),
}

impl VerifyOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyOutcome::Valid(_))
    }
}

/// Exclusive handle on the active region: owns the flash driver, the staging buffer and the
/// pending-operation slot from `new` until `into_inner`.
#[derive(Debug)]
pub struct ActiveRegion<F: FlashDriver, M = InternalHeader> {
    pub(crate) flash: F,
    pub(crate) layout: RegionLayout,
    pub(crate) details_reader: M,
    pub(crate) staging: StagingBuffer,
    pub(crate) pending: PendingOp,
}

impl<F: FlashDriver> ActiveRegion<F> {
    /// Initialize `flash` and take ownership of it, reading headers with [`InternalHeader`]
    pub fn new(flash: F, layout: RegionLayout, config: Config) -> Result<Self, Error> {
        Self::with_reader(flash, layout, config, InternalHeader)
    }
}

impl<F: FlashDriver, M: DetailsReader<F>> ActiveRegion<F, M> {
    /// Initialize `flash` and take ownership of it, reading headers with `details_reader`
    pub fn with_reader(
        mut flash: F,
        layout: RegionLayout,
        config: Config,
        details_reader: M,
    ) -> Result<Self, Error> {
        if config.buffer_size == 0 {
            return Err(Error::ConfigurationFault("zero-sized staging buffer".into()));
        }
        if u64::from(layout.header_address) + u64::from(layout.header_size)
            > u64::from(layout.app_start)
        {
            return Err(Error::ConfigurationFault(format!(
                "header at {:#010x}+{:#x} overlaps application at {:#010x}",
                layout.header_address, layout.header_size, layout.app_start
            )));
        }
        if layout.limit() > 1 << 32 {
            return Err(Error::ConfigurationFault(
                "region extends past the 32-bit address space".into(),
            ));
        }

        flash.init().map_err(Error::driver(DriverOp::Init, 0, 0))?;

        Ok(Self {
            flash,
            layout,
            details_reader,
            staging: StagingBuffer::new(config.buffer_size),
            pending: PendingOp::new(config.timeout),
        })
    }

    /// Deinitialize the driver and give it back
    pub fn into_inner(mut self) -> F {
        self.flash.deinit();
        self.flash
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub(crate) fn page_size(&self) -> Result<u32, Error> {
        match self.flash.page_size() {
            0 => Err(Error::ConfigurationFault("driver reports zero page size".into())),
            page => Ok(page),
        }
    }

    /// Read the details of the firmware in this region.
    ///
    /// Only an explicit details completion counts as success; anything else, including a reader
    /// that never signals, means the header is invalid.
    pub fn read_header(&mut self) -> Result<FirmwareDetails, Error> {
        let Self {
            flash,
            layout,
            details_reader,
            pending,
            ..
        } = self;

        match pending.issue(|done| details_reader.get_active_details(flash, layout, done)) {
            Completion::Signalled(Event::ActiveDetails(details)) => Ok(details),
            Completion::TimedOut => Err(Error::Timeout),
            other => {
                log::debug!("header read did not succeed: {other:?}");
                Err(Error::HeaderInvalid)
            }
        }
    }

    /// Program the header for `details`, padded with the erase value to whole pages.
    ///
    /// The header area must already be erased.
    pub fn write_header(&mut self, details: &FirmwareDetails) -> Result<(), Error> {
        let page_size = self.page_size()? as usize;
        let encoded = header::encode(details)
            .map_err(|e| Error::ConfigurationFault(format!("header encoding: {e}")))?;

        let program_size = encoded.len().div_ceil(page_size) * page_size;
        if program_size > self.staging.capacity() {
            return Err(Error::ConfigurationFault(format!(
                "header program size {program_size} bigger than buffer {}",
                self.staging.capacity()
            )));
        }
        if program_size > self.layout.header_size as usize {
            return Err(Error::ConfigurationFault(format!(
                "header program size {program_size} bigger than reserved header {}",
                self.layout.header_size
            )));
        }

        let buf = self.staging.slice(program_size);
        buf.fill(ERASED_VALUE);
        buf[..encoded.len()].copy_from_slice(&encoded);

        let addr = self.layout.header_address;
        log::debug!("writing {program_size}-byte header to {addr:#010x}");
        self.flash
            .program(addr, buf)
            .map_err(Error::driver(DriverOp::Program, addr.into(), program_size as u64))
    }

    /// Hash `length` bytes of flash starting at `addr`
    pub fn digest(&mut self, addr: u64, length: u64) -> Result<crate::Digest, Error> {
        match addr.checked_add(length) {
            Some(end) if end <= 1 << 32 => (),
            end => {
                return Err(Error::CapacityExceeded {
                    end: end.unwrap_or(u64::MAX),
                    limit: 1 << 32,
                })
            }
        }

        let capacity = self.staging.capacity();
        let flash = &self.flash;
        digest::compute(
            |pos, buf| {
                flash
                    .read(pos as u32, buf)
                    .map_err(Error::driver(DriverOp::Read, pos, buf.len() as u64))
            },
            addr,
            length,
            self.staging.slice(capacity),
        )
    }

    /// Check the payload against the digest recorded in the header
    pub fn verify(&mut self) -> VerifyOutcome {
        let details = match self.read_header() {
            Ok(details) => details,
            Err(err) => return VerifyOutcome::Invalid(err),
        };

        if details.size == 0 {
            return VerifyOutcome::Empty;
        }

        log::debug!("header start: {:#010x}", self.layout.header_address);
        log::debug!("app start: {:#010x}", self.layout.app_start);
        log::debug!("app size: {}", details.size);

        if details.size > u64::from(self.layout.max_app_size) {
            return VerifyOutcome::Invalid(Error::CapacityExceeded {
                end: u64::from(self.layout.app_start) + details.size,
                limit: self.layout.limit(),
            });
        }

        match self.digest(self.layout.app_start.into(), details.size) {
            Ok(computed) if computed == details.digest => VerifyOutcome::Valid(details),
            Ok(computed) => {
                log::warn!("expected digest {}", details.digest);
                log::warn!("computed digest {computed}");
                VerifyOutcome::Invalid(Error::DigestMismatch {
                    expected: details.digest,
                    computed,
                })
            }
            Err(err) => VerifyOutcome::Invalid(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::PageUtil;
    use crate::source::Completer;
    use crate::testutil::*;

    #[test]
    fn test_header_roundtrip() -> anyhow::Result<()> {
        let mut region = region();
        let details = details_for(&image(1000), 42);

        region.write_header(&details)?;
        assert_eq!(region.read_header()?, details);

        // Padded to whole pages with the erase value, and nothing written past that
        let raw = region.flash().contents();
        assert!(raw[header::HEADER_SIZE..128].is_erased());
        assert!(raw[128..1024].is_erased());
        assert_eq!(region.flash().bytes_programmed(), 128);
        Ok(())
    }

    #[test]
    fn test_header_too_big() {
        let layout = RegionLayout {
            header_size: 64,
            ..region_layout()
        };
        let mut region = ActiveRegion::new(sim_flash(), layout, Config::default()).unwrap();
        assert!(matches!(
            region.write_header(&FirmwareDetails::default()),
            Err(Error::ConfigurationFault(_))
        ));

        let mut region =
            ActiveRegion::new(sim_flash(), region_layout(), Config::default().buffer_size(64))
                .unwrap();
        assert!(matches!(
            region.write_header(&FirmwareDetails::default()),
            Err(Error::ConfigurationFault(_))
        ));

        // Neither attempt touched the flash
        assert_eq!(region.flash().bytes_programmed(), 0);
    }

    #[test]
    fn test_verify_erased() {
        let mut region = region();
        assert!(matches!(
            region.verify(),
            VerifyOutcome::Invalid(Error::HeaderInvalid)
        ));
    }

    #[test]
    fn test_verify_empty() -> anyhow::Result<()> {
        let mut region = region();
        let details = FirmwareDetails {
            version: 9,
            ..Default::default()
        };
        region.write_header(&details)?;
        assert!(matches!(region.verify(), VerifyOutcome::Empty));

        // Empty wins even if the digest field holds garbage
        let mut region = self::region();
        region.write_header(&FirmwareDetails {
            digest: crate::Digest([0x11; 32]),
            ..details
        })?;
        assert!(matches!(region.verify(), VerifyOutcome::Empty));
        Ok(())
    }

    #[test]
    fn test_verify_valid_and_corrupt() -> anyhow::Result<()> {
        let mut region = region();
        let payload = image(4096);
        let details = details_for(&payload, 3);
        place(&mut region, &details, &payload)?;

        match region.verify() {
            VerifyOutcome::Valid(found) => assert_eq!(found, details),
            other => panic!("unexpected {other:?}"),
        }

        let app_start = region.layout().app_start as usize;
        region.flash_mut().contents_mut()[app_start + 4000] ^= 0x40;
        match region.verify() {
            VerifyOutcome::Invalid(Error::DigestMismatch { expected, computed }) => {
                assert_eq!(expected, details.digest);
                assert_ne!(computed, details.digest);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_verify_size_past_region() -> anyhow::Result<()> {
        let mut region = region();
        let details = FirmwareDetails {
            size: u64::from(region.layout().max_app_size) + 1,
            ..Default::default()
        };
        region.write_header(&details)?;
        assert!(matches!(
            region.verify(),
            VerifyOutcome::Invalid(Error::CapacityExceeded { .. })
        ));
        Ok(())
    }

    /// A metadata reader that accepts the request but never signals
    struct Silent;

    impl DetailsReader<crate::flash::SimFlash> for Silent {
        fn get_active_details(
            &mut self,
            _flash: &crate::flash::SimFlash,
            _layout: &RegionLayout,
            _done: Completer,
        ) -> Result<(), crate::source::SourceError> {
            Ok(())
        }
    }

    #[test]
    fn test_reader_without_signal() {
        let mut region =
            ActiveRegion::with_reader(sim_flash(), region_layout(), Config::default(), Silent)
                .unwrap();
        assert!(matches!(region.read_header(), Err(Error::HeaderInvalid)));
        assert!(matches!(
            region.verify(),
            VerifyOutcome::Invalid(Error::HeaderInvalid)
        ));
    }

    /// A metadata reader that holds on to the completer
    #[derive(Default)]
    struct Stalled {
        parked: Vec<Completer>,
    }

    impl DetailsReader<crate::flash::SimFlash> for Stalled {
        fn get_active_details(
            &mut self,
            _flash: &crate::flash::SimFlash,
            _layout: &RegionLayout,
            done: Completer,
        ) -> Result<(), crate::source::SourceError> {
            self.parked.push(done);
            Ok(())
        }
    }

    #[test]
    fn test_reader_timeout() {
        let config = Config::default().timeout(Duration::from_millis(20));
        let mut region =
            ActiveRegion::with_reader(sim_flash(), region_layout(), config, Stalled::default())
                .unwrap();
        assert!(matches!(region.read_header(), Err(Error::Timeout)));
        assert!(matches!(
            region.verify(),
            VerifyOutcome::Invalid(Error::Timeout)
        ));
        assert_eq!(region.details_reader.parked.len(), 2);
    }

    #[test]
    fn test_digest_bounds() {
        let mut region = region();
        for (addr, length) in [(1, u64::MAX), (u64::MAX, 1), (0, (1 << 32) + 1)] {
            assert!(matches!(
                region.digest(addr, length),
                Err(Error::CapacityExceeded { .. })
            ));
        }
        assert_eq!(region.flash().bytes_read(), 0);
    }

    #[test]
    fn test_bad_layout() {
        let layout = RegionLayout {
            app_start: 512,
            ..region_layout()
        };
        assert!(matches!(
            ActiveRegion::new(sim_flash(), layout, Config::default()),
            Err(Error::ConfigurationFault(_))
        ));
        assert!(matches!(
            ActiveRegion::new(sim_flash(), region_layout(), Config::default().buffer_size(0)),
            Err(Error::ConfigurationFault(_))
        ));
    }

    #[test]
    fn test_init_deinit() {
        let region = region();
        assert!(region.flash().is_initialized());
        let flash = region.into_inner();
        assert!(!flash.is_initialized());
    }
}
