//! Mirroring the active firmware into secondary storage.
//!
//! On the secondary device, the firmware is stored as a details record immediately followed by
//! the payload:
//!
//! ```text
//! offset                  offset + RECORD_SIZE
//! | details (raw record)  | payload (details.size bytes) ... |
//! ```
//!
//! The record is written last, once the copied payload has been hashed and found intact. An
//! interrupted mirror therefore leaves the previous record in place rather than one describing a
//! payload that never fully arrived.

use std::cmp;

use crate::blockdev::ByteDevice;
use crate::details::{FirmwareDetails, RECORD_SIZE};
use crate::error::{DriverOp, Error};
use crate::flash::FlashDriver;
use crate::region::{digest, ActiveRegion, VerifyOutcome};
use crate::source::DetailsReader;

impl<F: FlashDriver, M: DetailsReader<F>> ActiveRegion<F, M> {
    /// Copy the active firmware to `device` at `offset`, unless the device already holds the same
    /// release.
    ///
    /// Returns [`VerifyOutcome::Valid`] once the device holds an intact copy, and
    /// [`VerifyOutcome::Empty`] if the active region holds no application.
    pub fn mirror<D: ByteDevice>(&mut self, device: &mut D, offset: u64) -> VerifyOutcome {
        match self.try_mirror(device, offset) {
            Ok(Some(details)) => VerifyOutcome::Valid(details),
            Ok(None) => VerifyOutcome::Empty,
            Err(err) => {
                log::warn!("mirror to {offset:#x} failed: {err}");
                VerifyOutcome::Invalid(err)
            }
        }
    }

    fn try_mirror<D: ByteDevice>(
        &mut self,
        device: &mut D,
        offset: u64,
    ) -> Result<Option<FirmwareDetails>, Error> {
        device
            .init()
            .map_err(Error::driver(DriverOp::Init, offset, 0))?;

        let details = self.read_header()?;
        if details.size == 0 {
            return Ok(None);
        }
        if details.size > u64::from(self.layout.max_app_size) {
            return Err(Error::CapacityExceeded {
                end: u64::from(self.layout.app_start) + details.size,
                limit: self.layout.limit(),
            });
        }

        let mut record = [0u8; RECORD_SIZE];
        device
            .read(offset, &mut record)
            .map_err(Error::driver(DriverOp::Read, offset, RECORD_SIZE as u64))?;
        let existing = FirmwareDetails::from_record(&record);

        if existing.same_release(&details) {
            log::info!(
                "mirror at {offset:#x} already holds version {} ({} bytes)",
                details.version,
                details.size
            );
            return Ok(Some(details));
        }

        log::info!(
            "mirroring version {} ({} bytes) to {offset:#x}, replacing version {}",
            details.version,
            details.size,
            existing.version
        );

        let payload_offset = offset + RECORD_SIZE as u64;
        let capacity = self.staging.capacity();
        let app_start = u64::from(self.layout.app_start);

        let rpt = howudoin::new()
            .label("Mirroring firmware")
            .set_len(details.size.div_ceil(capacity as u64));

        let mut pos: u64 = 0;
        while pos < details.size {
            let len = cmp::min(details.size - pos, capacity as u64) as usize;
            let buf = self.staging.slice(len);

            let addr = app_start + pos;
            self.flash
                .read(addr as u32, buf)
                .map_err(Error::driver(DriverOp::Read, addr, len as u64))?;
            device
                .program(payload_offset + pos, buf)
                .map_err(Error::driver(DriverOp::Program, payload_offset + pos, len as u64))?;

            pos += len as u64;
            rpt.inc();
        }

        rpt.close();

        let computed = digest::compute(
            |pos, buf| {
                device
                    .read(pos, buf)
                    .map_err(Error::driver(DriverOp::Read, pos, buf.len() as u64))
            },
            payload_offset,
            details.size,
            self.staging.slice(capacity),
        )?;

        if computed != details.digest {
            log::warn!("expected digest {}", details.digest);
            log::warn!("computed digest {computed}");
            return Err(Error::DigestMismatch {
                expected: details.digest,
                computed,
            });
        }

        device
            .program(offset, &details.to_record())
            .map_err(Error::driver(DriverOp::Program, offset, RECORD_SIZE as u64))?;

        Ok(Some(details))
    }
}
