use std::cmp;
use std::ops::Range;

use super::ActiveRegion;
use crate::error::{DriverOp, Error};
use crate::flash::FlashDriver;
use crate::source::DetailsReader;

impl<F: FlashDriver, M: DetailsReader<F>> ActiveRegion<F, M> {
    /// Erase the header and enough whole sectors after it to hold a payload of `payload_length`
    /// bytes at the application start.
    ///
    /// Sector sizes can differ from sector to sector, so the end is found by walking them one at a
    /// time, and each is erased with its own call. Nothing is erased if the end would lie past the
    /// region. Returns the erased range.
    pub fn erase(&mut self, payload_length: u64) -> Result<Range<u64>, Error> {
        let start = u64::from(self.layout.header_address);
        let limit = self.layout.limit();

        if payload_length > u64::from(self.layout.max_app_size) {
            log::error!(
                "firmware size {payload_length:#x} is larger than the maximum application size \
                 {:#x}",
                self.layout.max_app_size
            );
            return Err(Error::CapacityExceeded {
                end: u64::from(self.layout.app_start).saturating_add(payload_length),
                limit,
            });
        }

        // Anything between the header and the application is erased along with them
        let needed = cmp::max(
            u64::from(self.layout.app_start) + payload_length,
            start + u64::from(self.layout.header_size),
        );

        let mut end = start;
        let mut sectors: u64 = 0;
        while end < needed && end < limit {
            let size = self.flash.sector_size(end as u32);
            if size == 0 {
                return Err(Error::ConfigurationFault(format!(
                    "driver reports no sector at {end:#010x}"
                )));
            }
            end += u64::from(size);
            sectors += 1;
        }

        if end < needed || end > limit {
            let end = cmp::max(end, needed);
            log::error!(
                "firmware size {payload_length:#x} rounded up to the nearest sector boundary \
                 {:#x} is larger than the maximum application size {:#x}",
                end - u64::from(self.layout.app_start),
                self.layout.max_app_size
            );
            return Err(Error::CapacityExceeded { end, limit });
        }

        log::debug!("erasing from {start:#010x} to {end:#010x}");

        let rpt = howudoin::new().label("Erasing").set_len(sectors);
        let mut addr = start;
        while addr < end {
            let size = self.flash.sector_size(addr as u32);
            self.flash.erase(addr as u32, size).map_err(|err| {
                log::warn!(
                    "erasing from {addr:#010x} to {:#010x} failed: {err}",
                    addr + u64::from(size)
                );
                Error::driver(DriverOp::Erase, addr, size.into())(err)
            })?;
            addr += u64::from(size);
            rpt.inc();
        }

        rpt.close();

        Ok(start..end)
    }
}
