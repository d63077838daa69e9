use std::cmp;

use super::ActiveRegion;
use crate::error::{DriverOp, Error};
use crate::flash::{FlashDriver, ERASED_VALUE};
use crate::source::{Completion, DetailsReader, Event, UpdateSource};

/// Program `data` one page per call, starting at `addr`
fn program_pages<F: FlashDriver>(
    flash: &mut F,
    addr: u32,
    data: &[u8],
    page_size: usize,
) -> Result<(), Error> {
    for (i, page) in data.chunks(page_size).enumerate() {
        let page_addr = addr + (i * page_size) as u32;
        flash
            .program(page_addr, page)
            .map_err(Error::driver(DriverOp::Program, page_addr.into(), page.len() as u64))?;
    }
    Ok(())
}

impl<F: FlashDriver, M: DetailsReader<F>> ActiveRegion<F, M> {
    /// Copy `total_length` bytes of the image in `slot` to the start of the application.
    ///
    /// The image is requested from `source` one staging buffer at a time. Each chunk is padded
    /// with the erase value to whole pages and programmed page by page. The target must already
    /// be erased.
    pub fn write_payload<S: UpdateSource>(
        &mut self,
        slot: u32,
        total_length: u64,
        source: &mut S,
    ) -> Result<(), Error> {
        let page_size = self.page_size()?;
        let app_start = self.layout.app_start;

        if app_start % page_size != 0 {
            return Err(Error::ConfigurationFault(format!(
                "application ({app_start:#010x}) does not start on a page size ({page_size:#x}) \
                 aligned address"
            )));
        }

        let page_size = page_size as usize;
        let read_size = self.staging.capacity() / page_size * page_size;
        if read_size == 0 {
            return Err(Error::ConfigurationFault(format!(
                "staging buffer {} smaller than a page",
                self.staging.capacity()
            )));
        }

        let padded_length = total_length
            .div_ceil(page_size as u64)
            .checked_mul(page_size as u64);
        if padded_length.map_or(true, |len| len > u64::from(self.layout.max_app_size)) {
            return Err(Error::CapacityExceeded {
                end: u64::from(app_start).saturating_add(total_length),
                limit: self.layout.limit(),
            });
        }

        let rpt = howudoin::new()
            .label("Writing firmware")
            .set_len(total_length.div_ceil(read_size as u64));

        let mut offset: u64 = 0;
        while offset < total_length {
            let wanted = cmp::min(total_length - offset, read_size as u64) as usize;
            let lease = self.staging.lend(wanted);

            let staging = &mut self.staging;
            let completion = self.pending.issue(|done| {
                source
                    .read(slot, offset, lease, done)
                    .map_err(|(err, buf)| {
                        staging.restore(buf);
                        err
                    })
            });

            let mut chunk = match completion {
                Completion::Signalled(Event::ReadDone(buf)) => buf,
                Completion::TimedOut => return Err(Error::Timeout),
                Completion::Signalled(Event::Failed(buf)) => {
                    if let Some(buf) = buf {
                        self.staging.restore(buf);
                    }
                    log::error!("source read of slot {slot} at {offset:#x} failed");
                    return Err(Error::SourceReadFailure { offset });
                }
                other => {
                    log::error!("source read of slot {slot} at {offset:#x}: {other:?}");
                    return Err(Error::SourceReadFailure { offset });
                }
            };

            // Short reads are tolerated as long as the next chunk still starts on a page
            if chunk.is_empty()
                || chunk.len() > wanted
                || (chunk.len() < wanted && chunk.len() % page_size != 0)
            {
                log::error!(
                    "source returned {} bytes for a {wanted}-byte read at {offset:#x}",
                    chunk.len()
                );
                self.staging.restore(chunk);
                return Err(Error::SourceReadFailure { offset });
            }

            // The final page may be partial; pad it so every program is whole pages
            let program_size = chunk.len().div_ceil(page_size) * page_size;
            chunk.resize(program_size, ERASED_VALUE);

            let addr = app_start + offset as u32;
            log::debug!("{offset}/{total_length} writing {program_size} bytes to {addr:#010x}");
            let result = program_pages(&mut self.flash, addr, &chunk, page_size);
            self.staging.restore(chunk);
            result?;

            offset += program_size as u64;
            rpt.inc();
        }

        rpt.close();

        Ok(())
    }
}
