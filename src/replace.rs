//! Replacing the active firmware in place with an image from an update source.

use std::fmt;

use thiserror::Error;

use crate::details::FirmwareDetails;
use crate::error::Error;
use crate::flash::FlashDriver;
use crate::region::{ActiveRegion, VerifyOutcome};
use crate::source::{DetailsReader, UpdateSource};

/// The steps of a replacement, in the order they run
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Stage {
    Erase,
    WriteHeader,
    WritePayload,
    Verify,
}

impl Stage {
    fn desc(self) -> &'static str {
        match self {
            Stage::Erase => "Erasing active region",
            Stage::WriteHeader => "Writing header",
            Stage::WritePayload => "Writing firmware",
            Stage::Verify => "Verifying firmware",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Erase => "erase",
            Stage::WriteHeader => "write header",
            Stage::WritePayload => "write payload",
            Stage::Verify => "verify",
        })
    }
}

/// A replacement stopped at `stage`. Later stages were not attempted.
#[derive(Error, Debug)]
#[error("{stage} stage failed")]
pub struct Failed {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

struct TaskCtx<'a, F: FlashDriver, M, S> {
    region: &'a mut ActiveRegion<F, M>,
    slot: u32,
    details: &'a FirmwareDetails,
    source: &'a mut S,
}

type TaskFn<Ctx> = fn(&mut Ctx) -> Result<(), Error>;

/// Only the exact details just written, backed by a payload that hashes to them, count as
/// installed
fn check_installed(outcome: VerifyOutcome, details: &FirmwareDetails) -> Result<(), Error> {
    match outcome {
        VerifyOutcome::Valid(found) if found == *details => Ok(()),
        VerifyOutcome::Empty if details.size == 0 => Ok(()),
        VerifyOutcome::Invalid(err) => Err(err),
        other => {
            log::warn!("header read back does not describe the new image: {other:?}");
            Err(Error::HeaderInvalid)
        }
    }
}

impl<F: FlashDriver, M: DetailsReader<F>> ActiveRegion<F, M> {
    /// Erase the region, then install the image described by `details` from `slot` of `source`
    /// and check that it reads back intact.
    ///
    /// The first failing stage ends the run. Once erasing has started, a failure can leave the
    /// region without a bootable image; nothing here tries to restore the previous one.
    pub fn replace<S: UpdateSource>(
        &mut self,
        slot: u32,
        details: &FirmwareDetails,
        source: &mut S,
    ) -> Result<FirmwareDetails, Failed> {
        let tasks: [(Stage, TaskFn<TaskCtx<'_, F, M, S>>); 4] = [
            (Stage::Erase, |ctx| {
                ctx.region.erase(ctx.details.size)?;
                Ok(())
            }),
            (Stage::WriteHeader, |ctx| ctx.region.write_header(ctx.details)),
            (Stage::WritePayload, |ctx| {
                ctx.region
                    .write_payload(ctx.slot, ctx.details.size, ctx.source)
            }),
            (Stage::Verify, |ctx| {
                check_installed(ctx.region.verify(), ctx.details)
            }),
        ];

        let rpt = howudoin::new()
            .label("Replacing active firmware")
            .set_len(u64::try_from(tasks.len()).ok());
        let mut ctx = TaskCtx {
            region: self,
            slot,
            details,
            source,
        };

        for (stage, task) in tasks {
            rpt.desc(stage.desc());
            rpt.inc();
            log::info!("{}", stage.desc());

            if let Err(error) = task(&mut ctx) {
                rpt.close();
                if let Error::DigestMismatch { .. } = error {
                    log::error!("installed firmware failed verification, device may not boot");
                }
                log::error!("{stage} stage failed: {error}");
                return Err(Failed { stage, error });
            }
        }

        rpt.finish();
        log::info!(
            "installed firmware version {} ({} bytes)",
            details.version,
            details.size
        );

        Ok(*details)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::region::{Config, RegionLayout};
    use crate::source::{Completer, MemorySource, SourceError, ThreadedSource};
    use crate::testutil::*;
    use crate::DriverOp;

    #[test]
    fn test_replace() -> anyhow::Result<()> {
        let mut region = region();
        let payload = image(4096);
        let details = details_for(&payload, 3);
        let mut source = MemorySource::new(vec![image(10), payload]);

        assert_eq!(region.replace(1, &details, &mut source)?, details);
        match region.verify() {
            VerifyOutcome::Valid(found) => assert_eq!(found, details),
            other => panic!("unexpected {other:?}"),
        }

        // Replace it again with something bigger that spans more sectors
        let payload = image(20_000);
        let newer = details_for(&payload, 4);
        let mut source = MemorySource::new(vec![payload]);
        assert_eq!(region.replace(0, &newer, &mut source)?, newer);
        assert_eq!(region.read_header()?, newer);
        Ok(())
    }

    #[test]
    fn test_replace_silent_program_failure() {
        let mut region = region();
        let payload = image(4096);
        let details = details_for(&payload, 3);
        region.flash_mut().stick(2048..2112);

        match region.replace(0, &details, &mut MemorySource::new(vec![payload])) {
            Err(Failed {
                stage: Stage::Verify,
                error: Error::DigestMismatch { expected, .. },
            }) => assert_eq!(expected, details.digest),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_replace_erase_failure() {
        let mut region = region();
        let payload = image(4096);
        let details = details_for(&payload, 3);
        let mut source = MemorySource::new(vec![payload]);

        // Second sector of the region
        region.flash_mut().fail_erase_at(1024);

        match region.replace(0, &details, &mut source) {
            Err(Failed {
                stage: Stage::Erase,
                error:
                    Error::DriverFailure {
                        op: DriverOp::Erase,
                        start,
                        end,
                        ..
                    },
            }) => assert_eq!((start, end), (1024, 2048)),
            other => panic!("unexpected {other:?}"),
        }

        // Neither the header nor the payload were attempted
        assert_eq!(region.flash().bytes_programmed(), 0);
        assert_eq!(source.requests(), 0);
    }

    #[test]
    fn test_replace_capacity() {
        let mut region = region();
        region.flash_mut().contents_mut().fill(0x5A);
        let before = region.flash().contents().to_vec();

        let mut source = MemorySource::new(vec![Vec::new()]);

        for size in [u64::from(region.layout().max_app_size) + 1, u64::MAX] {
            let details = FirmwareDetails {
                size,
                ..Default::default()
            };
            assert!(matches!(
                region.replace(0, &details, &mut source),
                Err(Failed {
                    stage: Stage::Erase,
                    error: Error::CapacityExceeded { .. },
                })
            ));
            assert_eq!(region.flash().contents(), &before[..]);
        }
        assert_eq!(source.requests(), 0);
    }

    #[test]
    fn test_replace_gap_before_app() -> anyhow::Result<()> {
        let layout = RegionLayout {
            header_size: 128,
            ..region_layout()
        };
        let mut region = ActiveRegion::new(sim_flash(), layout, Config::default())?;
        region.flash_mut().contents_mut().fill(0);

        let payload = image(3968);
        let details = details_for(&payload, 2);
        let mut source = MemorySource::new(vec![payload]);

        assert_eq!(region.replace(0, &details, &mut source)?, details);
        assert!(region.verify().is_valid());
        Ok(())
    }

    /// Accepts every read and never answers
    #[derive(Default)]
    struct Unresponsive {
        parked: Vec<Completer>,
    }

    impl UpdateSource for Unresponsive {
        fn read(
            &mut self,
            _slot: u32,
            _offset: u64,
            _buf: Vec<u8>,
            done: Completer,
        ) -> Result<(), (SourceError, Vec<u8>)> {
            self.parked.push(done);
            Ok(())
        }
    }

    #[test]
    fn test_replace_timeout() -> anyhow::Result<()> {
        let mut region = ActiveRegion::new(
            sim_flash(),
            region_layout(),
            Config::default().timeout(Duration::from_millis(20)),
        )?;
        let payload = image(4096);
        let details = details_for(&payload, 3);
        let mut source = Unresponsive::default();

        assert!(matches!(
            region.replace(0, &details, &mut source),
            Err(Failed {
                stage: Stage::WritePayload,
                error: Error::Timeout,
            })
        ));
        assert_eq!(source.parked.len(), 1);

        // The staging buffer never came back, but the next run still works
        let mut source = MemorySource::new(vec![payload]);
        assert_eq!(region.replace(0, &details, &mut source)?, details);
        Ok(())
    }

    #[test]
    fn test_replace_short_image() {
        let mut region = region();
        let payload = image(4096);
        let details = details_for(&payload, 3);
        let mut source = MemorySource::new(vec![payload[..3000].to_vec()]);

        assert!(matches!(
            region.replace(0, &details, &mut source),
            Err(Failed {
                stage: Stage::WritePayload,
                error: Error::SourceReadFailure { .. },
            })
        ));
    }

    #[test]
    fn test_replace_threaded() -> anyhow::Result<()> {
        let mut region = ActiveRegion::new(
            sim_flash(),
            region_layout(),
            Config::default()
                .buffer_size(512)
                .timeout(Duration::from_secs(10)),
        )?;
        let payload = image(9000);
        let details = details_for(&payload, 7);
        let mut source = ThreadedSource::new(MemorySource::new(vec![payload]));

        assert_eq!(region.replace(0, &details, &mut source)?, details);
        assert!(region.verify().is_valid());
        Ok(())
    }

    #[test]
    fn test_replace_empty() -> anyhow::Result<()> {
        let mut region = region();
        let details = FirmwareDetails {
            version: 5,
            ..Default::default()
        };
        let mut source = MemorySource::new(vec![Vec::new()]);

        assert_eq!(region.replace(0, &details, &mut source)?, details);
        assert!(matches!(region.verify(), VerifyOutcome::Empty));
        assert_eq!(source.requests(), 0);
        Ok(())
    }

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = [
            Stage::Erase,
            Stage::WriteHeader,
            Stage::WritePayload,
            Stage::Verify,
        ]
        .iter()
        .map(Stage::to_string)
        .collect();
        assert_eq!(names, ["erase", "write header", "write payload", "verify"]);
    }
}
