//! A command-line front end to the active region operations.
//!
//! This works against either a simulated flash image or, on Linux, a real MTD device, so that a
//! region can be inspected, installed and mirrored by hand.

use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};
use sha2::{Digest as _, Sha256};

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(target_os = "linux")]
use active_firmware::flash::mtd::MtdFlash;
use active_firmware::{
    blockdev::{FileBlockDevice, Unaligned},
    details::CAMPAIGN_SIZE,
    flash::{FlashDriver, FlashLayout, SimFlash},
    source::{FileSource, ThreadedSource},
    ActiveRegion, Config, Digest, FirmwareDetails, RegionLayout, VerifyOutcome,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct FlashOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the flash image to use
    #[clap(long, group = "flash-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the flash to simulate, e.g. "16384x4,65536x1,131072x7/256"
    #[clap(long)]
    sim_layout: Option<FlashLayout>,

    /// Write back the flash image when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl FlashOptions {
    fn open(&self) -> Result<FlashImpl> {
        let flashimpl = if let Some(layout) = &self.sim_layout {
            let mut sim = SimFlash::new(layout.clone());
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            FlashImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdFlash::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdFlash::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                FlashImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(flashimpl)
    }

    fn cleanup(&self, flash: FlashImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let FlashImpl::Sim(sim) = flash {
                    sim.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum FlashImpl {
    Sim(SimFlash),

    #[cfg(target_os = "linux")]
    Mtd(MtdFlash),
}

/// Accept "0x"-prefixed hex as well as decimal
fn parse_number(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_address(s: &str) -> Result<u32> {
    Ok(u32::try_from(parse_number(s)?)?)
}

#[derive(Args, Debug)]
struct RegionArgs {
    /// Address of the firmware header
    #[clap(long, value_parser = parse_address, default_value = "0")]
    header_address: u32,

    /// Space reserved for the header
    #[clap(long, value_parser = parse_address, default_value = "0x400")]
    header_size: u32,

    /// Address of the first byte of the application
    #[clap(long, value_parser = parse_address)]
    app_start: u32,

    /// Largest application the region can hold
    #[clap(long, value_parser = parse_address)]
    max_app_size: u32,

    /// Size of the staging buffer
    #[clap(long, default_value_t = 4096)]
    buffer_size: usize,

    /// Give up on an update source that does not respond within this many milliseconds
    #[clap(long)]
    timeout_ms: Option<u64>,
}

impl RegionArgs {
    fn open<F: FlashDriver>(&self, flash: F) -> Result<ActiveRegion<F>> {
        let layout = RegionLayout {
            header_address: self.header_address,
            header_size: self.header_size,
            app_start: self.app_start,
            max_app_size: self.max_app_size,
        };

        let mut config = Config::default().buffer_size(self.buffer_size);
        if let Some(ms) = self.timeout_ms {
            config = config.timeout(Duration::from_millis(ms));
        }

        Ok(ActiveRegion::new(flash, layout, config)?)
    }
}

fn parse_campaign(s: &str) -> Result<[u8; CAMPAIGN_SIZE]> {
    ensure!(
        s.len() <= CAMPAIGN_SIZE,
        "campaign must be at most {CAMPAIGN_SIZE} bytes"
    );
    let mut campaign = [0u8; CAMPAIGN_SIZE];
    campaign[..s.len()].copy_from_slice(s.as_bytes());
    Ok(campaign)
}

/// Print a verification outcome, failing unless it is `Valid` or `Empty`
fn report(outcome: VerifyOutcome) -> Result<()> {
    match outcome {
        VerifyOutcome::Valid(details) => {
            println!("Valid");
            println!("  version: {}", details.version);
            println!("  size:    {}", details.size);
            println!("  digest:  {}", details.digest);
        }
        VerifyOutcome::Empty => println!("Empty"),
        VerifyOutcome::Invalid(err) => return Err(err.into()),
    }

    Ok(())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the installed firmware against its header; this is a read-only operation
    Verify,

    /// Print the SHA-256 of a range of flash
    Digest {
        #[clap(value_parser = parse_number)]
        addr: u64,

        #[clap(value_parser = parse_number)]
        length: u64,
    },

    /// Erase the header and enough of the application area for a payload of `length` bytes
    Erase {
        #[clap(value_parser = parse_number)]
        length: u64,
    },

    /// Write a header to an erased region
    WriteHeader {
        #[clap(long)]
        version: u64,

        #[clap(long, value_parser = parse_number)]
        size: u64,

        /// 64 hex digits
        #[clap(long)]
        digest: Digest,

        #[clap(long, value_parser = parse_campaign)]
        campaign: Option<[u8; CAMPAIGN_SIZE]>,
    },

    /// Replace the installed firmware with an image file
    Replace {
        /// The path to the image to install
        image: PathBuf,

        #[clap(long)]
        version: u64,

        #[clap(long, value_parser = parse_campaign)]
        campaign: Option<[u8; CAMPAIGN_SIZE]>,

        /// Read the image from a worker thread
        #[clap(long)]
        threaded: bool,
    },

    /// Copy the installed firmware to a secondary block device or file
    Mirror {
        /// The path to the secondary device
        device: PathBuf,

        #[clap(long, default_value_t = 512)]
        block_size: u64,

        /// Byte offset of the mirror on the device; need not be block aligned
        #[clap(long, value_parser = parse_number, default_value = "0")]
        offset: u64,
    },
}

impl Command {
    fn execute<F: FlashDriver>(self, flash: F, region_args: &RegionArgs) -> Result<F> {
        let mut region = region_args.open(flash)?;

        match self {
            Command::Verify => report(region.verify())?,

            Command::Digest { addr, length } => {
                println!("{}", region.digest(addr, length)?);
            }

            Command::Erase { length } => {
                let erased = region.erase(length)?;
                println!("Erased {:#010x}..{:#010x}", erased.start, erased.end);
            }

            Command::WriteHeader {
                version,
                size,
                digest,
                campaign,
            } => {
                region.write_header(&FirmwareDetails {
                    version,
                    size,
                    digest,
                    campaign: campaign.unwrap_or_default(),
                })?;
            }

            Command::Replace {
                image,
                version,
                campaign,
                threaded,
            } => {
                let mut hasher = Sha256::new();
                let size = io::copy(&mut File::open(&image)?, &mut hasher)?;
                let mut digest = Digest::default();
                digest.0.copy_from_slice(&hasher.finalize());

                let details = FirmwareDetails {
                    version,
                    size,
                    digest,
                    campaign: campaign.unwrap_or_default(),
                };

                let source = FileSource::open(&[image])?;
                let installed = if threaded {
                    region.replace(0, &details, &mut ThreadedSource::new(source))?
                } else {
                    let mut source = source;
                    region.replace(0, &details, &mut source)?
                };
                report(VerifyOutcome::Valid(installed))?;
            }

            Command::Mirror {
                device,
                block_size,
                offset,
            } => {
                let mut device = Unaligned::new(FileBlockDevice::open(device, block_size)?);
                report(region.mirror(&mut device, offset))?;
            }
        };

        Ok(region.into_inner())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash holding the active region
    #[clap(flatten)]
    flash: FlashOptions,

    /// Where the region lies in that flash
    #[clap(flatten)]
    region: RegionArgs,

    /// The command to run against the region
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { flash, region, cmd } = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let flashimpl = match flash.open()? {
        FlashImpl::Sim(sim) => FlashImpl::Sim(cmd.execute(sim, &region)?),

        #[cfg(target_os = "linux")]
        FlashImpl::Mtd(mtd) => FlashImpl::Mtd(cmd.execute(mtd, &region)?),
    };
    flash.cleanup(flashimpl)?;
    Ok(())
}
