//! Shared fixtures for the unit tests

use sha2::{Digest as _, Sha256};

use crate::details::{Digest, FirmwareDetails};
use crate::flash::SimFlash;
use crate::region::{ActiveRegion, Config, RegionLayout};
use crate::source::MemorySource;

/// Four 1 KiB sectors followed by six 4 KiB sectors, with 64-byte pages
pub fn sim_flash() -> SimFlash {
    SimFlash::new("1024x4,4096x6/64".parse().unwrap())
}

/// Header in the first sector, application in everything after it
pub fn region_layout() -> RegionLayout {
    RegionLayout {
        header_address: 0,
        header_size: 1024,
        app_start: 1024,
        max_app_size: 27 * 1024,
    }
}

/// A region over [`sim_flash`] with a small staging buffer, so everything takes several chunks
pub fn region() -> ActiveRegion<SimFlash> {
    ActiveRegion::new(sim_flash(), region_layout(), Config::default().buffer_size(256)).unwrap()
}

/// A deterministic image with no repeating page pattern
pub fn image(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_right(13) as u8)
        .collect()
}

pub fn details_for(payload: &[u8], version: u64) -> FirmwareDetails {
    let mut digest = Digest::default();
    digest.0.copy_from_slice(&Sha256::digest(payload));
    FirmwareDetails {
        version,
        size: payload.len() as u64,
        digest,
        campaign: [0x5C; 16],
    }
}

/// Install `payload` by hand, without going through the orchestrator
pub fn place(
    region: &mut ActiveRegion<SimFlash>,
    details: &FirmwareDetails,
    payload: &[u8],
) -> anyhow::Result<()> {
    region.erase(details.size)?;
    region.write_header(details)?;
    region.write_payload(0, details.size, &mut MemorySource::new(vec![payload.to_vec()]))?;
    Ok(())
}
