//! Verification and replacement of the active firmware region of a bootloader.
//!
//! The entry point is [`ActiveRegion`], which owns the flash driver and the staging buffer for
//! the duration of a run and exposes verify, replace-in-place and mirror-to-secondary operations,
//! along with the narrower header, erase, write and digest primitives they are built from.

pub mod blockdev;
pub mod details;
pub mod error;
pub mod flash;
pub mod header;
pub mod mirror;
pub mod region;
pub mod replace;
pub mod source;

#[cfg(test)]
mod testutil;

pub use details::{Digest, FirmwareDetails};
pub use error::{DriverOp, Error};
pub use region::{ActiveRegion, Config, RegionLayout, VerifyOutcome};
pub use replace::{Failed, Stage};
