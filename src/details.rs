//! The firmware details record, and its raw encoding as stored ahead of a mirrored payload.

use std::fmt;

use bytes::{Buf, BufMut};

/// Size of a SHA-256 digest
pub const DIGEST_SIZE: usize = 32;

/// Size of the campaign identifier carried alongside the firmware
pub const CAMPAIGN_SIZE: usize = 16;

/// Size of the raw details record: version, size, digest, campaign
pub const RECORD_SIZE: usize = 8 + 8 + DIGEST_SIZE + CAMPAIGN_SIZE;

/// A SHA-256 digest of a firmware payload
#[derive(Default, Eq, PartialEq, Copy, Clone, Hash)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl std::str::FromStr for Digest {
    type Err = anyhow::Error;

    /// Parse 64 hex digits
    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            s.is_ascii() && s.len() == DIGEST_SIZE * 2,
            "expected {} hex digits",
            DIGEST_SIZE * 2
        );

        let mut digest = [0u8; DIGEST_SIZE];
        for (i, byte) in digest.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..][..2], 16)?;
        }

        Ok(Self(digest))
    }
}

/// Describes one application occupying a region.
///
/// A `size` of 0 is a valid value meaning the region is empty.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct FirmwareDetails {
    pub version: u64,
    pub size: u64,
    pub digest: Digest,
    pub campaign: [u8; CAMPAIGN_SIZE],
}

impl FirmwareDetails {
    /// Does `other` describe the same size and version? The digest is not compared.
    pub fn same_release(&self, other: &Self) -> bool {
        (self.size, self.version) == (other.size, other.version)
    }

    /// Encode as the raw record stored on a mirror device
    pub fn to_record(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        let mut out = &mut record[..];
        out.put_u64_le(self.version);
        out.put_u64_le(self.size);
        out.put_slice(&self.digest.0);
        out.put_slice(&self.campaign);
        record
    }

    /// Decode a raw record. No validation is possible, so any bytes decode to something.
    pub fn from_record(record: &[u8; RECORD_SIZE]) -> Self {
        let mut bytes = &record[..];
        let version = bytes.get_u64_le();
        let size = bytes.get_u64_le();
        let mut digest = [0u8; DIGEST_SIZE];
        bytes.copy_to_slice(&mut digest);
        let mut campaign = [0u8; CAMPAIGN_SIZE];
        bytes.copy_to_slice(&mut campaign);

        Self {
            version,
            size,
            digest: Digest(digest),
            campaign,
        }
    }
}

#[test]
fn test_record() {
    let details = FirmwareDetails {
        version: 0x0102030405060708,
        size: 4096,
        digest: Digest([0x5A; DIGEST_SIZE]),
        campaign: *b"campaign-0000001",
    };

    let record = details.to_record();
    assert_eq!(record[..8], [8, 7, 6, 5, 4, 3, 2, 1]);
    assert_eq!(FirmwareDetails::from_record(&record), details);

    // An erased record never matches a real release
    let erased = FirmwareDetails::from_record(&[0xFF; RECORD_SIZE]);
    assert_eq!(erased.size, u64::MAX);
    assert!(!erased.same_release(&details));
}

#[test]
fn test_digest_text() -> anyhow::Result<()> {
    let text = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    let digest: Digest = text.parse()?;
    assert_eq!(digest.0[1], 0x11);
    assert_eq!(digest.to_string(), text);
    assert!("0011".parse::<Digest>().is_err());
    Ok(())
}
