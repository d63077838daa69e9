//! This module contains the code necessary to encode and decode the internal firmware header that
//! precedes the active application, with CRC verification/computation.

use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use crate::details::{Digest, FirmwareDetails, CAMPAIGN_SIZE, DIGEST_SIZE};

pub const HEADER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const HEADER_VERSION: u32 = 2;

/// Encoded size of the header: magic, version, firmware version and size, digest, campaign, CRC
pub const HEADER_SIZE: usize = 4 + 4 + 8 + 8 + DIGEST_SIZE + CAMPAIGN_SIZE + 4;

/// The raw on-flash representation
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(magic = b"\x5a\x51\xb3\xd4", endian = "big")]
struct RawHeader {
    header_version: u32,
    firmware_version: u64,
    firmware_size: u64,
    firmware_hash: [u8; DIGEST_SIZE],
    campaign: [u8; CAMPAIGN_SIZE],
    checksum: u32,
}

impl RawHeader {
    fn compute_crc(&self) -> Option<u32> {
        let bytes = self.to_bytes().ok()?;
        let len = bytes.len() - std::mem::size_of::<u32>();
        Some(HEADER_CRC.checksum(&bytes[..len]))
    }
}

/// Encode `details` into a new `HEADER_SIZE` buffer
pub fn encode(details: &FirmwareDetails) -> anyhow::Result<Vec<u8>> {
    let mut header = RawHeader {
        header_version: HEADER_VERSION,
        firmware_version: details.version,
        firmware_size: details.size,
        firmware_hash: details.digest.0,
        campaign: details.campaign,
        checksum: 0,
    };
    header.checksum = header
        .compute_crc()
        .ok_or(anyhow::anyhow!("header could not be serialized"))?;

    let bytes = header.to_bytes()?;
    anyhow::ensure!(bytes.len() == HEADER_SIZE, "encoded header has unexpected size");
    Ok(bytes)
}

/// Decode a header, verifying its magic, version and CRC
pub fn decode(buf: &[u8]) -> Option<FirmwareDetails> {
    let (_, header) = RawHeader::from_bytes((buf, 0)).ok()?;

    if header.header_version != HEADER_VERSION {
        return None;
    }

    if header.compute_crc()? != header.checksum {
        return None;
    }

    Some(FirmwareDetails {
        version: header.firmware_version,
        size: header.firmware_size,
        digest: Digest(header.firmware_hash),
        campaign: header.campaign,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> FirmwareDetails {
        FirmwareDetails {
            version: 1_700_000_000,
            size: 0x1_2345,
            digest: Digest([0xC3; DIGEST_SIZE]),
            campaign: [7; CAMPAIGN_SIZE],
        }
    }

    #[test]
    fn test_encode() -> anyhow::Result<()> {
        let bytes = encode(&sample())?;
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[..4], [0x5a, 0x51, 0xb3, 0xd4]);
        assert_eq!(bytes[4..8], [0, 0, 0, 2]);
        assert_eq!(decode(&bytes), Some(sample()));
        Ok(())
    }

    #[test]
    fn test_decode_rejects() -> anyhow::Result<()> {
        let bytes = encode(&sample())?;

        // Erased flash
        assert_eq!(decode(&[0xFF; HEADER_SIZE]), None);

        // Truncated
        assert_eq!(decode(&bytes[..HEADER_SIZE - 1]), None);

        // Bit flip in the payload size
        let mut corrupt = bytes.clone();
        corrupt[20] ^= 0x01;
        assert_eq!(decode(&corrupt), None);

        // Wrong header version, with a CRC that matches
        let mut other_version = bytes;
        other_version[7] = 3;
        let crc = HEADER_CRC.checksum(&other_version[..HEADER_SIZE - 4]);
        other_version[HEADER_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(decode(&other_version), None);
        Ok(())
    }
}
