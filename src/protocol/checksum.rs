//! Frame checksums
//!
//! Heartbeats carry CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF). Reassembled
//! fragment payloads carry a 16-bit wrapping byte sum.

use crc::{Crc, CRC_16_IBM_3740};

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16/CCITT-FALSE over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC.checksum(data)
}

/// Wrapping sum of all bytes
pub fn byte_sum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

/// Check a frame whose last two bytes are a little-endian CRC of the rest
pub fn verify_trailing_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // Standard check input for CCITT-FALSE
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_byte_sum_wraps() {
        assert_eq!(byte_sum16(&[]), 0);
        assert_eq!(byte_sum16(&[1, 2, 3]), 6);
        let big = [0xFFu8; 300];
        assert_eq!(byte_sum16(&big), (300u32 * 255 % 65536) as u16);
    }

    #[test]
    fn test_verify_trailing_crc() {
        let mut frame = [0x10u8, 1, 2, 3, 0, 0];
        let crc = crc16(&frame[..4]);
        frame[4..].copy_from_slice(&crc.to_le_bytes());
        assert!(verify_trailing_crc(&frame));

        frame[2] ^= 0x01;
        assert!(!verify_trailing_crc(&frame));
        assert!(!verify_trailing_crc(&[0x10]));
    }
}
