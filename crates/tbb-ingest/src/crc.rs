//! CRC-16 as computed by the TBB/RSP firmware.
//!
//! Generator 0x18005 (x^16 + x^15 + x^2 + 1), MSB first, no reflection, zero
//! initial value, no final XOR, fed with 16-bit words. There is no implicit
//! zero augmentation: the checksum of a message is computed over the message
//! with the CRC word present but zeroed, which is also why a frame whose CRC
//! field is filled in checks to zero over the whole header.

use crate::error::FrameError;
use crate::header::FrameHeader;

const CRC_POLY: u32 = 0x18005;
const CRC_DIV: u32 = (CRC_POLY & 0x7fff_ffff) << 15;
const WORD_BITS: u32 = 16;

/// CRC-16 over a sequence of 16-bit words.
pub fn crc16(words: &[u16]) -> u16 {
    let Some((&first, rest)) = words.split_first() else {
        return 0;
    };
    let mut data = (first as u32) << 16;
    for &w in rest {
        data += w as u32;
        for _ in 0..WORD_BITS {
            if data & 0x8000_0000 != 0 {
                data ^= CRC_DIV;
            }
            data &= 0x7fff_ffff;
            data <<= 1;
        }
    }
    (data >> 16) as u16
}

/// CRC the firmware would place in `header_crc` for this header.
pub fn header_crc(header: &FrameHeader) -> u16 {
    crc16(&header.crc_words())
}

/// Verify the header CRC, ignoring the sequence number as the firmware does.
pub fn verify_header(header: &FrameHeader) -> Result<(), FrameError> {
    let computed = header_crc(header);
    if computed == header.header_crc {
        Ok(())
    } else {
        Err(FrameError::HeaderCrcMismatch { declared: header.header_crc, computed })
    }
}

/// CRC of the payload samples, computed like the header CRC: the samples
/// followed by one zeroed check word.
pub fn payload_crc(samples: &[i16]) -> u16 {
    let mut words: Vec<u16> = Vec::with_capacity(samples.len() + 1);
    words.extend(samples.iter().map(|&s| s as u16));
    words.push(0);
    crc16(&words)
}

/// Verify a payload against the low 16 bits of its trailing CRC word.
pub fn verify_payload(samples: &[i16], declared: u32) -> Result<(), FrameError> {
    let declared = (declared & 0xffff) as u16;
    let computed = payload_crc(samples);
    if computed == declared {
        Ok(())
    } else {
        Err(FrameError::PayloadCrcMismatch { declared, computed })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
