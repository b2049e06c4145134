//! TBB transient frame header codec.
//!
//! A frame is a fixed 88-byte header followed by `samples_per_frame` signed
//! 16-bit ADC samples and a trailing 32-bit payload CRC word. The RSP boards
//! emit little-endian frames; big-endian input is accepted when the caller
//! says so and every multi-byte field is decoded with that order.

// ---------------------------------------------------------------------------
// Wire layout (transient / raw-ADC mode)
//
//   Byte   0        = station id
//   Byte   1        = rsp id
//   Byte   2        = rcu id
//   Byte   3        = sample frequency code (MHz)
//   Bytes  4 ..  7  = sequence number (u32), zeroed for the header CRC
//   Bytes  8 .. 11  = unix time (i32)
//   Bytes 12 .. 15  = sample number within the second (u32)
//   Bytes 16 .. 17  = samples per frame (u16)
//   Bytes 18 .. 19  = number of frequency bands (u16), 0 in transient mode
//   Bytes 20 .. 83  = band selector bitmap (unused in transient mode)
//   Bytes 84 .. 85  = spare (i16)
//   Bytes 86 .. 87  = header CRC (u16)
//   Bytes 88 ..     = payload: i16[samples_per_frame], then u32 payload CRC
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

pub const HEADER_SIZE: usize = 88;
/// Size of one frame on the wire with the standard 1024-sample payload.
pub const STANDARD_FRAME_SIZE: usize = 2140;
pub const PAYLOAD_CRC_SIZE: usize = 4;
pub const BAND_SELECTOR_SIZE: usize = 64;

const STATION_OFF: usize = 0;
const RSP_OFF: usize = 1;
const RCU_OFF: usize = 2;
const FREQ_OFF: usize = 3;
const SEQNR_OFF: usize = 4;
const TIME_OFF: usize = 8;
const SAMPLE_NR_OFF: usize = 12;
const N_SAMPLES_OFF: usize = 16;
const N_BANDS_OFF: usize = 18;
const BANDSEL_OFF: usize = 20;
const SPARE_OFF: usize = 84;
const CRC_OFF: usize = 86;

/// Byte order of the multi-byte fields in an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        }
    }

    fn u32(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }

    fn put_u16(self, v: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    fn put_u32(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

/// Decoded frame header. Field values are always in host representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub station_id: u8,
    pub rsp_id: u8,
    pub rcu_id: u8,
    pub sample_frequency_code: u8,
    pub sequence_number: u32,
    pub unix_time: i32,
    pub sample_number: u32,
    pub samples_per_frame: u16,
    pub frequency_band_count: u16,
    pub band_selector: [u8; BAND_SELECTOR_SIZE],
    pub spare: i16,
    pub header_crc: u16,
}

impl FrameHeader {
    /// Decode the header at the start of `buf`.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::malformed(format!(
                "{} bytes is shorter than the {}-byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let u16_at = |off: usize| order.u16([buf[off], buf[off + 1]]);
        let u32_at = |off: usize| order.u32([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        let mut band_selector = [0u8; BAND_SELECTOR_SIZE];
        band_selector.copy_from_slice(&buf[BANDSEL_OFF..BANDSEL_OFF + BAND_SELECTOR_SIZE]);

        Ok(Self {
            station_id: buf[STATION_OFF],
            rsp_id: buf[RSP_OFF],
            rcu_id: buf[RCU_OFF],
            sample_frequency_code: buf[FREQ_OFF],
            sequence_number: u32_at(SEQNR_OFF),
            unix_time: u32_at(TIME_OFF) as i32,
            sample_number: u32_at(SAMPLE_NR_OFF),
            samples_per_frame: u16_at(N_SAMPLES_OFF),
            frequency_band_count: u16_at(N_BANDS_OFF),
            band_selector,
            spare: u16_at(SPARE_OFF) as i16,
            header_crc: u16_at(CRC_OFF),
        })
    }

    /// Encode the header into its 88-byte wire form.
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[STATION_OFF] = self.station_id;
        buf[RSP_OFF] = self.rsp_id;
        buf[RCU_OFF] = self.rcu_id;
        buf[FREQ_OFF] = self.sample_frequency_code;
        buf[SEQNR_OFF..SEQNR_OFF + 4].copy_from_slice(&order.put_u32(self.sequence_number));
        buf[TIME_OFF..TIME_OFF + 4].copy_from_slice(&order.put_u32(self.unix_time as u32));
        buf[SAMPLE_NR_OFF..SAMPLE_NR_OFF + 4].copy_from_slice(&order.put_u32(self.sample_number));
        buf[N_SAMPLES_OFF..N_SAMPLES_OFF + 2]
            .copy_from_slice(&order.put_u16(self.samples_per_frame));
        buf[N_BANDS_OFF..N_BANDS_OFF + 2]
            .copy_from_slice(&order.put_u16(self.frequency_band_count));
        buf[BANDSEL_OFF..BANDSEL_OFF + BAND_SELECTOR_SIZE].copy_from_slice(&self.band_selector);
        buf[SPARE_OFF..SPARE_OFF + 2].copy_from_slice(&order.put_u16(self.spare as u16));
        buf[CRC_OFF..CRC_OFF + 2].copy_from_slice(&order.put_u16(self.header_crc));
        buf
    }

    /// The 16-bit words the header CRC is computed over: the header in RSP
    /// (little-endian) order with the sequence number and CRC fields zeroed.
    pub fn crc_words(&self) -> [u16; HEADER_SIZE / 2] {
        let canonical = FrameHeader {
            sequence_number: 0,
            header_crc: 0,
            ..self.clone()
        }
        .encode(ByteOrder::Little);
        let mut words = [0u16; HEADER_SIZE / 2];
        for (w, pair) in words.iter_mut().zip(canonical.chunks_exact(2)) {
            *w = u16::from_le_bytes([pair[0], pair[1]]);
        }
        words
    }

    /// Payload length in bytes, excluding the trailing payload CRC.
    pub fn payload_len(&self) -> usize {
        self.samples_per_frame as usize * 2
    }

    pub fn is_transient(&self) -> bool {
        self.frequency_band_count == 0
    }
}

/// Decode the `samples_per_frame` ADC samples that follow the header.
pub fn decode_payload(
    buf: &[u8],
    header: &FrameHeader,
    order: ByteOrder,
) -> Result<Vec<i16>, FrameError> {
    let end = HEADER_SIZE + header.payload_len();
    if buf.len() < end {
        return Err(FrameError::malformed(format!(
            "{} bytes cannot hold {} samples (need {})",
            buf.len(),
            header.samples_per_frame,
            end
        )));
    }
    Ok(buf[HEADER_SIZE..end]
        .chunks_exact(2)
        .map(|b| order.u16([b[0], b[1]]) as i16)
        .collect())
}

/// Read the 32-bit payload CRC word that trails the samples, if present.
pub fn payload_crc_word(buf: &[u8], header: &FrameHeader, order: ByteOrder) -> Option<u32> {
    let off = HEADER_SIZE + header.payload_len();
    let b = buf.get(off..off + PAYLOAD_CRC_SIZE)?;
    Some(order.u32([b[0], b[1], b[2], b[3]]))
}

/// Assemble a complete frame: header as given, `samples`, then the payload
/// CRC word. `header.samples_per_frame` is not checked against `samples`.
pub fn encode_frame(header: &FrameHeader, samples: &[i16], order: ByteOrder) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + samples.len() * 2 + PAYLOAD_CRC_SIZE);
    buf.extend_from_slice(&header.encode(order));
    for &s in samples {
        buf.extend_from_slice(&order.put_u16(s as u16));
    }
    buf.extend_from_slice(&order.put_u32(crate::crc::payload_crc(samples) as u32));
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
