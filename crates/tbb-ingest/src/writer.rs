//! Placement of frame payloads into a channel's backing array.
//!
//! A frame's position is measured from the channel origin:
//! `offset = (unix_time - origin.unix_time) * rate + (sample_number -
//! origin.sample_number)`. The array is grown to cover the frame before the
//! samples are written. Growth is never rolled back: if the write fails after
//! an extension the extended region keeps its zero fill.

use std::collections::BTreeMap;

use crate::error::FrameError;
use crate::header::FrameHeader;
use crate::registry::{ChannelRecord, Origin};
use crate::store::AttrValue;
use crate::timestamp::CorrectedTime;

/// Maps the header's sample frequency code to samples per second.
///
/// The hardware convention is that the code is the ADC clock in MHz; single
/// codes can be overridden (e.g. for synthetic test streams).
#[derive(Debug, Clone, Default)]
pub struct SampleRates {
    overrides: BTreeMap<u8, u64>,
}

impl SampleRates {
    pub fn new(overrides: BTreeMap<u8, u64>) -> Self {
        Self { overrides }
    }

    pub fn rate_hz(&self, code: u8) -> Result<u64, FrameError> {
        if let Some(&rate) = self.overrides.get(&code) {
            return Ok(rate);
        }
        match code {
            0 => Err(FrameError::UnknownSampleFrequency(code)),
            mhz => Ok(mhz as u64 * 1_000_000),
        }
    }
}

/// Signed distance, in samples, of `time` from `origin`.
pub fn sample_offset(origin: Origin, time: CorrectedTime, rate_hz: u64) -> i64 {
    let elapsed = time.unix_time as i64 - origin.unix_time as i64;
    let rate = i64::try_from(rate_hz).unwrap_or(i64::MAX);
    elapsed
        .saturating_mul(rate)
        .saturating_add(time.sample_number as i64 - origin.sample_number as i64)
}

/// Where a frame landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    /// New array length if the frame extended the array.
    pub extended_to: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SampleWriter {
    rates: SampleRates,
}

impl SampleWriter {
    pub fn new(rates: SampleRates) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> &SampleRates {
        &self.rates
    }

    /// Write one frame's samples into `channel`.
    pub fn write(
        &self,
        channel: &mut ChannelRecord,
        header: &FrameHeader,
        time: CorrectedTime,
        samples: &[i16],
    ) -> Result<Placement, FrameError> {
        let rate = self.rates.rate_hz(header.sample_frequency_code)?;
        let offset = sample_offset(channel.origin, time, rate);
        if offset < 0 {
            return Err(FrameError::NegativeOffset { channel: channel.id, offset });
        }
        let offset = offset as u64;
        let end = offset.saturating_add(samples.len() as u64);

        let mut extended_to = None;
        if end > channel.dimensions {
            tracing::debug!(
                array = %channel.array.path(),
                from = channel.dimensions,
                to = end,
                "extending array"
            );
            channel.array.extend(end).map_err(|source| FrameError::StoreExtensionFailed {
                channel: channel.id,
                new_len: end,
                source,
            })?;
            channel.dimensions = end;
            if let Err(e) = channel.array.set_attribute("DATA_LENGTH", AttrValue::Unsigned(end)) {
                tracing::warn!(array = %channel.array.path(), err = %e, "failed to record length");
            }
            extended_to = Some(end);
        }

        channel
            .array
            .write(offset, samples)
            .map_err(|source| FrameError::StoreWriteFailed { channel: channel.id, offset, source })?;

        tracing::debug!(
            channel = %channel.id,
            seqnr = header.sequence_number,
            offset,
            count = samples.len(),
            "frame written"
        );
        Ok(Placement { offset, extended_to })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BAND_SELECTOR_SIZE;
    use crate::registry::{ChannelHandle, Registry, StoreLayout};
    use crate::store::MemoryStore;

    const CODE: u8 = 200;
    const RATE: u64 = 200;

    fn make_header(time: i32, sample_nr: u32, n: u16) -> FrameHeader {
        FrameHeader {
            station_id: 0,
            rsp_id: 0,
            rcu_id: 0,
            sample_frequency_code: CODE,
            sequence_number: 0,
            unix_time: time,
            sample_number: sample_nr,
            samples_per_frame: n,
            frequency_band_count: 0,
            band_selector: [0; BAND_SELECTOR_SIZE],
            spare: 0,
            header_crc: 0,
        }
    }

    fn at(h: &FrameHeader) -> CorrectedTime {
        CorrectedTime { unix_time: h.unix_time, sample_number: h.sample_number }
    }

    fn setup(store: &MemoryStore, first: &FrameHeader) -> (Registry, ChannelHandle, SampleWriter) {
        let mut store = store.clone();
        let mut reg = Registry::new(StoreLayout::Flat, 2, 5);
        let ch = reg.find_or_create_channel(&mut store, first, at(first), RATE).unwrap();
        let writer = SampleWriter::new(SampleRates::new(BTreeMap::from([(CODE, RATE)])));
        (reg, ch, writer)
    }

    #[test]
    fn test_default_rates_are_mhz() {
        let rates = SampleRates::default();
        assert_eq!(rates.rate_hz(200).unwrap(), 200_000_000);
        assert_eq!(rates.rate_hz(160).unwrap(), 160_000_000);
        assert!(matches!(rates.rate_hz(0), Err(FrameError::UnknownSampleFrequency(0))));
    }

    #[test]
    fn test_offset_whole_seconds() {
        let origin = Origin { unix_time: 1_000, sample_number: 77 };
        for k in 0..5 {
            let t = CorrectedTime { unix_time: 1_000 + k, sample_number: 77 };
            assert_eq!(sample_offset(origin, t, 200_000_000), k as i64 * 200_000_000);
        }
    }

    #[test]
    fn test_offset_within_second() {
        let origin = Origin { unix_time: 1_000, sample_number: 77 };
        for m in [0u32, 1, 100, 199] {
            let t = CorrectedTime { unix_time: 1_000, sample_number: 77 + m };
            assert_eq!(sample_offset(origin, t, 200), m as i64);
        }
    }

    #[test]
    fn test_offset_negative_before_origin() {
        let origin = Origin { unix_time: 1_000, sample_number: 400 };
        let t = CorrectedTime { unix_time: 999, sample_number: 400 };
        assert_eq!(sample_offset(origin, t, 200), -200);
        let t = CorrectedTime { unix_time: 1_000, sample_number: 0 };
        assert_eq!(sample_offset(origin, t, 200), -400);
    }

    #[test]
    fn test_write_extends_then_fills_gap() {
        let store = MemoryStore::new();
        let first = make_header(10, 0, 4);
        let (mut reg, ch, writer) = setup(&store, &first);

        let p = writer.write(reg.channel_mut(ch), &first, at(&first), &[1, 2, 3, 4]).unwrap();
        assert_eq!(p, Placement { offset: 0, extended_to: Some(4) });

        // Skip a frame; the gap stays zero until it arrives.
        let third = make_header(10, 8, 4);
        let p = writer.write(reg.channel_mut(ch), &third, at(&third), &[9, 10, 11, 12]).unwrap();
        assert_eq!(p, Placement { offset: 8, extended_to: Some(12) });
        assert_eq!(store.samples("000000000").unwrap()[4..8], [0, 0, 0, 0]);

        let second = make_header(10, 4, 4);
        let p = writer.write(reg.channel_mut(ch), &second, at(&second), &[5, 6, 7, 8]).unwrap();
        assert_eq!(p, Placement { offset: 4, extended_to: None });
        assert_eq!(store.samples("000000000").unwrap(), (1..=12).collect::<Vec<i16>>());
        assert_eq!(reg.channel(ch).dimensions, 12);
        assert_eq!(store.attribute("000000000", "DATA_LENGTH"), Some(AttrValue::Unsigned(12)));
    }

    #[test]
    fn test_write_next_second() {
        let store = MemoryStore::new();
        let first = make_header(10, 150, 50);
        let (mut reg, ch, writer) = setup(&store, &first);
        writer.write(reg.channel_mut(ch), &first, at(&first), &[1; 50]).unwrap();

        let next = make_header(11, 0, 50);
        let p = writer.write(reg.channel_mut(ch), &next, at(&next), &[2; 50]).unwrap();
        assert_eq!(p.offset, 50);
        assert_eq!(reg.channel(ch).dimensions, 100);
    }

    #[test]
    fn test_negative_offset_leaves_store_untouched() {
        let store = MemoryStore::new();
        let first = make_header(10, 0, 4);
        let (mut reg, ch, writer) = setup(&store, &first);
        writer.write(reg.channel_mut(ch), &first, at(&first), &[1; 4]).unwrap();

        let early = make_header(9, 0, 4);
        let err = writer.write(reg.channel_mut(ch), &early, at(&early), &[7; 4]).unwrap_err();
        assert!(matches!(err, FrameError::NegativeOffset { offset: -200, .. }));
        assert_eq!(store.array_len("000000000"), Some(4));
    }

    #[test]
    fn test_extension_failure() {
        let store = MemoryStore::new().with_max_len(6);
        let first = make_header(10, 0, 4);
        let (mut reg, ch, writer) = setup(&store, &first);
        writer.write(reg.channel_mut(ch), &first, at(&first), &[1; 4]).unwrap();

        let next = make_header(10, 4, 4);
        let err = writer.write(reg.channel_mut(ch), &next, at(&next), &[2; 4]).unwrap_err();
        assert!(matches!(err, FrameError::StoreExtensionFailed { new_len: 8, .. }));
        assert_eq!(reg.channel(ch).dimensions, 4);
    }

    #[test]
    fn test_write_failure_keeps_extension() {
        let store = MemoryStore::new();
        let first = make_header(10, 0, 4);
        let (mut reg, ch, writer) = setup(&store, &first);
        store.set_reject_writes(true);

        let err = writer.write(reg.channel_mut(ch), &first, at(&first), &[1; 4]).unwrap_err();
        assert!(matches!(err, FrameError::StoreWriteFailed { offset: 0, .. }));
        assert_eq!(reg.channel(ch).dimensions, 4);
        assert_eq!(store.samples("000000000").unwrap(), vec![0; 4]);
    }
}
