//! One ingestion session: a backing store plus the per-frame pipeline.
//!
//! `process_frame` takes a raw frame buffer through decode, header CRC,
//! mode check, payload decode and optional payload CRC, timestamp
//! correction, registry lookup and the sample writer. Each failure discards
//! only that frame and is counted in [`IngestStats`]; the session itself
//! only fails when the store cannot be set up.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::crc;
use crate::error::{FrameError, SessionError, StoreError};
use crate::header::{self, ByteOrder, FrameHeader};
use crate::registry::{
    ChannelId, Registry, StoreLayout, DEFAULT_MAX_CHANNELS, DEFAULT_MAX_STATIONS,
};
use crate::stats::{IngestReport, IngestStats};
use crate::store::{AttrValue, FileStore, SampleStore};
use crate::timestamp::{CorrectionProfile, FixLevel, TimestampCorrector};
use crate::writer::{Placement, SampleRates, SampleWriter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Replacement correction profiles; `None` keeps the built-in one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampProfiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy: Option<CorrectionProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modern: Option<CorrectionProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub layout: StoreLayout,
    pub header_crc_check: bool,
    pub data_crc_check: bool,
    pub timestamp_fix: FixLevel,
    pub byte_order: ByteOrder,
    pub max_stations: usize,
    pub max_channels: usize,
    /// Samples per second for individual frequency codes.
    #[serde(with = "rate_table")]
    pub sample_rates: BTreeMap<u8, u64>,
    pub timestamp_profiles: TimestampProfiles,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            layout: StoreLayout::Grouped,
            header_crc_check: true,
            data_crc_check: false,
            timestamp_fix: FixLevel::Modern,
            byte_order: ByteOrder::Little,
            max_stations: DEFAULT_MAX_STATIONS,
            max_channels: DEFAULT_MAX_CHANNELS,
            sample_rates: BTreeMap::new(),
            timestamp_profiles: TimestampProfiles::default(),
        }
    }
}

impl SessionConfig {
    /// Corrector for the configured fix level, honouring profile overrides.
    pub fn corrector(&self) -> TimestampCorrector {
        let profiles = &self.timestamp_profiles;
        TimestampCorrector::new(match self.timestamp_fix {
            FixLevel::None => None,
            FixLevel::Legacy => {
                Some(profiles.legacy.clone().unwrap_or_else(CorrectionProfile::legacy))
            }
            FixLevel::Modern => {
                Some(profiles.modern.clone().unwrap_or_else(CorrectionProfile::modern))
            }
        })
    }
}

/// TOML table keys are strings; frequency codes are stored as `"200" = ...`.
mod rate_table {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(rates: &BTreeMap<u8, u64>, s: S) -> Result<S::Ok, S::Error> {
        let keyed: BTreeMap<String, u64> =
            rates.iter().map(|(code, rate)| (code.to_string(), *rate)).collect();
        keyed.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<u8, u64>, D::Error> {
        BTreeMap::<String, u64>::deserialize(d)?
            .into_iter()
            .map(|(code, rate)| {
                code.trim()
                    .parse::<u8>()
                    .map(|c| (c, rate))
                    .map_err(|_| D::Error::custom(format!("invalid frequency code {code:?}")))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Parameters and figures of a session, for display and JSON reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub byte_order: ByteOrder,
    pub header_crc_check: bool,
    pub data_crc_check: bool,
    pub timestamp_fix: FixLevel,
    pub layout: StoreLayout,
    pub stations: usize,
    pub channels: usize,
    /// Sum of all channel array lengths.
    pub samples_stored: u64,
    #[serde(flatten)]
    pub report: IngestReport,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |b: bool| if b { "on" } else { "off" };
        writeln!(f, "Session          : {}", self.name)?;
        writeln!(f, "Byte order       : {:?}", self.byte_order)?;
        writeln!(f, "Header CRC check : {}", on_off(self.header_crc_check))?;
        writeln!(f, "Data CRC check   : {}", on_off(self.data_crc_check))?;
        writeln!(f, "Time fix level   : {}", self.timestamp_fix.level())?;
        writeln!(f, "Frames processed : {}", self.report.processed)?;
        writeln!(f, "Broken header    : {}", self.report.discarded_header_crc)?;
        writeln!(f, "Discarded total  : {}", self.report.discarded_total)?;
        write!(
            f,
            "Written          : {} channels on {} stations, {} samples",
            self.channels, self.stations, self.samples_stored
        )
    }
}

// ---------------------------------------------------------------------------
// IngestSession
// ---------------------------------------------------------------------------

pub struct IngestSession {
    name: String,
    config: SessionConfig,
    store: Box<dyn SampleStore>,
    registry: Registry,
    corrector: TimestampCorrector,
    writer: SampleWriter,
    stats: Arc<IngestStats>,
}

impl IngestSession {
    /// Start a session on `store`, writing `attributes` and `FILENAME` to
    /// the store root.
    pub fn open(
        name: impl Into<String>,
        config: SessionConfig,
        mut store: Box<dyn SampleStore>,
        attributes: &BTreeMap<String, AttrValue>,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        store.set_attribute("", "FILENAME", name.as_str().into())?;
        for (key, value) in attributes {
            store.set_attribute("", key, value.clone())?;
        }

        tracing::info!(
            session = %name,
            layout = ?config.layout,
            header_crc = config.header_crc_check,
            data_crc = config.data_crc_check,
            fix = config.timestamp_fix.level(),
            byte_order = ?config.byte_order,
            "session opened"
        );
        Ok(Self {
            registry: Registry::new(config.layout, config.max_stations, config.max_channels),
            corrector: config.corrector(),
            writer: SampleWriter::new(SampleRates::new(config.sample_rates.clone())),
            stats: IngestStats::new(),
            name,
            config,
            store,
        })
    }

    /// Start a session on a new [`FileStore`] at `path`.
    pub fn create_file(
        path: impl AsRef<Path>,
        config: SessionConfig,
        attributes: &BTreeMap<String, AttrValue>,
    ) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let store = FileStore::create(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::open(name, config, Box::new(store), attributes)
    }

    /// Count into `stats` instead of fresh counters, e.g. ones the
    /// receivers were already filling before the store was created.
    pub fn with_stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Counters, shareable with a receiver thread.
    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Ingest one raw frame. The buffer is only borrowed for the call.
    pub fn process_frame(&mut self, buf: &[u8]) -> Result<Placement, FrameError> {
        let header = match FrameHeader::decode(buf, self.config.byte_order) {
            Ok(h) => h,
            Err(e) => return Err(self.discard(None, e)),
        };
        match self.ingest(buf, &header) {
            Ok(placement) => {
                self.stats.record_processed();
                Ok(placement)
            }
            Err(e) => Err(self.discard(Some(ChannelId::from_header(&header)), e)),
        }
    }

    fn ingest(&mut self, buf: &[u8], header: &FrameHeader) -> Result<Placement, FrameError> {
        if self.config.header_crc_check {
            self.stats.record_header_crc_checked();
            crc::verify_header(header)?;
        }
        if !header.is_transient() {
            return Err(FrameError::UnsupportedMode { bands: header.frequency_band_count });
        }
        let rate = self.writer.rates().rate_hz(header.sample_frequency_code)?;

        let order = self.config.byte_order;
        let samples = header::decode_payload(buf, header, order)?;
        if self.config.data_crc_check {
            let declared = header::payload_crc_word(buf, header, order)
                .ok_or_else(|| FrameError::malformed("payload CRC word missing"))?;
            crc::verify_payload(&samples, declared)?;
        }

        let time = self.corrector.correct(header);
        let handle = self.registry.find_or_create_channel(&mut *self.store, header, time, rate)?;
        self.writer.write(self.registry.channel_mut(handle), header, time, &samples)
    }

    fn discard(&self, channel: Option<ChannelId>, err: FrameError) -> FrameError {
        let reason = err.discard_reason();
        self.stats.record_discarded(reason);
        match channel {
            Some(id) => tracing::warn!(
                station = id.station,
                rsp = id.rsp,
                rcu = id.rcu,
                reason = reason.as_str(),
                err = %err,
                "frame discarded"
            ),
            None => tracing::warn!(reason = reason.as_str(), err = %err, "frame discarded"),
        }
        err
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            name: self.name.clone(),
            byte_order: self.config.byte_order,
            header_crc_check: self.config.header_crc_check,
            data_crc_check: self.config.data_crc_check,
            timestamp_fix: self.config.timestamp_fix,
            layout: self.config.layout,
            stations: self.registry.station_count(),
            channels: self.registry.channel_count(),
            samples_stored: self.registry.channels().map(|c| c.dimensions).sum(),
            report: self.stats.report(),
        }
    }

    /// Record final array lengths and flush every array. All arrays are
    /// flushed even if one fails; the first failure is returned.
    pub fn close(mut self) -> Result<SessionSummary, StoreError> {
        let mut first_err = None;
        for channel in self.registry.channels_mut() {
            let len = AttrValue::Unsigned(channel.dimensions);
            let result = channel
                .array
                .set_attribute("DATA_LENGTH", len)
                .and_then(|()| channel.array.flush());
            if let Err(e) = result {
                tracing::warn!(array = %channel.array.path(), err = %e, "flush failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        let summary = self.summary();
        tracing::info!(
            session = %summary.name,
            processed = summary.report.processed,
            discarded = summary.report.discarded_total,
            channels = summary.channels,
            "session closed"
        );
        match first_err {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscardReason;
    use crate::header::{encode_frame, BAND_SELECTOR_SIZE, HEADER_SIZE};
    use crate::store::MemoryStore;

    fn make_header(rcu: u8, time: i32, sample_nr: u32, n: u16) -> FrameHeader {
        let mut h = FrameHeader {
            station_id: 2,
            rsp_id: 1,
            rcu_id: rcu,
            sample_frequency_code: 200,
            sequence_number: 17,
            unix_time: time,
            sample_number: sample_nr,
            samples_per_frame: n,
            frequency_band_count: 0,
            band_selector: [0; BAND_SELECTOR_SIZE],
            spare: 0,
            header_crc: 0,
        };
        h.header_crc = crc::header_crc(&h);
        h
    }

    fn make_frame(h: &FrameHeader) -> Vec<u8> {
        let samples: Vec<i16> = (0..h.samples_per_frame as i16).collect();
        encode_frame(h, &samples, ByteOrder::Little)
    }

    fn make_config() -> SessionConfig {
        SessionConfig {
            timestamp_fix: FixLevel::None,
            sample_rates: BTreeMap::from([(200, 200)]),
            ..SessionConfig::default()
        }
    }

    fn open(config: SessionConfig) -> (IngestSession, MemoryStore) {
        let store = MemoryStore::new();
        let attrs = BTreeMap::from([("TELESCOPE".to_string(), AttrValue::from("LOFAR"))]);
        let session = IngestSession::open("test.tbb", config, Box::new(store.clone()), &attrs)
            .expect("open");
        (session, store)
    }

    #[test]
    fn test_open_writes_root_attributes() {
        let (_s, store) = open(make_config());
        assert_eq!(store.attribute("", "FILENAME"), Some("test.tbb".into()));
        assert_eq!(store.attribute("", "TELESCOPE"), Some("LOFAR".into()));
    }

    #[test]
    fn test_valid_frame_is_written() {
        let (mut s, store) = open(make_config());
        let p = s.process_frame(&make_frame(&make_header(3, 100, 0, 8))).unwrap();
        assert_eq!(p.offset, 0);
        assert_eq!(s.stats().processed(), 1);
        assert_eq!(store.samples("Station002/002001003").unwrap(), (0..8).collect::<Vec<i16>>());
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let (mut s, _store) = open(make_config());
        let err = s.process_frame(&[0u8; HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame { .. }));
        assert_eq!(s.stats().discarded(DiscardReason::Malformed), 1);
        assert_eq!(s.stats().discarded(DiscardReason::HeaderCrc), 0);
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let (mut s, store) = open(make_config());
        let frame = make_frame(&make_header(3, 100, 0, 8));
        let err = s.process_frame(&frame[..HEADER_SIZE + 6]).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame { .. }));
        assert!(store.array_paths().is_empty());
    }

    #[test]
    fn test_header_crc_mismatch_counted() {
        let (mut s, store) = open(make_config());
        let mut frame = make_frame(&make_header(3, 100, 0, 8));
        frame[12] ^= 0x01;
        let err = s.process_frame(&frame).unwrap_err();
        assert!(matches!(err, FrameError::HeaderCrcMismatch { .. }));
        assert_eq!(s.stats().report().discarded_header_crc, 1);
        assert!(store.array_paths().is_empty(), "registry never reached");
    }

    #[test]
    fn test_header_crc_check_off() {
        let config = SessionConfig { header_crc_check: false, ..make_config() };
        let (mut s, _store) = open(config);
        let mut h = make_header(3, 100, 0, 8);
        h.header_crc ^= 0xFFFF;
        assert!(s.process_frame(&make_frame(&h)).is_ok());
        assert_eq!(s.stats().report().header_crc_failure_ratio, None);
    }

    #[test]
    fn test_crc_ratio_counts_frames_discarded_after_check() {
        let config = SessionConfig { max_channels: 1, ..make_config() };
        let (mut s, _store) = open(config);
        s.process_frame(&make_frame(&make_header(3, 100, 0, 8))).unwrap();
        let err = s.process_frame(&make_frame(&make_header(4, 100, 0, 8))).unwrap_err();
        assert_eq!(err.discard_reason(), DiscardReason::Capacity);
        let mut bad = make_frame(&make_header(3, 100, 8, 8));
        bad[12] ^= 0x01;
        s.process_frame(&bad).unwrap_err();
        assert_eq!(s.stats().snapshot().header_crc_checked, 3);
        let ratio = s.stats().header_crc_failure_ratio().unwrap();
        assert!((ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_with_stats_shares_counters() {
        let shared = IngestStats::new();
        shared.record_received(2140);
        let (s, _store) = open(make_config());
        let mut s = s.with_stats(Arc::clone(&shared));
        s.process_frame(&make_frame(&make_header(3, 100, 0, 8))).unwrap();
        let snap = shared.snapshot();
        assert_eq!((snap.frames_received, snap.frames_processed), (1, 1));
    }

    #[test]
    fn test_sequence_number_not_checked() {
        let (mut s, _store) = open(make_config());
        let mut frame = make_frame(&make_header(3, 100, 0, 8));
        frame[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(s.process_frame(&frame).is_ok());
    }

    #[test]
    fn test_spectral_mode_rejected() {
        let (mut s, store) = open(make_config());
        let mut h = make_header(3, 100, 0, 8);
        h.frequency_band_count = 12;
        h.header_crc = crc::header_crc(&h);
        let err = s.process_frame(&make_frame(&h)).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedMode { bands: 12 }));
        assert!(store.array_paths().is_empty());
    }

    #[test]
    fn test_unknown_frequency_code() {
        let (mut s, _store) = open(make_config());
        let mut h = make_header(3, 100, 0, 8);
        h.sample_frequency_code = 0;
        h.header_crc = crc::header_crc(&h);
        let err = s.process_frame(&make_frame(&h)).unwrap_err();
        assert!(matches!(err, FrameError::UnknownSampleFrequency(0)));
        assert_eq!(s.stats().discarded(DiscardReason::Unsupported), 1);
    }

    #[test]
    fn test_data_crc_check() {
        let config = SessionConfig { data_crc_check: true, ..make_config() };
        let (mut s, _store) = open(config);
        let frame = make_frame(&make_header(3, 100, 0, 8));
        assert!(s.process_frame(&frame).is_ok());

        let mut bad = make_frame(&make_header(3, 100, 8, 8));
        bad[HEADER_SIZE] ^= 0x10;
        let err = s.process_frame(&bad).unwrap_err();
        assert!(matches!(err, FrameError::PayloadCrcMismatch { .. }));

        let without_crc = make_frame(&make_header(3, 100, 8, 8));
        let err = s.process_frame(&without_crc[..HEADER_SIZE + 16]).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame { .. }));
    }

    #[test]
    fn test_big_endian_session() {
        let config = SessionConfig { byte_order: ByteOrder::Big, ..make_config() };
        let (mut s, store) = open(config);
        let h = make_header(3, 100, 0, 4);
        let frame = encode_frame(&h, &[-1, 2, -3, 4], ByteOrder::Big);
        s.process_frame(&frame).unwrap();
        assert_eq!(store.samples("Station002/002001003").unwrap(), vec![-1, 2, -3, 4]);
    }

    #[test]
    fn test_modern_fix_applied_before_placement() {
        let config = SessionConfig { timestamp_fix: FixLevel::Modern, ..make_config() };
        let (mut s, store) = open(config);
        // Even second: the origin is shifted by 512 samples.
        s.process_frame(&make_frame(&make_header(3, 100, 0, 8))).unwrap();
        assert_eq!(
            store.attribute("Station002/002001003", "SAMPLE_NUMBER"),
            Some(AttrValue::Unsigned(512))
        );
    }

    #[test]
    fn test_profile_override() {
        let mut config = make_config();
        config.timestamp_fix = FixLevel::Legacy;
        config.timestamp_profiles.legacy =
            Some(CorrectionProfile { frequency_codes: vec![200], rules: vec![] });
        let mut corrector = config.corrector();
        let t = corrector.correct(&make_header(0, 101, 0, 8));
        assert_eq!((t.unix_time, t.sample_number), (101, 0));
    }

    #[test]
    fn test_config_from_toml() {
        let config: SessionConfig = toml::from_str(
            r#"
            layout = "flat"
            timestamp_fix = "legacy"
            max_channels = 7

            [sample_rates]
            200 = 200
            "#,
        )
        .unwrap();
        assert_eq!(config.layout, StoreLayout::Flat);
        assert_eq!(config.timestamp_fix, FixLevel::Legacy);
        assert_eq!(config.max_channels, 7);
        assert_eq!(config.max_stations, DEFAULT_MAX_STATIONS);
        assert!(config.header_crc_check);
        assert_eq!(config.sample_rates.get(&200), Some(&200));

        let text = toml::to_string(&config).unwrap();
        let back: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_bad_rate_key_rejected() {
        let res: Result<SessionConfig, _> = toml::from_str("[sample_rates]\nfast = 1\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_summary_and_close() {
        let (mut s, store) = open(make_config());
        s.process_frame(&make_frame(&make_header(3, 100, 0, 8))).unwrap();
        s.process_frame(&make_frame(&make_header(4, 100, 0, 8))).unwrap();
        let _ = s.process_frame(&[0u8; 4]);

        let text = s.summary().to_string();
        assert!(text.contains("Frames processed : 2"), "{text}");
        let summary = s.close().unwrap();
        assert_eq!(summary.channels, 2);
        assert_eq!(summary.stations, 1);
        assert_eq!(summary.samples_stored, 16);
        assert_eq!(summary.report.discarded_total, 1);
        assert_eq!(
            store.attribute("Station002/002001004", "DATA_LENGTH"),
            Some(AttrValue::Unsigned(8))
        );
    }
}
