//! Station and channel bookkeeping for one ingestion session.
//!
//! Both tables are capacity-bounded arenas: records live in a slot pool in
//! insertion order and an index keyed by identity gives O(1) lookup. Nothing
//! is ever evicted, so once a table is full every frame naming a new identity
//! is refused for the rest of the session while known identities keep
//! working.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::FrameError;
use crate::header::FrameHeader;
use crate::store::{AttrValue, SampleArray, SampleStore};
use crate::timestamp::CorrectedTime;

/// Default ceiling on distinct stations per session.
pub const DEFAULT_MAX_STATIONS: usize = 50;
/// Default ceiling on distinct channels (dipoles) per session.
pub const DEFAULT_MAX_CHANNELS: usize = 1000;

/// (station, RSP, RCU) triple naming one antenna/receiver channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId {
    pub station: u8,
    pub rsp: u8,
    pub rcu: u8,
}

impl ChannelId {
    pub fn new(station: u8, rsp: u8, rcu: u8) -> Self {
        Self { station, rsp, rcu }
    }

    pub fn from_header(h: &FrameHeader) -> Self {
        Self::new(h.station_id, h.rsp_id, h.rcu_id)
    }

    /// Numeric dipole id: `station * 1e6 + rsp * 1e3 + rcu`.
    pub fn dipole_id(&self) -> u32 {
        self.station as u32 * 1_000_000 + self.rsp as u32 * 1_000 + self.rcu as u32
    }

    /// Name of the channel's array in the store, e.g. `001002003`.
    pub fn array_name(&self) -> String {
        format!("{:03}{:03}{:03}", self.station, self.rsp, self.rcu)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {:03}/{:03}/{:03}", self.station, self.rsp, self.rcu)
    }
}

/// Name of a station's group in the store, e.g. `Station001`.
pub fn station_group_name(station: u8) -> String {
    format!("Station{station:03}")
}

/// How channel arrays are arranged in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreLayout {
    /// One group per station holding that station's channel arrays.
    #[default]
    Grouped,
    /// All channel arrays directly under the session root.
    Flat,
}

/// Which table overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    Stations,
    Channels,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CapacityKind::Stations => "station",
            CapacityKind::Channels => "channel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle(usize);

/// One station seen in this session.
#[derive(Debug)]
pub struct StationRecord {
    pub id: u8,
    /// Store group holding the station's channels (grouped layout only).
    pub group: Option<String>,
    pub channel_count: usize,
}

/// Zero point for a channel's offset arithmetic: the corrected time stamp
/// of the first frame ever seen for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub unix_time: i32,
    pub sample_number: u32,
}

impl From<CorrectedTime> for Origin {
    fn from(t: CorrectedTime) -> Self {
        Self { unix_time: t.unix_time, sample_number: t.sample_number }
    }
}

/// One channel seen in this session. Owns its backing-store array.
pub struct ChannelRecord {
    pub id: ChannelId,
    pub station: StationHandle,
    pub origin: Origin,
    /// Logical length of the backing array in samples. Only grows.
    pub dimensions: u64,
    pub(crate) array: Box<dyn SampleArray>,
}

impl ChannelRecord {
    pub fn array_path(&self) -> &str {
        self.array.path()
    }
}

impl fmt::Debug for ChannelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRecord")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("dimensions", &self.dimensions)
            .field("array", &self.array.path())
            .finish()
    }
}

/// Fixed-capacity slot pool with an identity index.
struct Arena<K, V> {
    slots: Vec<V>,
    index: HashMap<K, usize>,
    capacity: usize,
}

impl<K: Eq + Hash, V> Arena<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(1024)),
            index: HashMap::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn find(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    fn insert(&mut self, key: K, value: V) -> usize {
        let slot = self.slots.len();
        self.slots.push(value);
        self.index.insert(key, slot);
        slot
    }
}

/// Station and channel tables of one session.
pub struct Registry {
    layout: StoreLayout,
    stations: Arena<u8, StationRecord>,
    channels: Arena<ChannelId, ChannelRecord>,
}

impl Registry {
    pub fn new(layout: StoreLayout, max_stations: usize, max_channels: usize) -> Self {
        Self {
            layout,
            stations: Arena::new(max_stations),
            channels: Arena::new(max_channels),
        }
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    pub fn station_count(&self) -> usize {
        self.stations.slots.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.slots.len()
    }

    pub fn station(&self, handle: StationHandle) -> &StationRecord {
        &self.stations.slots[handle.0]
    }

    pub fn channel(&self, handle: ChannelHandle) -> &ChannelRecord {
        &self.channels.slots[handle.0]
    }

    pub fn channel_mut(&mut self, handle: ChannelHandle) -> &mut ChannelRecord {
        &mut self.channels.slots[handle.0]
    }

    pub fn find_channel(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.channels.find(&id).map(ChannelHandle)
    }

    /// Channels in registration order.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.channels.slots.iter()
    }

    pub(crate) fn channels_mut(&mut self) -> impl Iterator<Item = &mut ChannelRecord> {
        self.channels.slots.iter_mut()
    }

    /// Look up a station, creating its record (and, in the grouped layout,
    /// its store group) on first sight.
    pub fn find_or_create_station(
        &mut self,
        store: &mut dyn SampleStore,
        station_id: u8,
        for_channel: ChannelId,
    ) -> Result<StationHandle, FrameError> {
        if let Some(slot) = self.stations.find(&station_id) {
            return Ok(StationHandle(slot));
        }
        if self.stations.is_full() {
            return Err(FrameError::RegistryCapacityExceeded {
                kind: CapacityKind::Stations,
                capacity: self.stations.capacity,
                channel: for_channel,
            });
        }

        let group = match self.layout {
            StoreLayout::Flat => None,
            StoreLayout::Grouped => {
                let name = station_group_name(station_id);
                store
                    .create_group(&name)
                    .map_err(|source| FrameError::StoreCreateFailed { channel: for_channel, source })?;
                let attrs: [(&str, AttrValue); 4] = [
                    ("STATION_ID", station_id.into()),
                    ("OBSERVATION_MODE", "Transient".into()),
                    ("TRIGGER_TYPE", "UNDEFINED".into()),
                    ("TRIGGER_OFFSET", 0.0f64.into()),
                ];
                for (key, value) in attrs {
                    if let Err(e) = store.set_attribute(&name, key, value) {
                        tracing::warn!(group = %name, key, err = %e, "failed to set station attribute");
                    }
                }
                Some(name)
            }
        };

        tracing::info!(station = station_id, group = ?group, "new station");
        let slot = self.stations.insert(
            station_id,
            StationRecord { id: station_id, group, channel_count: 0 },
        );
        Ok(StationHandle(slot))
    }

    /// Look up the channel named by `header`, creating its record and store
    /// array on first sight. The channel origin is taken from `origin`, the
    /// corrected time stamp of the triggering frame, and never changes.
    pub fn find_or_create_channel(
        &mut self,
        store: &mut dyn SampleStore,
        header: &FrameHeader,
        origin: CorrectedTime,
        sample_rate_hz: u64,
    ) -> Result<ChannelHandle, FrameError> {
        let id = ChannelId::from_header(header);
        if let Some(slot) = self.channels.find(&id) {
            return Ok(ChannelHandle(slot));
        }
        if self.channels.is_full() {
            return Err(FrameError::RegistryCapacityExceeded {
                kind: CapacityKind::Channels,
                capacity: self.channels.capacity,
                channel: id,
            });
        }

        let station = self.find_or_create_station(store, id.station, id)?;
        let path = match &self.station(station).group {
            Some(group) => format!("{group}/{}", id.array_name()),
            None => id.array_name(),
        };
        let mut array = store
            .create_array(&path)
            .map_err(|source| FrameError::StoreCreateFailed { channel: id, source })?;

        let origin = Origin::from(origin);
        let attrs: [(&str, AttrValue); 12] = [
            ("STATION_ID", id.station.into()),
            ("RSP_ID", id.rsp.into()),
            ("RCU_ID", id.rcu.into()),
            ("TIME", origin.unix_time.into()),
            ("SAMPLE_NUMBER", origin.sample_number.into()),
            ("SAMPLES_PER_FRAME", header.samples_per_frame.into()),
            ("NYQUIST_ZONE", 1u32.into()),
            ("SAMPLE_FREQUENCY_VALUE", (sample_rate_hz as f64 / 1e6).into()),
            ("SAMPLE_FREQUENCY_UNIT", "MHz".into()),
            ("DATATYPE", "i16".into()),
            ("DATA_LENGTH", 0u64.into()),
            ("DIPOLE_ID", id.dipole_id().into()),
        ];
        for (key, value) in attrs {
            if let Err(e) = array.set_attribute(key, value) {
                tracing::warn!(array = %path, key, err = %e, "failed to set channel attribute");
            }
        }

        tracing::info!(
            station = id.station,
            rsp = id.rsp,
            rcu = id.rcu,
            array = %path,
            origin_time = origin.unix_time,
            origin_sample = origin.sample_number,
            "new channel"
        );
        self.stations.slots[station.0].channel_count += 1;
        let slot = self.channels.insert(
            id,
            ChannelRecord { id, station, origin, dimensions: 0, array },
        );
        Ok(ChannelHandle(slot))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BAND_SELECTOR_SIZE;
    use crate::store::MemoryStore;

    fn make_header(station: u8, rsp: u8, rcu: u8) -> FrameHeader {
        FrameHeader {
            station_id: station,
            rsp_id: rsp,
            rcu_id: rcu,
            sample_frequency_code: 200,
            sequence_number: 0,
            unix_time: 1_000,
            sample_number: 2_048,
            samples_per_frame: 1024,
            frequency_band_count: 0,
            band_selector: [0; BAND_SELECTOR_SIZE],
            spare: 0,
            header_crc: 0,
        }
    }

    fn time(t: i32, n: u32) -> CorrectedTime {
        CorrectedTime { unix_time: t, sample_number: n }
    }

    #[test]
    fn test_channel_naming() {
        let id = ChannelId::new(1, 2, 33);
        assert_eq!(id.array_name(), "001002033");
        assert_eq!(id.dipole_id(), 1_002_033);
        assert_eq!(station_group_name(7), "Station007");
    }

    #[test]
    fn test_grouped_layout_creates_station_group() {
        let mut store = MemoryStore::new();
        let mut reg = Registry::new(StoreLayout::Grouped, 2, 5);
        let h = make_header(3, 1, 4);
        let ch = reg.find_or_create_channel(&mut store, &h, time(1_000, 2_048), 200_000_000).unwrap();

        assert!(store.has_group("Station003"));
        assert_eq!(reg.channel(ch).array_path(), "Station003/003001004");
        assert_eq!(store.attribute("Station003", "OBSERVATION_MODE"), Some("Transient".into()));
        assert_eq!(store.attribute("Station003/003001004", "SAMPLE_NUMBER"), Some(AttrValue::Unsigned(2_048)));
        assert_eq!(reg.station(reg.channel(ch).station).channel_count, 1);
    }

    #[test]
    fn test_flat_layout_has_no_groups() {
        let mut store = MemoryStore::new();
        let mut reg = Registry::new(StoreLayout::Flat, 2, 5);
        let ch = reg
            .find_or_create_channel(&mut store, &make_header(3, 1, 4), time(0, 0), 200_000_000)
            .unwrap();
        assert!(!store.has_group("Station003"));
        assert_eq!(reg.channel(ch).array_path(), "003001004");
        assert_eq!(reg.station_count(), 1);
    }

    #[test]
    fn test_lookup_is_stable_and_origin_permanent() {
        let mut store = MemoryStore::new();
        let mut reg = Registry::new(StoreLayout::Grouped, 2, 5);
        let h = make_header(0, 0, 0);
        let a = reg.find_or_create_channel(&mut store, &h, time(10, 5), 200).unwrap();
        let b = reg.find_or_create_channel(&mut store, &h, time(99, 7), 200).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.channel(a).origin, Origin { unix_time: 10, sample_number: 5 });
        assert_eq!(reg.channel_count(), 1);
        assert_eq!(reg.find_channel(ChannelId::new(0, 0, 0)), Some(a));
    }

    #[test]
    fn test_channel_capacity() {
        let mut store = MemoryStore::new();
        let mut reg = Registry::new(StoreLayout::Grouped, 2, 2);
        reg.find_or_create_channel(&mut store, &make_header(0, 0, 0), time(0, 0), 200).unwrap();
        reg.find_or_create_channel(&mut store, &make_header(0, 0, 1), time(0, 0), 200).unwrap();
        let err = reg
            .find_or_create_channel(&mut store, &make_header(0, 0, 2), time(0, 0), 200)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::RegistryCapacityExceeded { kind: CapacityKind::Channels, capacity: 2, .. }
        ));
        // Known channels still resolve.
        assert!(reg.find_or_create_channel(&mut store, &make_header(0, 0, 1), time(0, 0), 200).is_ok());
        assert_eq!(store.array_paths().len(), 2);
    }

    #[test]
    fn test_station_capacity() {
        let mut store = MemoryStore::new();
        let mut reg = Registry::new(StoreLayout::Grouped, 1, 10);
        reg.find_or_create_channel(&mut store, &make_header(1, 0, 0), time(0, 0), 200).unwrap();
        let err = reg
            .find_or_create_channel(&mut store, &make_header(2, 0, 0), time(0, 0), 200)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::RegistryCapacityExceeded { kind: CapacityKind::Stations, .. }
        ));
        assert!(!store.has_group("Station002"));
        assert_eq!(reg.channel_count(), 1);
        // Another channel on the known station is fine.
        assert!(reg.find_or_create_channel(&mut store, &make_header(1, 0, 1), time(0, 0), 200).is_ok());
    }

    #[test]
    fn test_store_failure_is_frame_error() {
        let mut store = MemoryStore::new();
        store.create_group("Station004").unwrap();
        let mut reg = Registry::new(StoreLayout::Grouped, 2, 2);
        let err = reg
            .find_or_create_channel(&mut store, &make_header(4, 0, 0), time(0, 0), 200)
            .unwrap_err();
        assert!(matches!(err, FrameError::StoreCreateFailed { .. }));
        assert_eq!(reg.channel_count(), 0);
    }
}
