pub mod crc;
pub mod error;
pub mod header;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod stats;
pub mod store;
pub mod timestamp;
pub mod writer;

pub use error::{DiscardReason, FrameError, SessionError, StoreError};
pub use header::{ByteOrder, FrameHeader, HEADER_SIZE, STANDARD_FRAME_SIZE};
pub use receiver::{FrameReceiver, ReceiveEnd, ReceiverConfig};
pub use registry::{ChannelId, Registry, StoreLayout};
pub use session::{IngestSession, SessionConfig, SessionSummary, TimestampProfiles};
pub use stats::{IngestReport, IngestStats, IngestStatsSnapshot};
pub use store::{AttrValue, FileStore, MemoryStore, SampleArray, SampleStore};
pub use timestamp::{CorrectionProfile, FixLevel, TimestampCorrector};
pub use writer::{Placement, SampleRates, SampleWriter};
