//! CLI definitions for tbbingest.

use clap::{Args, Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tbb_ingest::{ByteOrder, FixLevel, SessionConfig, StoreLayout};

use crate::config::ListenConfig;

#[derive(Parser)]
#[clap(
    name = "tbbingest",
    version,
    about = "Ingest raw TBB transient frames\n\nValidates, time-corrects and assembles TBB frames from dump files or a live UDP stream into one sample array per station/RSP/RCU channel.",
    long_about = None
)]
pub struct Cli {
    /// Path to ingest.toml config file
    #[clap(long, short, default_value = "ingest.toml", global = true)]
    pub config: PathBuf,

    /// Log session and channel events (RUST_LOG still applies)
    #[clap(long, short, global = true)]
    pub verbose: bool,

    #[clap(flatten)]
    pub session: SessionOverrides,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest frames from one or more raw dump files
    File {
        /// Dump files holding back-to-back fixed-size frames
        #[clap(required = true)]
        inputs: Vec<PathBuf>,

        /// Session store directory to create (must not exist)
        #[clap(long, short)]
        output: PathBuf,

        /// Size of one frame block in the dump files
        #[clap(long, default_value = "2140")]
        frame_size: usize,

        /// Write a JSON report to this file
        #[clap(long)]
        report: Option<PathBuf>,
    },

    /// Receive frames over UDP until the stream goes quiet (Ctrl-C to stop)
    Listen {
        /// Base path of the stores; each event is written to
        /// <OUTPUT>-<YYYYMMDDTHHMMSS.sss>Z named after its first frame
        #[clap(long, short)]
        output: PathBuf,

        #[clap(flatten)]
        listen: ListenOverrides,

        /// Write a JSON report to this file
        #[clap(long)]
        report: Option<PathBuf>,
    },

    /// Print decoded headers, CRC verdicts and corrected time stamps
    Inspect {
        /// Dump file to read
        input: PathBuf,

        /// Size of one frame block in the dump file
        #[clap(long, default_value = "2140")]
        frame_size: usize,

        /// Number of frames to show
        #[clap(long, short = 'n', default_value = "10")]
        count: usize,
    },

    /// Print an example ingest.toml to stdout
    Init,
}

/// Command-line overrides of the `[session]` table.
#[derive(Args, Debug, Default)]
pub struct SessionOverrides {
    /// Time stamp fix level: 0 = none, 1 = legacy firmware, 2 = current firmware
    #[clap(long, global = true, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub fix_times: Option<u8>,

    /// Do not verify the header CRC
    #[clap(long, global = true)]
    pub no_header_crc: bool,

    /// Verify the payload CRC
    #[clap(long, global = true)]
    pub data_crc: bool,

    /// Input frames are big-endian
    #[clap(long, global = true)]
    pub big_endian: bool,

    /// Put channel arrays directly under the session root instead of per-station groups
    #[clap(long, global = true)]
    pub flat: bool,

    /// Maximum number of distinct stations per session
    #[clap(long, global = true)]
    pub max_stations: Option<usize>,

    /// Maximum number of distinct channels per session
    #[clap(long, global = true)]
    pub max_channels: Option<usize>,
}

impl SessionOverrides {
    pub fn apply(&self, session: &mut SessionConfig) {
        if let Some(level) = self.fix_times.and_then(FixLevel::from_level) {
            session.timestamp_fix = level;
        }
        if self.no_header_crc {
            session.header_crc_check = false;
        }
        if self.data_crc {
            session.data_crc_check = true;
        }
        if self.big_endian {
            session.byte_order = ByteOrder::Big;
        }
        if self.flat {
            session.layout = StoreLayout::Flat;
        }
        if let Some(n) = self.max_stations {
            session.max_stations = n;
        }
        if let Some(n) = self.max_channels {
            session.max_channels = n;
        }
    }
}

/// Command-line overrides of the `[listen]` table.
#[derive(Args, Debug, Default)]
pub struct ListenOverrides {
    /// UDP port to receive on; repeat for several ports
    #[clap(long = "port")]
    pub ports: Vec<u16>,

    /// Local address to bind
    #[clap(long)]
    pub bind: Option<Ipv4Addr>,

    /// Seconds to wait for the first frame (0 = forever)
    #[clap(long)]
    pub start_timeout: Option<f64>,

    /// Seconds of silence that end an event
    #[clap(long)]
    pub read_timeout: Option<f64>,

    /// Frames buffered between receiver and writer
    #[clap(long)]
    pub buffer_frames: Option<usize>,

    /// Keep waiting on silent ports after the others went quiet
    #[clap(long)]
    pub wait_for_all: bool,

    /// Store each event in its own file and wait for the next
    #[clap(long)]
    pub keep_running: bool,
}

impl ListenOverrides {
    pub fn apply(&self, listen: &mut ListenConfig) {
        if !self.ports.is_empty() {
            listen.ports = self.ports.clone();
        }
        if let Some(bind) = self.bind {
            listen.bind = bind;
        }
        if let Some(secs) = self.start_timeout {
            listen.start_timeout_secs = secs;
        }
        if let Some(secs) = self.read_timeout {
            listen.read_timeout_secs = secs;
        }
        if let Some(n) = self.buffer_frames {
            listen.buffer_frames = n;
        }
        if self.wait_for_all {
            listen.wait_for_all = true;
        }
        if self.keep_running {
            listen.keep_running = true;
        }
    }
}
