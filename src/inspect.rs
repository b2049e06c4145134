//! `tbbingest inspect`: print decoded frame headers from a dump file.
//!
//! Shows each frame's channel, clock, raw and corrected time stamp and the
//! header CRC verdict, without writing anything.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tbb_ingest::crc;
use tbb_ingest::{FrameHeader, SessionConfig, HEADER_SIZE};

use crate::color;

pub fn run(session: &SessionConfig, input: &Path, frame_size: usize, count: usize) -> Result<()> {
    if frame_size < HEADER_SIZE {
        anyhow::bail!("--frame-size {frame_size} is smaller than the {HEADER_SIZE}-byte header");
    }
    let file = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; frame_size];
    let mut corrector = session.corrector();

    println!(
        "{}  {}  {:>5}  {:>10}  {:<19}  {:>10}  {:>10}  {:>5}  {}",
        color::rpad("#", 5),
        color::rpad("CHANNEL", 11),
        "MHz",
        "SEQNR",
        "TIME (UTC)",
        "SAMPLE_NR",
        "FIXED_NR",
        "N",
        "CRC"
    );
    println!("{:-<100}", "");

    for idx in 0..count {
        if let Err(e) = reader.read_exact(&mut buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                break;
            }
            return Err(e).with_context(|| format!("failed to read {}", input.display()));
        }
        let h = match FrameHeader::decode(&buf, session.byte_order) {
            Ok(h) => h,
            Err(e) => {
                println!("{}  {}", color::rpad(&idx.to_string(), 5), color::red(&e.to_string()));
                continue;
            }
        };
        println!("{}", format_row(idx, &h, &mut corrector));
    }
    Ok(())
}

fn format_row(idx: usize, h: &FrameHeader, corrector: &mut tbb_ingest::TimestampCorrector) -> String {
    let fixed = corrector.correct(h);
    let time = Utc
        .timestamp_opt(h.unix_time as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| h.unix_time.to_string());
    let time = if fixed.unix_time != h.unix_time {
        color::yellow(&format!("{time}*"))
    } else {
        time
    };
    let verdict = match crc::verify_header(h) {
        Ok(()) => color::green("ok"),
        Err(_) => color::red(&format!("BAD {:#06x}", crc::header_crc(h))),
    };
    let mode = if h.is_transient() {
        String::new()
    } else {
        color::dim(&format!("  spectral ({} bands)", h.frequency_band_count))
    };
    format!(
        "{}  {:03}/{:03}/{:03}  {:>5}  {:>10}  {}  {:>10}  {:>10}  {:>5}  {}{}",
        color::rpad(&idx.to_string(), 5),
        h.station_id,
        h.rsp_id,
        h.rcu_id,
        h.sample_frequency_code,
        h.sequence_number,
        color::rpad(&time, 20),
        h.sample_number,
        fixed.sample_number,
        h.samples_per_frame,
        verdict,
        mode
    )
}
