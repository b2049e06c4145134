//! End-of-run summary: terminal table plus optional JSON report.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tbb_ingest::{DiscardReason, IngestStatsSnapshot, SessionSummary};

use crate::color;

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub duration_secs: f64,
    pub inputs: Vec<PathBuf>,
    /// Frames per second over the whole run.
    pub frame_rate: f64,
    pub summary: SessionSummary,
    pub counters: IngestStatsSnapshot,
}

impl RunReport {
    pub fn new(
        started: DateTime<Utc>,
        inputs: Vec<PathBuf>,
        summary: SessionSummary,
        counters: IngestStatsSnapshot,
    ) -> Self {
        let finished = Utc::now();
        let duration_secs = (finished - started).num_milliseconds().max(0) as f64 / 1000.0;
        let frames = summary.report.processed + summary.report.discarded_total;
        let frame_rate = if duration_secs > 0.0 { frames as f64 / duration_secs } else { 0.0 };
        Self { started, finished, duration_secs, inputs, frame_rate, summary, counters }
    }

    /// Write the JSON report to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        eprintln!("Report written to {}", path.display());
        Ok(())
    }

    /// Print the human-readable summary to stdout.
    pub fn print(&self) {
        let s = &self.summary;
        let width = 60;
        let on_off = |b: bool| if b { color::green("on") } else { color::dim("off") };
        let row = |label: &str, value: String| {
            println!("  {} {}", color::rpad(&color::bold(label), 20), value);
        };

        println!("{:=<width$}", "");
        println!(
            "{}",
            color::bold_cyan(&format!(
                " TBB INGEST  {}  ({})",
                s.name,
                self.finished.format("%Y-%m-%d %H:%M:%S UTC")
            ))
        );
        println!("{:=<width$}", "");

        row("byte order", format!("{:?}", s.byte_order).to_lowercase());
        row("header CRC", on_off(s.header_crc_check));
        row("data CRC", on_off(s.data_crc_check));
        row("time fix level", s.timestamp_fix.level().to_string());
        row("layout", format!("{:?}", s.layout).to_lowercase());
        println!("{:-<width$}", "");

        row("frames processed", color::green(&s.report.processed.to_string()));
        let broken = s.report.discarded_header_crc;
        let broken_text = match s.report.header_crc_failure_ratio {
            Some(r) => format!("{} ({:.2}%)", broken, r * 100.0),
            None => broken.to_string(),
        };
        row(
            "broken header",
            if broken > 0 { color::red(&broken_text) } else { broken_text },
        );
        for reason in DiscardReason::ALL {
            if reason == DiscardReason::HeaderCrc {
                continue;
            }
            let n = self.counters.discarded.get(reason);
            if n > 0 {
                row(&format!("discarded: {}", reason.as_str()), color::yellow(&n.to_string()));
            }
        }
        if self.counters.frames_dropped > 0 {
            row("dropped (buffer)", color::red(&self.counters.frames_dropped.to_string()));
        }
        row(
            "written",
            format!(
                "{} channels, {} stations, {} samples",
                s.channels, s.stations, s.samples_stored
            ),
        );
        row(
            "elapsed",
            format!("{:.1}s  ({:.0} frames/s)", self.duration_secs, self.frame_rate),
        );
        println!("{:=<width$}", "");
    }
}
