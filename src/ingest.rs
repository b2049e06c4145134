//! `tbbingest file`: ingest frames from raw dump files.
//!
//! A dump file is a plain concatenation of fixed-size frame blocks, as
//! written by the station's dump tooling. Every block is handed to the
//! session; a trailing partial block is reported and skipped.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tbb_ingest::{IngestSession, HEADER_SIZE};

use crate::config::IngestConfig;
use crate::report::RunReport;

/// Per-file block counts.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FileCounts {
    pub blocks: u64,
    /// Bytes of an incomplete block at the end of the file.
    pub trailing_bytes: usize,
}

pub fn run(
    config: &IngestConfig,
    inputs: &[PathBuf],
    output: &Path,
    frame_size: usize,
    report: Option<&Path>,
) -> Result<()> {
    if frame_size < HEADER_SIZE {
        anyhow::bail!("--frame-size {frame_size} is smaller than the {HEADER_SIZE}-byte header");
    }
    let started = Utc::now();
    let mut session =
        IngestSession::create_file(output, config.session.clone(), &config.root_attributes())
            .with_context(|| format!("failed to create session store {}", output.display()))?;

    for input in inputs {
        let counts = feed_file(&mut session, input, frame_size)?;
        eprintln!("{}: {} frames", input.display(), counts.blocks);
    }

    let counters = session.stats().snapshot();
    let summary = session.close().context("failed to flush session store")?;
    let run = RunReport::new(started, inputs.to_vec(), summary, counters);
    run.print();
    if let Some(path) = report {
        run.write(path)?;
    }
    Ok(())
}

/// Feed every complete block of `path` to the session.
pub fn feed_file(session: &mut IngestSession, path: &Path, frame_size: usize) -> Result<FileCounts> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; frame_size];
    let mut counts = FileCounts::default();

    loop {
        let n = read_block(&mut reader, &mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        if n < frame_size {
            tracing::warn!(file = %path.display(), bytes = n, "ignoring partial block at end of file");
            counts.trailing_bytes = n;
            break;
        }
        counts.blocks += 1;
        session.stats().record_received(n);
        // Discards are counted and logged by the session.
        session.process_frame(&buf).ok();
    }
    Ok(counts)
}

/// Fill `buf` from `reader`; returns fewer bytes only at end of input.
fn read_block(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
