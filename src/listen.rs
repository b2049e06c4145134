//! `tbbingest listen`: ingest live UDP frame streams.
//!
//! One receiver thread per port moves datagrams into a shared bounded
//! channel; this thread drains it through the session. An event ends once
//! every receiver has finished: its stream went quiet, the start timeout
//! passed without traffic, or Ctrl-C. Each event is written to its own store
//! named after the corrected time of its first frame. With `keep_running`
//! the next event follows on the same sockets.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tbb_ingest::{
    FrameHeader, FrameReceiver, IngestSession, IngestStats, ReceiveEnd, SampleRates,
    SessionConfig,
};

use crate::config::IngestConfig;
use crate::report::RunReport;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

const DRAIN_POLL: Duration = Duration::from_millis(200);

pub fn run(config: &IngestConfig, output: &Path, report: Option<&Path>) -> Result<()> {
    if config.listen.ports.is_empty() {
        anyhow::bail!("no UDP port configured; pass --port or set [listen] ports");
    }
    let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(config.listen.buffer_frames.max(1));
    let receiving = Arc::new(AtomicBool::new(true));
    let receivers = config
        .listen
        .receiver_configs()
        .into_iter()
        .map(|rc| {
            let addr = rc.bind;
            FrameReceiver::bind(rc, tx.clone(), Arc::clone(&receiving))
                .with_context(|| format!("failed to bind UDP {addr}"))
        })
        .collect::<Result<Vec<_>>>()?;
    drop(tx);
    for receiver in &receivers {
        eprintln!("Listening on {}", receiver.local_addr()?);
    }
    eprintln!("Ctrl-C to stop");

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    let listener = Listener {
        config,
        output,
        receivers: &receivers,
        rx: &rx,
        receiving: &receiving,
        running: &RUNNING,
    };
    let mut events = 0;
    loop {
        match listener.next_event()? {
            Some(run) => {
                run.print();
                if let Some(path) = report {
                    run.write(&numbered(path, events))?;
                }
                events += 1;
            }
            None => eprintln!("No frames received"),
        }
        if !config.listen.keep_running || !RUNNING.load(Ordering::SeqCst) {
            break;
        }
    }
    Ok(())
}

/// Receivers bound once and reused for every event.
struct Listener<'a> {
    config: &'a IngestConfig,
    output: &'a Path,
    receivers: &'a [FrameReceiver],
    rx: &'a Receiver<Vec<u8>>,
    /// Shared stop flag of the receivers.
    receiving: &'a AtomicBool,
    /// Cleared on Ctrl-C.
    running: &'a AtomicBool,
}

impl Listener<'_> {
    /// Receive one event into a new store. None if no frame arrived.
    fn next_event(&self) -> Result<Option<RunReport>> {
        let started = Utc::now();
        let stats = IngestStats::new();
        let mut session: Option<IngestSession> = None;
        self.receiving.store(true, Ordering::Relaxed);

        let ends = std::thread::scope(|scope| -> Result<Vec<ReceiveEnd>> {
            let mut handles = Vec::with_capacity(self.receivers.len());
            for receiver in self.receivers {
                let stats = &*stats;
                let handle = std::thread::Builder::new()
                    .name("tbb-recv".into())
                    .spawn_scoped(scope, move || receiver.run(stats));
                match handle {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        self.receiving.store(false, Ordering::Relaxed);
                        return Err(e.into());
                    }
                }
            }
            let drained = self.drain(&stats, &mut session, || {
                handles.iter().all(|h| h.is_finished())
            });
            // Stops receivers still waiting when the drain failed.
            self.receiving.store(false, Ordering::Relaxed);
            let ends = handles
                .into_iter()
                .map(|h| h.join().map_err(|_| anyhow::anyhow!("receiver thread panicked"))?)
                .collect::<Result<Vec<_>>>();
            drained?;
            ends
        })?;

        let mut inputs = Vec::with_capacity(self.receivers.len());
        for (receiver, end) in self.receivers.iter().zip(&ends) {
            let addr = receiver.local_addr()?;
            tracing::info!(%addr, end = ?end, "receiver finished");
            inputs.push(PathBuf::from(format!("udp://{addr}")));
        }

        let Some(session) = session else {
            return Ok(None);
        };
        if self.running.load(Ordering::SeqCst) {
            eprintln!("Stream quiet, closing {}", session.name());
        } else {
            eprintln!("Stopped, closing {}", session.name());
        }
        let counters = session.stats().snapshot();
        let summary = session.close().context("failed to flush session store")?;
        Ok(Some(RunReport::new(started, inputs, summary, counters)))
    }

    /// Feed frames to the event's session until every receiver is done and
    /// the channel is empty. The store is created on the first frame.
    fn drain(
        &self,
        stats: &Arc<IngestStats>,
        session: &mut Option<IngestSession>,
        receivers_done: impl Fn() -> bool,
    ) -> Result<()> {
        let read_timeout = self.config.listen.read_timeout();
        let mut last_frame: Option<Instant> = None;
        loop {
            match self.rx.recv_timeout(DRAIN_POLL) {
                Ok(frame) => {
                    last_frame = Some(Instant::now());
                    if session.is_none() {
                        *session = Some(self.open_store(&frame, stats)?);
                    }
                    if let Some(s) = session.as_mut() {
                        // Discards are counted and logged by the session.
                        s.process_frame(&frame).ok();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
            if !self.running.load(Ordering::SeqCst) {
                self.receiving.store(false, Ordering::Relaxed);
            }
            // Ports that sent nothing are not waited for once the rest went quiet.
            let quiet = last_frame.is_some_and(|at| at.elapsed() >= read_timeout);
            if quiet && !self.config.listen.wait_for_all {
                self.receiving.store(false, Ordering::Relaxed);
            }
            if receivers_done() && self.rx.is_empty() {
                return Ok(());
            }
        }
    }

    fn open_store(&self, first: &[u8], stats: &Arc<IngestStats>) -> Result<IngestSession> {
        let path = free_path(&event_store_path(self.output, first, &self.config.session));
        let session = IngestSession::create_file(
            &path,
            self.config.session.clone(),
            &self.config.root_attributes(),
        )
        .with_context(|| format!("failed to create session store {}", path.display()))?
        .with_stats(Arc::clone(stats));
        eprintln!("Event started, writing {}", path.display());
        Ok(session)
    }
}

/// Corrected time of a frame, including the sub-second part.
fn frame_time(frame: &[u8], session: &SessionConfig) -> Option<DateTime<Utc>> {
    let header = FrameHeader::decode(frame, session.byte_order).ok()?;
    let time = session.corrector().correct(&header);
    let nanos = SampleRates::new(session.sample_rates.clone())
        .rate_hz(header.sample_frequency_code)
        .ok()
        .and_then(|rate| (u64::from(time.sample_number) * 1_000_000_000).checked_div(rate))
        .unwrap_or(0);
    let second = Utc.timestamp_opt(i64::from(time.unix_time), 0).single()?;
    Some(second + chrono::Duration::nanoseconds(nanos as i64))
}

/// `<base>-YYYYMMDDTHHMMSS.sssZ` for the event starting with `first`.
/// Frames without a readable header fall back to the local clock.
fn event_store_path(base: &Path, first: &[u8], session: &SessionConfig) -> PathBuf {
    let time = frame_time(first, session).unwrap_or_else(Utc::now);
    let mut name = OsString::from(base.as_os_str());
    name.push(format!("-{}", time.format("%Y%m%dT%H%M%S%.3fZ")));
    PathBuf::from(name)
}

/// `path`, or `path-N` with the lowest N that does not exist yet.
fn free_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let mut n = 0u32;
    loop {
        let candidate = suffixed(path, &n.to_string());
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!("-{suffix}"));
    PathBuf::from(name)
}

/// Report path for the n-th event: the path itself first, then
/// `<stem>-<n>.<ext>`.
fn numbered(path: &Path, n: usize) -> PathBuf {
    if n == 0 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{n}"),
    };
    path.with_file_name(name)
}
