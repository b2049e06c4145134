//! UDP frame receiver.
//!
//! Binds a UDP socket, and forwards every datagram as one raw frame into a
//! bounded channel for the ingest thread. The receiver never blocks on the
//! channel: when the ingest side falls behind, frames are dropped and
//! counted, like a full ring buffer on the boards.
//!
//! Several receivers (one per board port) may share one channel and one
//! stop flag. A receiver stays bound between calls to [`FrameReceiver::run`],
//! so the same sockets serve one event after another.

use anyhow::Result;
use crossbeam_channel::{Sender, TrySendError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::stats::IngestStats;

// Large enough for any TBB frame; jumbo frames are the practical ceiling.
const PKT_CAP: usize = 9000;
const RECV_BUF: usize = 16 * 1024 * 1024;
// Upper bound on how long the loop goes without checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind: SocketAddrV4,
    /// How long to wait for the first frame; `None` waits forever.
    pub start_timeout: Option<Duration>,
    /// Once frames have arrived, a pause this long ends reception.
    pub read_timeout: Duration,
}

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The stop flag was cleared or the ingest side hung up.
    Stopped,
    /// No frame arrived within the start timeout.
    StartTimeout,
    /// The stream went quiet for longer than the read timeout.
    Quiet,
}

pub struct FrameReceiver {
    socket: UdpSocket,
    tx: Sender<Vec<u8>>,
    config: ReceiverConfig,
    running: Arc<AtomicBool>,
}

impl FrameReceiver {
    pub fn bind(
        config: ReceiverConfig,
        tx: Sender<Vec<u8>>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(RECV_BUF).ok();
        if let Ok(actual) = socket.recv_buffer_size() {
            if actual < RECV_BUF / 2 {
                tracing::warn!(
                    "recv buffer is {}KB (wanted {}KB); frames may be lost at full rate; \
                     raise net.core.rmem_max",
                    actual / 1024,
                    RECV_BUF / 1024
                );
            }
        }
        socket.bind(&config.bind.into())?;

        let socket: UdpSocket = socket.into();
        let poll = config.read_timeout.min(POLL_INTERVAL).max(Duration::from_millis(1));
        socket.set_read_timeout(Some(poll))?;

        Ok(Self { socket, tx, config, running })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive into `stats` until stopped, timed out or the stream goes quiet.
    ///
    /// Empty datagrams are counted and forwarded like any other; the session
    /// rejects them as malformed.
    pub fn run(&self, stats: &IngestStats) -> Result<ReceiveEnd> {
        tracing::info!(addr = %self.local_addr()?, "frame receiver started");
        let mut buf = vec![0u8; PKT_CAP];
        let started = Instant::now();
        let mut last_frame: Option<Instant> = None;

        while self.running.load(Relaxed) {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    last_frame = Some(Instant::now());
                    stats.record_received(n);
                    match self.tx.try_send(buf[..n].to_vec()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => stats.record_dropped(),
                        Err(TrySendError::Disconnected(_)) => return Ok(ReceiveEnd::Stopped),
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    match last_frame {
                        None => {
                            if let Some(limit) = self.config.start_timeout {
                                if started.elapsed() >= limit {
                                    tracing::info!("no frames before start timeout");
                                    return Ok(ReceiveEnd::StartTimeout);
                                }
                            }
                        }
                        Some(at) => {
                            if at.elapsed() >= self.config.read_timeout {
                                tracing::info!("stream quiet, receiver stopping");
                                return Ok(ReceiveEnd::Quiet);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ReceiveEnd::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::net::Ipv4Addr;

    fn make_config(start_timeout: Option<Duration>) -> ReceiverConfig {
        ReceiverConfig {
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            start_timeout,
            read_timeout: Duration::from_millis(300),
        }
    }

    fn make_sender() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    #[test]
    fn test_frames_are_forwarded() {
        let (tx, rx) = bounded(16);
        let stats = IngestStats::new();
        let running = Arc::new(AtomicBool::new(true));
        let receiver = FrameReceiver::bind(make_config(None), tx, running).unwrap();
        let addr = receiver.local_addr().unwrap();

        let sender = make_sender();
        sender.send_to(&[1u8; 2140], addr).unwrap();
        sender.send_to(&[2u8; 100], addr).unwrap();

        assert_eq!(receiver.run(&stats).unwrap(), ReceiveEnd::Quiet);
        let frames: Vec<Vec<u8>> = rx.try_iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 2140);
        assert_eq!(frames[1], vec![2u8; 100]);
        assert_eq!(stats.snapshot().bytes_received, 2240);
    }

    #[test]
    fn test_empty_datagram_is_counted_and_forwarded() {
        let (tx, rx) = bounded(16);
        let stats = IngestStats::new();
        let receiver =
            FrameReceiver::bind(make_config(None), tx, Arc::new(AtomicBool::new(true))).unwrap();
        let addr = receiver.local_addr().unwrap();

        let sender = make_sender();
        sender.send_to(&[], addr).unwrap();
        sender.send_to(&[7u8; 10], addr).unwrap();

        assert_eq!(receiver.run(&stats).unwrap(), ReceiveEnd::Quiet);
        let frames: Vec<Vec<u8>> = rx.try_iter().collect();
        assert_eq!(frames, vec![Vec::new(), vec![7u8; 10]]);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.bytes_received, 10);
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (tx, rx) = bounded(1);
        let stats = IngestStats::new();
        let receiver =
            FrameReceiver::bind(make_config(None), tx, Arc::new(AtomicBool::new(true))).unwrap();
        let addr = receiver.local_addr().unwrap();

        let sender = make_sender();
        for i in 0..3u8 {
            sender.send_to(&[i; 64], addr).unwrap();
        }

        receiver.run(&stats).unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 3);
        assert_eq!(snap.frames_dropped, 2);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_two_ports_share_channel_and_stats() {
        let (tx, rx) = bounded(16);
        let stats = IngestStats::new();
        let running = Arc::new(AtomicBool::new(true));
        let a = FrameReceiver::bind(make_config(None), tx.clone(), Arc::clone(&running)).unwrap();
        let b = FrameReceiver::bind(make_config(None), tx, Arc::clone(&running)).unwrap();

        let sender = make_sender();
        sender.send_to(&[1u8; 50], a.local_addr().unwrap()).unwrap();
        sender.send_to(&[2u8; 60], b.local_addr().unwrap()).unwrap();
        sender.send_to(&[3u8; 70], b.local_addr().unwrap()).unwrap();

        let ends = std::thread::scope(|s| {
            let ha = s.spawn(|| a.run(&stats));
            let hb = s.spawn(|| b.run(&stats));
            [ha.join().unwrap().unwrap(), hb.join().unwrap().unwrap()]
        });
        assert_eq!(ends, [ReceiveEnd::Quiet, ReceiveEnd::Quiet]);
        let mut sizes: Vec<usize> = rx.try_iter().map(|f| f.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 60, 70]);
        assert_eq!(stats.snapshot().frames_received, 3);
    }

    #[test]
    fn test_receiver_runs_again_after_quiet() {
        let (tx, rx) = bounded(16);
        let stats = IngestStats::new();
        let receiver =
            FrameReceiver::bind(make_config(None), tx, Arc::new(AtomicBool::new(true))).unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = make_sender();

        sender.send_to(&[1u8; 8], addr).unwrap();
        assert_eq!(receiver.run(&stats).unwrap(), ReceiveEnd::Quiet);
        sender.send_to(&[2u8; 8], addr).unwrap();
        assert_eq!(receiver.run(&stats).unwrap(), ReceiveEnd::Quiet);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_start_timeout() {
        let (tx, _rx) = bounded(1);
        let receiver = FrameReceiver::bind(
            make_config(Some(Duration::from_millis(150))),
            tx,
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        assert_eq!(receiver.run(&IngestStats::new()).unwrap(), ReceiveEnd::StartTimeout);
    }

    #[test]
    fn test_stop_flag() {
        let (tx, _rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(false));
        let receiver = FrameReceiver::bind(make_config(None), tx, running).unwrap();
        assert_eq!(receiver.run(&IngestStats::new()).unwrap(), ReceiveEnd::Stopped);
    }
}
