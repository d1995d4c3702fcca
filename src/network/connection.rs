// Per-connection I/O machinery shared by the server and client sides.
//
// Each established connection runs three tasks:
// - a writer draining an ordered queue of frames,
// - a reader enforcing the read-idle watchdog and pause/resume gating,
// - a heartbeat timer pushing a heartbeat frame on write-idle, never
//   pipelining a second one before the first was flushed.
//
// The reader accumulates into a persistent buffer and parses complete frames
// from it, so cancelling an in-flight read (timeout, pause, shutdown) never
// desynchronizes the stream.

use crate::error::{ClusterError, Result};
use crate::metrics::NetworkMetrics;
use crate::network::frame::write_frame;
use crate::network::protocol::{HeartbeatParams, TransportFrame};
use bytes::{Buf, Bytes, BytesMut};
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Inbound side of a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(Bytes),
    Disconnected(Option<ClusterError>),
}

pub(crate) struct WriteItem {
    pub frame: Bytes,
    pub heartbeat: bool,
    pub done: Option<oneshot::Sender<Result<()>>>,
}

struct SenderShared {
    tx: mpsc::Sender<WriteItem>,
    pause_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    remote: SocketAddr,
}

/// Handle for writing to and controlling one connection.
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<SenderShared>,
}

impl ConnectionSender {
    /// Enqueues a data payload and resolves once it was written out.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue_item(WriteItem {
            frame: TransportFrame::Data(payload).encode(),
            heartbeat: false,
            done: Some(done_tx),
        })
        .await?;
        done_rx
            .await
            .map_err(|_| ClusterError::ChannelClosed(self.closed_msg()))?
    }

    /// Enqueues a data payload without waiting for the write to complete.
    pub async fn enqueue(&self, payload: Bytes) -> Result<()> {
        self.enqueue_item(WriteItem {
            frame: TransportFrame::Data(payload).encode(),
            heartbeat: false,
            done: None,
        })
        .await
    }

    async fn enqueue_item(&self, item: WriteItem) -> Result<()> {
        self.shared
            .tx
            .send(item)
            .await
            .map_err(|_| ClusterError::ChannelClosed(self.closed_msg()))
    }

    /// Disables auto-reads; the read-idle watchdog is suspended while paused.
    pub fn pause_receiving(&self) {
        self.shared.pause_tx.send_replace(true);
    }

    /// Re-enables auto-reads. One read timeout immediately after resume is
    /// ignored so an in-flight heartbeat is not misclassified as a failure.
    pub fn resume_receiving(&self) {
        self.shared.pause_tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.pause_tx.borrow()
    }

    pub fn remote(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tx.is_closed()
    }

    /// Initiates a disconnect; in-flight sends fail with a closed-channel
    /// error.
    pub fn disconnect(&self) {
        self.shared.shutdown_tx.send_replace(true);
    }

    fn closed_msg(&self) -> String {
        format!("connection to {} is closed", self.shared.remote)
    }
}

/// Wires up the writer, reader and heartbeat tasks for an established,
/// handshaken stream. Inbound data frames and the final disconnect flow into
/// `events`.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    params: HeartbeatParams,
    max_frame_size: usize,
    metrics: Arc<NetworkMetrics>,
    events: mpsc::Sender<ConnectionEvent>,
) -> ConnectionSender {
    let remote = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::channel::<WriteItem>(1024);
    let (pause_tx, pause_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let last_write = Arc::new(AtomicU64::new(now_ms()));
    let hb_in_flight = Arc::new(AtomicBool::new(false));

    metrics.connection_opened();

    tokio::spawn(run_write_loop(
        write_half,
        rx,
        shutdown_rx.clone(),
        last_write.clone(),
        hb_in_flight.clone(),
        metrics.clone(),
    ));

    tokio::spawn(run_read_loop(
        read_half,
        params,
        max_frame_size,
        pause_rx,
        shutdown_rx,
        events,
        metrics.clone(),
    ));

    if !params.disabled && !params.interval.is_zero() {
        tokio::spawn(run_heartbeat_loop(
            tx.clone(),
            params.interval,
            last_write,
            hb_in_flight,
        ));
    }

    ConnectionSender {
        shared: Arc::new(SenderShared {
            tx,
            pause_tx,
            shutdown_tx,
            remote,
        }),
    }
}

async fn run_write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WriteItem>,
    mut shutdown_rx: watch::Receiver<bool>,
    last_write: Arc<AtomicU64>,
    hb_in_flight: Arc<AtomicBool>,
    metrics: Arc<NetworkMetrics>,
) {
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        let result = write_frame(&mut write_half, &item.frame).await;
        last_write.store(now_ms(), Ordering::Relaxed);
        if item.heartbeat {
            hb_in_flight.store(false, Ordering::Release);
        }

        let failed = result.is_err();
        match result {
            Ok(()) => {
                metrics.message_sent(item.frame.len());
                if let Some(done) = item.done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                metrics.send_error();
                if let Some(done) = item.done {
                    let _ = done.send(Err(e));
                }
            }
        }
        if failed {
            break;
        }
    }

    // Fail anything still queued so callers never hang on a dead connection.
    rx.close();
    while let Ok(item) = rx.try_recv() {
        if let Some(done) = item.done {
            let _ = done.send(Err(ClusterError::ChannelClosed(
                "connection closed before write".to_string(),
            )));
        }
    }
    let _ = write_half.shutdown().await;
}

/// Extracts one complete `length | type | body` frame from the buffer, if
/// present.
fn try_parse_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<(u8, Bytes)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return Err(ClusterError::Codec("zero-length frame".to_string()));
    }
    if len > max_frame_size {
        return Err(ClusterError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_size
        )));
    }
    if buf.len() < 4 + len {
        buf.reserve(4 + len - buf.len());
        return Ok(None);
    }
    buf.advance(4);
    let frame = buf.split_to(len).freeze();
    let frame_type = frame[0];
    Ok(Some((frame_type, frame.slice(1..))))
}

async fn run_read_loop(
    mut read_half: OwnedReadHalf,
    params: HeartbeatParams,
    max_frame_size: usize,
    mut pause_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    events: mpsc::Sender<ConnectionEvent>,
    metrics: Arc<NetworkMetrics>,
) {
    let read_idle = params.read_idle_timeout();
    let mut ignore_next_timeout = false;
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let reason: Option<ClusterError> = 'conn: loop {
        if *shutdown_rx.borrow() {
            break None;
        }

        // Auto-read gate: while paused, no reads happen and the read-idle
        // watchdog does not run.
        while *pause_rx.borrow() {
            tokio::select! {
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        break 'conn None;
                    }
                    if !*pause_rx.borrow() {
                        ignore_next_timeout = true;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break 'conn None;
                    }
                }
            }
        }

        // Drain every complete frame already buffered.
        loop {
            match try_parse_frame(&mut buf, max_frame_size) {
                Err(e) => break 'conn Some(e),
                Ok(None) => break,
                Ok(Some((ftype, body))) => {
                    ignore_next_timeout = false;
                    metrics.message_received(body.len() + 1);
                    match TransportFrame::decode(ftype, body) {
                        Ok(TransportFrame::Heartbeat) => continue,
                        Ok(TransportFrame::Data(payload)) => {
                            if events.send(ConnectionEvent::Message(payload)).await.is_err() {
                                break 'conn None;
                            }
                        }
                        Ok(_) => {
                            break 'conn Some(ClusterError::Codec(
                                "unexpected handshake frame on established connection".to_string(),
                            ));
                        }
                        Err(e) => break 'conn Some(e),
                    }
                }
            }
            if *pause_rx.borrow() {
                continue 'conn;
            }
        }

        // Need more bytes. `read_buf` is cancel-safe, so timing out or
        // reacting to pause/shutdown cannot lose stream bytes.
        tokio::select! {
            read = tokio::time::timeout(read_idle, read_half.read_buf(&mut buf)) => {
                match read {
                    Err(_elapsed) => {
                        if *pause_rx.borrow() {
                            continue;
                        }
                        if ignore_next_timeout {
                            ignore_next_timeout = false;
                            continue;
                        }
                        break Some(ClusterError::Timeout(format!(
                            "no data within {:?}",
                            read_idle
                        )));
                    }
                    Ok(Ok(0)) => break None,
                    Ok(Ok(_n)) => continue,
                    Ok(Err(e)) => {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            break None;
                        }
                        break Some(ClusterError::Io(e));
                    }
                }
            }
            changed = pause_rx.changed() => {
                if changed.is_err() {
                    break None;
                }
                if !*pause_rx.borrow() {
                    ignore_next_timeout = true;
                }
                continue;
            }
            _ = shutdown_rx.changed() => continue,
        }
    };

    metrics.connection_closed();
    let _ = events.send(ConnectionEvent::Disconnected(reason)).await;
}

async fn run_heartbeat_loop(
    tx: mpsc::Sender<WriteItem>,
    interval: Duration,
    last_write: Arc<AtomicU64>,
    hb_in_flight: Arc<AtomicBool>,
) {
    let interval_ms = interval.as_millis() as u64;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            break;
        }

        let idle = now_ms().saturating_sub(last_write.load(Ordering::Relaxed)) >= interval_ms;
        if !idle {
            continue;
        }
        // Only one heartbeat may be in flight at a time.
        if hb_in_flight.swap(true, Ordering::AcqRel) {
            continue;
        }
        let item = WriteItem {
            frame: TransportFrame::Heartbeat.encode(),
            heartbeat: true,
            done: None,
        };
        if tx.send(item).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn params(interval_ms: u64, disabled: bool) -> HeartbeatParams {
        HeartbeatParams {
            interval: Duration::from_millis(interval_ms),
            loss_threshold: 3,
            disabled,
        }
    }

    #[test]
    fn test_try_parse_partial_and_complete() {
        let mut buf = BytesMut::new();
        let frame = TransportFrame::Data(Bytes::from_static(b"abc")).encode();

        buf.extend_from_slice(&frame[..3]);
        assert!(try_parse_frame(&mut buf, 1 << 20).unwrap().is_none());

        buf.extend_from_slice(&frame[3..]);
        let (ftype, body) = try_parse_frame(&mut buf, 1 << 20).unwrap().unwrap();
        assert_eq!(ftype, crate::network::protocol::frame_type::DATA);
        assert_eq!(body.as_ref(), b"abc");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = connected_pair().await;
        let metrics = NetworkMetrics::new();

        let (a_events_tx, _a_events) = mpsc::channel(16);
        let (b_events_tx, mut b_events) = mpsc::channel(16);

        let a_sender =
            spawn_connection(a, params(1000, false), 1 << 20, metrics.clone(), a_events_tx);
        let _b_sender =
            spawn_connection(b, params(1000, false), 1 << 20, metrics.clone(), b_events_tx);

        a_sender.send(Bytes::from_static(b"one")).await.unwrap();
        a_sender.send(Bytes::from_static(b"two")).await.unwrap();

        match b_events.recv().await.unwrap() {
            ConnectionEvent::Message(m) => assert_eq!(m.as_ref(), b"one"),
            other => panic!("unexpected: {:?}", other),
        }
        match b_events.recv().await.unwrap() {
            ConnectionEvent::Message(m) => assert_eq!(m.as_ref(), b"two"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeats_keep_idle_connection_alive() {
        let (a, b) = connected_pair().await;
        let metrics = NetworkMetrics::new();

        let (a_events_tx, mut a_events) = mpsc::channel(16);
        let (b_events_tx, mut b_events) = mpsc::channel(16);

        // 50ms heartbeat, 150ms read-idle on both sides.
        let _a =
            spawn_connection(a, params(50, false), 1 << 20, metrics.clone(), a_events_tx);
        let _b =
            spawn_connection(b, params(50, false), 1 << 20, metrics.clone(), b_events_tx);

        // No data flows; heartbeats must keep both read loops satisfied.
        let outcome = tokio::time::timeout(Duration::from_millis(400), async {
            tokio::select! {
                e = a_events.recv() => e,
                e = b_events.recv() => e,
            }
        })
        .await;
        assert!(outcome.is_err(), "connection dropped: {:?}", outcome);
    }

    #[tokio::test]
    async fn test_read_timeout_when_peer_silent() {
        let (a, b) = connected_pair().await;
        let metrics = NetworkMetrics::new();

        let (a_events_tx, mut a_events) = mpsc::channel(16);
        // Neither side emits heartbeats.
        let (b_events_tx, _b_events) = mpsc::channel(16);

        let _a = spawn_connection(a, params(50, true), 1 << 20, metrics.clone(), a_events_tx);
        let _b = spawn_connection(b, params(50, true), 1 << 20, metrics.clone(), b_events_tx);

        match tokio::time::timeout(Duration::from_secs(1), a_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ConnectionEvent::Disconnected(Some(ClusterError::Timeout(_))) => {}
            other => panic!("expected read timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_suspends_watchdog_and_resume_delivers() {
        let (a, b) = connected_pair().await;
        let metrics = NetworkMetrics::new();

        let (a_events_tx, _a_events) = mpsc::channel(16);
        let (b_events_tx, mut b_events) = mpsc::channel(16);

        let a_sender = spawn_connection(a, params(50, true), 1 << 20, metrics.clone(), a_events_tx);
        let b_sender = spawn_connection(b, params(50, true), 1 << 20, metrics.clone(), b_events_tx);

        // Paused receiver far beyond the read-idle bound must not time out.
        b_sender.pause_receiving();
        tokio::time::sleep(Duration::from_millis(400)).await;

        a_sender.send(Bytes::from_static(b"late")).await.unwrap();
        b_sender.resume_receiving();

        match tokio::time::timeout(Duration::from_secs(1), b_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ConnectionEvent::Message(m) => assert_eq!(m.as_ref(), b"late"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_sends() {
        let (a, _b) = connected_pair().await;
        let metrics = NetworkMetrics::new();

        let (a_events_tx, _a_events) = mpsc::channel(16);
        let a_sender = spawn_connection(a, params(1000, false), 1 << 20, metrics, a_events_tx);

        a_sender.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = a_sender.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, ClusterError::ChannelClosed(_)));
    }
}
