//! Relay Sessions
//!
//! A [`Session`] is the registry's handle to one live WebSocket. It owns a
//! bounded outbound queue that is drained by the outbound pump; the inbound
//! pump hands every received frame to the [`ProtocolRouter`].
//!
//! Sends never block: a full queue is reported to the caller, who is
//! expected to disconnect the session rather than retry.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::messages::{Frame, ServerMessage};
use super::router::ProtocolRouter;
use crate::auth::Subject;

/// Process-unique session identifier
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const MIN_PING_PERIOD: Duration = Duration::from_millis(1);

/// Per-session transport settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// How long the peer may stay silent before it must answer a ping
    pub pong_wait: Duration,
    /// Interval between keepalive pings (must be below `pong_wait`)
    pub ping_period: Duration,
    /// Deadline for a single write
    pub write_wait: Duration,
    /// Join already-queued frames into one write, newline separated
    pub coalesce_frames: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            write_wait: Duration::from_secs(10),
            coalesce_frames: true,
        }
    }
}

/// Why a frame could not be queued
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    QueueFull,

    #[error("outbound queue is closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// One live duplex connection
pub struct Session {
    id: SessionId,
    subject: Subject,
    correlation_id: String,
    /// `None` once closed; taking the sender ends the outbound pump
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl Session {
    /// Create a session with a fresh correlation id
    ///
    /// Returns the receiving end of the outbound queue, to be handed to
    /// [`Session::run`].
    pub fn new(subject: Subject, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            subject,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            outbound: Mutex::new(Some(tx)),
        };
        (Arc::new(session), rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Server-issued id the peer must echo in its handshake response
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Queue a frame without waiting
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(SendError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Encode and queue a relay-originated message
    pub fn send_message(&self, message: &ServerMessage) -> Result<(), SendError> {
        let frame = message
            .to_frame()
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.send(frame)
    }

    /// Close the outbound queue
    ///
    /// Returns true only for the call that actually closed it.
    pub(crate) fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Drive the connection until either pump stops, then unregister
    pub async fn run(
        self: Arc<Self>,
        socket: WebSocket,
        outbound: mpsc::Receiver<Frame>,
        router: Arc<ProtocolRouter>,
        config: SessionConfig,
    ) {
        let (sink, stream) = socket.split();
        let registry = router.registry().clone();

        let mut send_task = tokio::spawn(write_pump(self.id, sink, outbound, config.clone()));
        let mut recv_task = tokio::spawn(read_pump(
            Arc::clone(&self),
            stream,
            router,
            config.clone(),
        ));

        tokio::select! {
            _ = &mut send_task => {
                recv_task.abort();
            }
            _ = &mut recv_task => {
                // Closing the queue lets the writer send a close frame
                registry.unregister(&self).await;
                if timeout(config.write_wait, &mut send_task).await.is_err() {
                    send_task.abort();
                }
            }
        }

        registry.unregister(&self).await;
        tracing::debug!(session_id = self.id, user = %self.subject.name, "Session pumps stopped");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("correlation_id", &self.correlation_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Inbound pump: forwards frames to the router until the transport fails,
/// the peer goes quiet, or a frame is oversized
async fn read_pump(
    session: Arc<Session>,
    mut stream: SplitStream<WebSocket>,
    router: Arc<ProtocolRouter>,
    config: SessionConfig,
) {
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(session_id = session.id, "Liveness deadline expired");
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if text.len() > config.max_message_size {
                    tracing::warn!(
                        session_id = session.id,
                        size = text.len(),
                        limit = config.max_message_size,
                        "Oversized frame, closing connection"
                    );
                    break;
                }
                router.route(&session, &text).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                if bytes.len() > config.max_message_size {
                    tracing::warn!(
                        session_id = session.id,
                        size = bytes.len(),
                        limit = config.max_message_size,
                        "Oversized frame, closing connection"
                    );
                    break;
                }
                match std::str::from_utf8(&bytes) {
                    Ok(text) => router.route(&session, text).await,
                    Err(_) => {
                        tracing::debug!(session_id = session.id, "Dropping non UTF-8 binary frame");
                    }
                }
            }
            Some(Ok(Message::Pong(_))) => {
                deadline = Instant::now() + config.pong_wait;
            }
            Some(Ok(Message::Ping(_))) => {
                // Answered by the WebSocket layer
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session_id = session.id, "Peer closed connection");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = session.id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Outbound pump: drains the queue in order and pings on a fixed period
async fn write_pump<S>(
    session_id: SessionId,
    mut sink: S,
    mut outbound: mpsc::Receiver<Frame>,
    config: SessionConfig,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    // interval panics on a zero period
    let ping_period = config.ping_period.max(MIN_PING_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Queue closed by unregister
                    let _ = timeout(config.write_wait, sink.send(Message::Close(None))).await;
                    break;
                };

                let text = if config.coalesce_frames {
                    coalesce(frame, &mut outbound)
                } else {
                    frame.to_string()
                };

                if let Err(reason) = write_with_deadline(&mut sink, Message::Text(text), config.write_wait).await {
                    tracing::debug!(session_id, reason = %reason, "WebSocket send failed, closing connection");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(reason) = write_with_deadline(&mut sink, Message::Ping(Vec::new()), config.write_wait).await {
                    tracing::debug!(session_id, reason = %reason, "Keepalive ping failed, closing connection");
                    break;
                }
            }
        }
    }

    // Flushing stalls while the peer is not reading
    if timeout(config.write_wait, sink.close()).await.is_err() {
        tracing::debug!(session_id, "Close deadline exceeded, dropping transport");
    }
}

/// Join `first` with every frame already waiting in the queue
fn coalesce(first: Frame, outbound: &mut mpsc::Receiver<Frame>) -> String {
    let mut text = String::from(&*first);
    while let Ok(next) = outbound.try_recv() {
        text.push('\n');
        text.push_str(&next);
    }
    text
}

async fn write_with_deadline<S>(sink: &mut S, message: Message, wait: Duration) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write deadline of {:?} exceeded", wait)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Transport whose peer never drains its receive window
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    fn subject() -> Subject {
        Subject {
            id: 7,
            name: "operator".to_string(),
        }
    }

    #[test]
    fn test_session_ids_unique() {
        let (a, _rx_a) = Session::new(subject(), 4);
        let (b, _rx_b) = Session::new(subject(), 4);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert!(!a.correlation_id().is_empty());
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (session, mut rx) = Session::new(subject(), 8);
        for i in 0..5 {
            session.send(Frame::from(format!("m{}", i))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(&*rx.recv().await.unwrap(), format!("m{}", i));
        }
    }

    #[test]
    fn test_send_full_queue_fails_fast() {
        let (session, _rx) = Session::new(subject(), 2);
        assert!(session.send(Frame::from("a")).is_ok());
        assert!(session.send(Frame::from("b")).is_ok());
        assert_eq!(session.send(Frame::from("c")), Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn test_close_once() {
        let (session, mut rx) = Session::new(subject(), 2);
        session.send(Frame::from("last")).unwrap();

        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert_eq!(session.send(Frame::from("late")), Err(SendError::Closed));

        // Frames queued before close still drain, then the queue ends
        assert_eq!(&*rx.recv().await.unwrap(), "last");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_coalesce_joins_queued_frames() {
        let (session, mut rx) = Session::new(subject(), 8);
        session.send(Frame::from("b")).unwrap();
        session.send(Frame::from("c")).unwrap();

        let joined = coalesce(Frame::from("a"), &mut rx);
        assert_eq!(joined, "a\nb\nc");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_message_encodes_json() {
        let (session, mut rx) = Session::new(subject(), 2);
        session
            .send_message(&ServerMessage::handshake_request(session.correlation_id()))
            .unwrap();
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["connection_id"], session.correlation_id());
    }

    #[test]
    fn test_default_config_ping_below_pong_wait() {
        let config = SessionConfig::default();
        assert!(config.ping_period < config.pong_wait);
        assert_eq!(config.send_queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_write_pump_returns_when_sink_stalls() {
        let (session, rx) = Session::new(subject(), 4);
        session.send(Frame::from("stuck")).unwrap();
        let config = SessionConfig {
            write_wait: Duration::from_millis(50),
            ..SessionConfig::default()
        };

        let started = std::time::Instant::now();
        timeout(Duration::from_secs(2), write_pump(session.id(), StalledSink, rx, config))
            .await
            .expect("write pump hung on a stalled transport");
        // One write deadline for the frame, one for the close
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_write_pump_zero_ping_period() {
        let (session, rx) = Session::new(subject(), 4);
        session.send(Frame::from("hello")).unwrap();
        session.close();
        let config = SessionConfig {
            ping_period: Duration::ZERO,
            ..SessionConfig::default()
        };

        let sink = futures_util::sink::drain::<Message>();
        timeout(Duration::from_secs(2), write_pump(session.id(), sink, rx, config))
            .await
            .expect("write pump did not finish after the queue closed");
    }
}
