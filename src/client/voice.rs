//! # Voice Client
//!
//! Drives one browser-equivalent conversation endpoint: a WebSocket
//! connection to the relay, the session state machine gating it, the capture
//! pipeline (outbound audio), the playback scheduler (inbound audio) and the
//! text aggregator (inbound tokens).
//!
//! ## Task Model:
//! One task owns the whole client. It multiplexes the socket, the capture
//! frame channel and the command channel with `tokio::select!`, so nothing
//! here ever blocks and frame ordering within the socket is preserved.
//! Callers talk to the task through [`VoiceClientHandle`].
//!
//! ## Reconnect Policy:
//! One deferred reconnect per abnormal close, after a fixed delay (no
//! backoff, no attempt cap). Any manual command that ends or restarts the
//! session cancels the pending timer. Each attempt constructs a fresh
//! [`Session`]; the previous one is never revived.

use crate::client::capture::{CaptureDevice, CaptureError, CapturePipeline};
use crate::client::playback::{AudioDecoder, PlaybackDevice, PlaybackScheduler};
use crate::client::text::TextAggregator;
use crate::protocol::{decode, Decoded, FrameKind};
use crate::session::{ReconnectDirective, Session};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side tunables. Reference values match the source frontend.
#[derive(Debug, Clone)]
pub struct VoiceClientConfig {
    /// Relay endpoint, including any query parameters to forward
    /// (e.g. `ws://127.0.0.1:8010/ws/voice?voice=NATF2`)
    pub relay_url: String,

    /// Fixed delay before the single reconnect attempt (reference: 4s)
    pub reconnect_delay: Duration,

    /// Capture chunk interval (reference: 100ms)
    pub capture_chunk: Duration,

    /// Text aggregation debounce (reference: 600ms)
    pub text_debounce: Duration,
}

impl Default for VoiceClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8010/ws/voice".to_string(),
            reconnect_delay: Duration::from_secs(4),
            capture_chunk: Duration::from_millis(100),
            text_debounce: Duration::from_millis(600),
        }
    }
}

/// Commands accepted by the client task.
enum ClientCommand {
    StartCapture(oneshot::Sender<Result<(), CaptureError>>),
    StopCapture,
    Reconnect,
    Disconnect,
}

/// How one connection attempt ended.
enum ConnectionEnd {
    /// The socket closed; the directive says whether a reconnect is due.
    Directive(ReconnectDirective),
    /// The user asked for an immediate new session.
    ManualReconnect,
    /// The user disconnected; the client task exits.
    Shutdown,
}

/// Caller-facing handle to a spawned voice client.
pub struct VoiceClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    status: watch::Receiver<String>,
    utterances: mpsc::Receiver<String>,
    worker: JoinHandle<()>,
}

impl VoiceClientHandle {
    /// The latest session status string (`connecting`, `warming_up`, `live`,
    /// `disconnected`, `error`). This is the only interface the presentation
    /// layer needs from this core.
    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }

    /// A watch receiver for status transitions, for event-driven UIs.
    pub fn status_stream(&self) -> watch::Receiver<String> {
        self.status.clone()
    }

    /// Ask the client to start capturing. Rejected with
    /// [`CaptureError::NotReady`] unless the session is live.
    pub async fn start_capture(&self) -> Result<(), CaptureError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::StartCapture(reply_tx))
            .map_err(|_| CaptureError::NotReady)?;
        reply_rx.await.unwrap_or(Err(CaptureError::NotReady))
    }

    /// Stop capturing (safe no-op when not capturing).
    pub fn stop_capture(&self) {
        let _ = self.commands.send(ClientCommand::StopCapture);
    }

    /// Tear down the current session (if any) and start a fresh one now.
    pub fn reconnect(&self) {
        let _ = self.commands.send(ClientCommand::Reconnect);
    }

    /// End the conversation. Cancels any pending reconnect; the client task
    /// exits once teardown completes.
    pub fn disconnect(&self) {
        let _ = self.commands.send(ClientCommand::Disconnect);
    }

    /// Receive the next aggregated utterance.
    pub async fn next_utterance(&mut self) -> Option<String> {
        self.utterances.recv().await
    }

    /// Wait for the client task to finish (after `disconnect`).
    pub async fn join(self) {
        let _ = self.worker.await;
    }
}

/// Spawns and owns the conversation task.
pub struct VoiceClient;

impl VoiceClient {
    /// Spawn a client that connects immediately (page-load semantics).
    ///
    /// `capture_device` and `playback_device` bind the pipeline to the
    /// platform's audio APIs; `decoder` interprets inbound audio payloads.
    pub fn spawn<D>(
        config: VoiceClientConfig,
        capture_device: Box<dyn CaptureDevice>,
        playback_device: D,
        decoder: Box<dyn AudioDecoder>,
    ) -> VoiceClientHandle
    where
        D: PlaybackDevice + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel("connecting".to_string());
        let (utterances_tx, utterances_rx) = mpsc::channel(32);

        // The frame channel and both pipelines outlive individual sessions;
        // only the per-session scheduling/aggregation state is rebuilt.
        let (frames_tx, frames_rx) = mpsc::channel(32);
        let capture = CapturePipeline::new(capture_device, config.capture_chunk, frames_tx);
        let scheduler = PlaybackScheduler::new(playback_device, decoder);

        let worker = tokio::spawn(run_client(
            config,
            capture,
            scheduler,
            frames_rx,
            commands_rx,
            status_tx,
            utterances_tx,
        ));

        VoiceClientHandle {
            commands: commands_tx,
            status: status_rx,
            utterances: utterances_rx,
            worker,
        }
    }
}

fn publish(status: &watch::Sender<String>, session: &Session) {
    let _ = status.send(session.state().as_str().to_string());
}

async fn run_client<D: PlaybackDevice>(
    config: VoiceClientConfig,
    mut capture: CapturePipeline,
    mut scheduler: PlaybackScheduler<D>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    status: watch::Sender<String>,
    utterances: mpsc::Sender<String>,
) {
    'sessions: loop {
        let mut session = Session::new(config.reconnect_delay);
        publish(&status, &session);
        info!(session_id = %session.session_id(), url = %config.relay_url, "connecting");

        // Dial while staying responsive to commands.
        let mut connect = Box::pin(connect_async(config.relay_url.clone()));
        let dialed = loop {
            tokio::select! {
                result = &mut connect => break Some(result),
                command = commands.recv() => match command {
                    Some(ClientCommand::StartCapture(reply)) => {
                        let _ = reply.send(Err(CaptureError::NotReady));
                    }
                    Some(ClientCommand::StopCapture) | Some(ClientCommand::Reconnect) => {}
                    Some(ClientCommand::Disconnect) | None => break None,
                }
            }
        };

        let end = match dialed {
            None => {
                session.on_manual_close();
                publish(&status, &session);
                break 'sessions;
            }
            Some(Err(err)) => {
                let directive = session.on_transport_error(&err.to_string());
                ConnectionEnd::Directive(directive)
            }
            Some(Ok((stream, _response))) => {
                session.on_socket_open();
                publish(&status, &session);
                run_connection(
                    stream,
                    &mut session,
                    &mut capture,
                    &mut scheduler,
                    &mut frames,
                    &mut commands,
                    &status,
                    utterances.clone(),
                    config.text_debounce,
                )
                .await
            }
        };

        // Per-session teardown: capture must release the device before the
        // next session can open it; the playback queue starts fresh.
        capture.stop();
        scheduler.end_session();
        publish(&status, &session);

        match end {
            ConnectionEnd::Shutdown => break 'sessions,
            ConnectionEnd::ManualReconnect => continue 'sessions,
            ConnectionEnd::Directive(ReconnectDirective::After(delay)) => {
                debug!(delay = ?delay, "reconnect scheduled");
                // The deadline is fixed at the moment of the abnormal close;
                // commands arriving inside the window never move it.
                let deadline = tokio::time::Instant::now() + delay;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            if session.take_pending_reconnect() {
                                continue 'sessions;
                            }
                            break 'sessions;
                        }
                        command = commands.recv() => match command {
                            Some(ClientCommand::Reconnect) => {
                                session.on_manual_close();
                                continue 'sessions;
                            }
                            Some(ClientCommand::StartCapture(reply)) => {
                                // Not live; the pending reconnect stays armed.
                                let _ = reply.send(Err(CaptureError::NotReady));
                            }
                            Some(ClientCommand::StopCapture) => {}
                            Some(ClientCommand::Disconnect) | None => {
                                session.on_manual_close();
                                publish(&status, &session);
                                break 'sessions;
                            }
                        }
                    }
                }
            }
            ConnectionEnd::Directive(ReconnectDirective::None) => {
                // Terminal for this session: wait for a manual action.
                loop {
                    match commands.recv().await {
                        Some(ClientCommand::Reconnect) => continue 'sessions,
                        Some(ClientCommand::StartCapture(reply)) => {
                            let _ = reply.send(Err(CaptureError::NotReady));
                        }
                        Some(ClientCommand::StopCapture) => {}
                        Some(ClientCommand::Disconnect) | None => break 'sessions,
                    }
                }
            }
        }
    }

    info!("voice client stopped");
}

/// Multiplex one open socket until it ends, dispatching inbound frames and
/// shipping capture frames upstream.
#[allow(clippy::too_many_arguments)]
async fn run_connection<D: PlaybackDevice>(
    stream: WsStream,
    session: &mut Session,
    capture: &mut CapturePipeline,
    scheduler: &mut PlaybackScheduler<D>,
    frames: &mut mpsc::Receiver<Vec<u8>>,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    status: &watch::Sender<String>,
    utterances: mpsc::Sender<String>,
    text_debounce: Duration,
) -> ConnectionEnd {
    let (mut sink, mut inbound) = stream.split();
    let aggregator = TextAggregator::spawn(text_debounce, utterances);

    let end = loop {
        tokio::select! {
            message = inbound.next() => match message {
                Some(Ok(Message::Binary(data))) => match decode(&data) {
                    // Zero-length message: signals no payload, yields no action.
                    Decoded::Empty => {}
                    Decoded::Frame { kind: FrameKind::Ready, .. } => {
                        if session.on_ready_frame() {
                            scheduler.reset_clock();
                            publish(status, session);
                        }
                    }
                    Decoded::Frame { kind: FrameKind::Audio, payload } => {
                        scheduler.enqueue(payload);
                    }
                    Decoded::Frame { kind: FrameKind::Text, payload } => {
                        aggregator.push(payload);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    break ConnectionEnd::Directive(session.on_socket_close(code));
                }
                // Ping/pong are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    break ConnectionEnd::Directive(session.on_transport_error(&err.to_string()));
                }
                None => break ConnectionEnd::Directive(session.on_socket_close(None)),
            },

            Some(frame) = frames.recv() => {
                if let Err(err) = sink.send(Message::Binary(frame)).await {
                    warn!(error = %err, "failed to ship capture frame");
                    break ConnectionEnd::Directive(session.on_transport_error(&err.to_string()));
                }
            }

            command = commands.recv() => match command {
                Some(ClientCommand::StartCapture(reply)) => {
                    let _ = reply.send(capture.start(session));
                }
                Some(ClientCommand::StopCapture) => capture.stop(),
                Some(ClientCommand::Reconnect) => {
                    session.on_manual_close();
                    send_normal_close(&mut sink, "reconnect").await;
                    break ConnectionEnd::ManualReconnect;
                }
                Some(ClientCommand::Disconnect) | None => {
                    session.on_manual_close();
                    send_normal_close(&mut sink, "user disconnect").await;
                    break ConnectionEnd::Shutdown;
                }
            }
        }
    };

    // Teardown flushes a non-empty text buffer rather than discarding it.
    aggregator.shutdown().await;
    end
}

async fn send_normal_close<S>(sink: &mut S, reason: &'static str)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }));
    if sink.send(close).await.is_err() {
        debug!("socket already gone during close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::playback::Pcm16Decoder;
    use crate::protocol::encode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct NullMic;

    impl CaptureDevice for NullMic {
        fn open(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }
        fn read_chunk(&mut self) -> Result<Vec<u8>, CaptureError> {
            Ok(vec![0u8; 8])
        }
        fn close(&mut self) {}
    }

    struct NullSpeaker;

    impl PlaybackDevice for NullSpeaker {
        fn now(&self) -> Duration {
            Duration::ZERO
        }
        fn play_at(&mut self, _chunk: crate::client::playback::DecodedChunk, _start: Duration) {}
    }

    fn test_config(url: String) -> VoiceClientConfig {
        VoiceClientConfig {
            relay_url: url,
            reconnect_delay: Duration::from_millis(100),
            capture_chunk: Duration::from_millis(10),
            text_debounce: Duration::from_millis(50),
        }
    }

    fn spawn_client(url: String) -> VoiceClientHandle {
        VoiceClient::spawn(
            test_config(url),
            Box::new(NullMic),
            NullSpeaker,
            Box::new(Pcm16Decoder::new(16_000)),
        )
    }

    async fn wait_for_status(handle: &VoiceClientHandle, wanted: &str) {
        let mut status = handle.status_stream();
        timeout(Duration::from_secs(5), async {
            loop {
                if *status.borrow_and_update() == wanted {
                    return;
                }
                status.changed().await.expect("client task alive");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("status never became {}", wanted));
    }

    async fn bind_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_ready_then_text_reaches_display() {
        let (listener, url) = bind_server().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Binary(encode(FrameKind::Ready, &[]))).await.unwrap();
            ws.send(Message::Binary(encode(FrameKind::Text, b"Hel"))).await.unwrap();
            ws.send(Message::Binary(encode(FrameKind::Text, b"lo"))).await.unwrap();
            // Keep the socket open while the debounce elapses.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut handle = spawn_client(url);
        wait_for_status(&handle, "live").await;

        let utterance = timeout(Duration::from_secs(2), handle.next_utterance())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(utterance, "Hello");

        handle.disconnect();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_capture_gated_until_ready() {
        let (listener, url) = bind_server().await;
        let (seen_tx, mut seen_rx) = mpsc::channel::<Vec<u8>>(4);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Hold the handshake back until the client has tried to capture.
            tokio::time::sleep(Duration::from_millis(200)).await;
            ws.send(Message::Binary(encode(FrameKind::Ready, &[]))).await.unwrap();
            while let Some(Ok(Message::Binary(data))) = ws.next().await {
                let _ = seen_tx.send(data).await;
            }
        });

        let handle = spawn_client(url);
        wait_for_status(&handle, "warming_up").await;

        // Not live yet: rejected, and nothing reaches the wire.
        assert!(matches!(
            handle.start_capture().await,
            Err(CaptureError::NotReady)
        ));

        wait_for_status(&handle, "live").await;
        handle.start_capture().await.unwrap();

        let frame = timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match decode(&frame) {
            Decoded::Frame { kind, payload } => {
                assert_eq!(kind, FrameKind::Audio);
                assert_eq!(payload.len(), 8);
            }
            Decoded::Empty => panic!("empty frame sent upstream"),
        }

        handle.disconnect();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_abnormal_close_reconnects_once() {
        let (listener, url) = bind_server().await;
        let connections = Arc::new(AtomicU32::new(0));
        let connections_seen = connections.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let n = connections_seen.fetch_add(1, Ordering::SeqCst);
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if n == 0 {
                    // First connection: drop without a close handshake.
                    drop(ws);
                } else {
                    ws.send(Message::Binary(encode(FrameKind::Ready, &[]))).await.unwrap();
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });

        let handle = spawn_client(url);
        wait_for_status(&handle, "live").await;
        assert_eq!(connections.load(Ordering::SeqCst), 2);

        handle.disconnect();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_disconnect_during_backoff_cancels_reconnect() {
        let (listener, url) = bind_server().await;
        let connections = Arc::new(AtomicU32::new(0));
        let connections_seen = connections.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                connections_seen.fetch_add(1, Ordering::SeqCst);
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                // Drop without a close handshake: abnormal close.
                drop(ws);
            }
        });

        let handle = spawn_client(url);
        wait_for_status(&handle, "error").await;

        // Commands landing inside the 100ms backoff window must neither
        // consume the pending reconnect nor defer the disconnect: no new
        // session may be dialed after the user disconnects.
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.stop_capture();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.disconnect();
        handle.join().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_deadline_unmoved_by_commands() {
        let (listener, url) = bind_server().await;
        let (accepts_tx, mut accepts) = mpsc::channel::<std::time::Instant>(4);

        tokio::spawn(async move {
            let mut n = 0u32;
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let _ = accepts_tx.send(std::time::Instant::now()).await;
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if n == 0 {
                    drop(ws);
                } else {
                    ws.send(Message::Binary(encode(FrameKind::Ready, &[]))).await.unwrap();
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                n += 1;
            }
        });

        let mut config = test_config(url);
        config.reconnect_delay = Duration::from_millis(300);
        let handle = VoiceClient::spawn(
            config,
            Box::new(NullMic),
            NullSpeaker,
            Box::new(Pcm16Decoder::new(16_000)),
        );

        let first = accepts.recv().await.unwrap();

        // A command 200ms into the 300ms backoff must not restart the delay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop_capture();

        let second = timeout(Duration::from_secs(2), accepts.recv())
            .await
            .unwrap()
            .unwrap();
        let gap = second.duration_since(first);
        assert!(
            gap >= Duration::from_millis(280),
            "reconnect fired before the fixed delay: {:?}",
            gap
        );
        assert!(
            gap < Duration::from_millis(450),
            "reconnect postponed past the fixed delay: {:?}",
            gap
        );

        handle.disconnect();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_normal_close_does_not_reconnect() {
        let (listener, url) = bind_server().await;
        let connections = Arc::new(AtomicU32::new(0));
        let connections_seen = connections.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                connections_seen.fetch_add(1, Ordering::SeqCst);
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                ws.send(Message::Binary(encode(FrameKind::Ready, &[]))).await.unwrap();
                let _ = ws
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "done".into(),
                    })))
                    .await;
            }
        });

        let handle = spawn_client(url);
        wait_for_status(&handle, "disconnected").await;

        // Wait out several reconnect windows: no new session may appear.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        handle.disconnect();
        handle.join().await;
    }
}
