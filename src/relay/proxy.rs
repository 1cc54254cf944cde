//! # Relay WebSocket Actor
//!
//! One actor per accepted browser connection. On start it dials the speech
//! backend (with a bounded timeout) and then runs two independent pumps:
//!
//! - **browser → backend**: `StreamHandler` forwards inbound messages into an
//!   unbounded channel drained by a writer task that owns the backend sink.
//! - **backend → browser**: a reader task owns the backend stream and hands
//!   each frame back to the actor, which writes it to the browser socket.
//!
//! The pumps share no mutable state beyond the two socket halves; either leg
//! closing (or failing) tears the other down with a matching or derived close
//! code. The relay never interprets frame contents.

use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as BackendCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the browser leg is pinged.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any browser traffic before the relay gives up.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket actor relaying one browser connection to the backend.
pub struct RelayWebSocket {
    /// Unique identifier for this relayed connection
    relay_id: String,

    /// Fully resolved backend URL (config + verbatim inbound query string)
    backend_url: String,

    /// Bound on the backend connect attempt
    connect_timeout: Duration,

    /// Shared state for relay metrics
    app_state: AppState,

    /// Write side of the browser→backend pump, once the backend is up
    backend: Option<mpsc::UnboundedSender<BackendMessage>>,

    /// Browser frames that arrived before the backend finished connecting
    pending: Vec<BackendMessage>,

    /// Backend connect/reader task, cancelled on actor stop
    backend_task: Option<JoinHandle<()>>,

    /// Last time the browser showed signs of life
    last_heartbeat: Instant,
}

/// The backend socket is up; `tx` feeds its writer task.
#[derive(Message)]
#[rtype(result = "()")]
struct BackendConnected {
    tx: mpsc::UnboundedSender<BackendMessage>,
}

/// One binary frame from the backend, to be written to the browser.
#[derive(Message)]
#[rtype(result = "()")]
struct BackendFrame(Vec<u8>);

/// The backend closed its leg (with the close code it sent, if any).
#[derive(Message)]
#[rtype(result = "()")]
struct BackendClosed {
    code: Option<u16>,
}

/// The backend leg failed (connect error, timeout, or mid-stream error).
#[derive(Message)]
#[rtype(result = "()")]
struct BackendFailed {
    reason: String,
}

impl RelayWebSocket {
    pub fn new(backend_url: String, connect_timeout: Duration, app_state: AppState) -> Self {
        Self {
            relay_id: Uuid::new_v4().to_string(),
            backend_url,
            connect_timeout,
            app_state,
            backend: None,
            pending: Vec::new(),
            backend_task: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Dial the backend and run both pumps until either leg ends.
    ///
    /// Runs on its own task; every outcome is reported back to the actor as
    /// a message so all browser-socket writes stay on the actor context.
    fn spawn_backend_leg(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let addr = ctx.address();
        let url = self.backend_url.clone();
        let relay_id = self.relay_id.clone();
        let connect_timeout = self.connect_timeout;

        self.backend_task = Some(tokio::spawn(async move {
            // The backend terminates its own TLS with a self-signed
            // certificate; trusting it here is the point of the relay.
            let tls = match native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
            {
                Ok(tls) => tls,
                Err(err) => {
                    addr.do_send(BackendFailed {
                        reason: format!("TLS connector setup failed: {}", err),
                    });
                    return;
                }
            };

            let connect =
                connect_async_tls_with_config(url.clone(), None, false, Some(Connector::NativeTls(tls)));

            let stream = match tokio::time::timeout(connect_timeout, connect).await {
                Err(_) => {
                    addr.do_send(BackendFailed {
                        reason: format!("backend connect timed out after {:?}", connect_timeout),
                    });
                    return;
                }
                Ok(Err(err)) => {
                    addr.do_send(BackendFailed {
                        reason: format!("backend connect failed: {}", err),
                    });
                    return;
                }
                Ok(Ok((stream, _response))) => stream,
            };

            debug!(relay_id = %relay_id, "backend leg connected");
            let (mut sink, mut inbound) = stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<BackendMessage>();
            addr.do_send(BackendConnected { tx });

            // Upstream pump: owns the backend write half exclusively.
            let writer = tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let is_close = matches!(message, BackendMessage::Close(_));
                    if sink.send(message).await.is_err() || is_close {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            // Downstream pump: owns the backend read half exclusively.
            let mut outcome: Option<BackendClosed> = None;
            while let Some(item) = inbound.next().await {
                match item {
                    Ok(BackendMessage::Binary(data)) => addr.do_send(BackendFrame(data)),
                    Ok(BackendMessage::Close(frame)) => {
                        outcome = Some(BackendClosed {
                            code: frame.map(|f| u16::from(f.code)),
                        });
                        break;
                    }
                    // Ping/pong stay inside each leg; nothing to relay.
                    Ok(_) => {}
                    Err(err) => {
                        addr.do_send(BackendFailed {
                            reason: format!("backend stream error: {}", err),
                        });
                        writer.abort();
                        return;
                    }
                }
            }
            addr.do_send(outcome.unwrap_or(BackendClosed { code: None }));
            // One pump ending cancels the other.
            writer.abort();
        }));
    }

    /// Queue one message for the backend, buffering while it connects.
    fn forward_to_backend(&mut self, message: BackendMessage) {
        match &self.backend {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!(relay_id = %self.relay_id, "backend writer gone, dropping frame");
                }
            }
            None => self.pending.push(message),
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(relay_id = %self.relay_id, backend = %self.backend_url, "relay connection started");
        self.app_state.relay_opened();
        self.spawn_backend_leg(ctx);

        // Keep the browser leg alive and drop unresponsive clients.
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(relay_id = %act.relay_id, "browser heartbeat timeout, closing relay");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(relay_id = %self.relay_id, "relay connection stopped");
        self.app_state.relay_closed();

        // Fire-and-forget teardown of the backend leg: a close frame if the
        // writer is still up, then cancellation of the reader.
        if let Some(tx) = self.backend.take() {
            let _ = tx.send(BackendMessage::Close(None));
        }
        if let Some(task) = self.backend_task.take() {
            task.abort();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.app_state.record_upstream(data.len() as u64);
                self.forward_to_backend(BackendMessage::Binary(data.to_vec()));
            }
            Ok(ws::Message::Text(text)) => {
                // The voice protocol is binary, but the relay stays a pure
                // byte relay and forwards text verbatim.
                self.forward_to_backend(BackendMessage::Text(text.to_string()));
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(relay_id = %self.relay_id, reason = ?reason, "browser closed");
                let code = reason.as_ref().map(|r| u16::from(r.code));
                self.forward_to_backend(BackendMessage::Close(Some(BackendCloseFrame {
                    code: BackendCloseCode::from(code.unwrap_or(1000)),
                    reason: "".into(),
                })));
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(relay_id = %self.relay_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(relay_id = %self.relay_id, error = %err, "browser socket error");
                ctx.stop();
            }
        }
    }
}

impl Handler<BackendConnected> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendConnected, _ctx: &mut Self::Context) {
        debug!(
            relay_id = %self.relay_id,
            buffered = self.pending.len(),
            "backend connected, flushing buffered frames"
        );
        for message in self.pending.drain(..) {
            let _ = msg.tx.send(message);
        }
        self.backend = Some(msg.tx);
    }
}

impl Handler<BackendFrame> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendFrame, ctx: &mut Self::Context) {
        self.app_state.record_downstream(msg.0.len() as u64);
        ctx.binary(msg.0);
    }
}

impl Handler<BackendClosed> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendClosed, ctx: &mut Self::Context) {
        info!(relay_id = %self.relay_id, code = ?msg.code, "backend closed, closing browser leg");
        // Propagate the backend's code; a missing close frame is abnormal.
        let code = match msg.code {
            Some(code) => ws::CloseCode::from(code),
            None => ws::CloseCode::Error,
        };
        ctx.close(Some(code.into()));
        ctx.stop();
    }
}

impl Handler<BackendFailed> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: BackendFailed, ctx: &mut Self::Context) {
        warn!(relay_id = %self.relay_id, reason = %msg.reason, "backend leg failed");
        self.app_state.increment_error_count();
        // Never leave the browser waiting on a dead backend.
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

/// WebSocket endpoint handler: upgrades the request and hands the connection
/// to a [`RelayWebSocket`] actor. The inbound query string (voice/persona
/// selectors and anything else) is forwarded verbatim to the backend URL.
pub async fn voice_relay(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();
    let backend_url = config.backend.url_with_query(req.query_string());

    info!(
        peer = ?req.connection_info().peer_addr(),
        backend = %backend_url,
        "new relay connection request"
    );

    let relay = RelayWebSocket::new(
        backend_url,
        Duration::from_millis(config.backend.connect_timeout_ms),
        app_state.get_ref().clone(),
    );
    ws::start(relay, &req, stream)
}
