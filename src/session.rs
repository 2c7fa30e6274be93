//! Broker Session: one TCP connection's identity negotiation, frame loop,
//! command encoding, and RDY/in-flight bookkeeping.
//!
//! Grounded on the reference client's `NsqdTCPClient`/`Nsqd`: a stream plus
//! a `_frame_handlers` dispatch table, `identify()`'s feature-negotiation
//! sequence, and the finish/requeue/touch/ready wire senders.

use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use slog::Logger;
use tokio::sync::{mpsc, Mutex};

use crate::config::SessionConfig;
use crate::error::{NsqError, Result};
use crate::message::{Message, MessageCommand};
use crate::protocol::{self, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, HEARTBEAT, OK};
use crate::stream::Stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Init = 0,
    Connected = 1,
    Disconnected = 2,
}

/// What a single `read_response` call produced, after heartbeats have
/// already been transparently answered with `NOP`.
pub enum ResponseEvent {
    Message(Message),
    Response(Bytes),
    Error(NsqError),
}

/// A single connection to an `nsqd` broker.
///
/// Write operations (`ready`, `finish`, `subscribe`, ...) serialize through
/// an internal `Mutex<Stream>`; exactly one task (whichever calls `listen`)
/// performs reads, so no read/read race is possible and a writer may
/// acquire the lock between a frame's header and body reads without
/// corrupting anything (full-duplex TCP).
pub struct BrokerSession {
    pub address: String,
    stream: Mutex<Stream>,
    state: AtomicU8,
    ready_count: AtomicU32,
    in_flight: AtomicU32,
    max_ready_count: AtomicU32,
    last_ready: AtomicU32,
    config: SessionConfig,
    message_tx: mpsc::UnboundedSender<MessageCommand>,
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<MessageCommand>>>,
    last_message_time: std::sync::Mutex<Instant>,
    log: Logger,
}

impl BrokerSession {
    pub async fn connect(address: &str, config: SessionConfig, log: Logger) -> Result<Arc<BrokerSession>> {
        let mut stream = Stream::connect(address, config.socket_timeout).await?;
        stream.send(protocol::MAGIC_V2).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        slog::debug!(log, "connected"; "address" => address);
        Ok(Arc::new(BrokerSession {
            address: address.to_string(),
            stream: Mutex::new(stream),
            state: AtomicU8::new(SessionState::Connected as u8),
            ready_count: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_ready_count: AtomicU32::new(u32::MAX),
            last_ready: AtomicU32::new(0),
            config,
            message_tx: tx,
            message_rx: Mutex::new(Some(rx)),
            last_message_time: std::sync::Mutex::new(Instant::now()),
            log,
        }))
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            0 => SessionState::Init,
            1 => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn ready_count(&self) -> u32 {
        self.ready_count.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_ready_count(&self) -> u32 {
        self.max_ready_count.load(Ordering::SeqCst)
    }

    /// `in_flight >= max(last_ready * 0.85, 1)` (§4.3 starvation signal).
    pub fn is_starved(&self) -> bool {
        let last_ready = self.last_ready.load(Ordering::SeqCst) as f64;
        let threshold = (last_ready * 0.85).max(1.0);
        self.in_flight() as f64 >= threshold
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.send(&data).await {
            drop(stream);
            self.close_on_error().await;
            return Err(e);
        }
        Ok(())
    }

    async fn close_on_error(&self) {
        self.state.store(SessionState::Disconnected as u8, Ordering::SeqCst);
        let mut stream = self.stream.lock().await;
        stream.close().await;
    }

    /// Sends `IDENTIFY` and negotiates TLS/Snappy/DEFLATE and auth per
    /// §4.3: parse the response; if JSON, upgrade TLS first, then Snappy
    /// (preferred) or DEFLATE, each confirmed by a follow-up `"OK"` frame;
    /// then `AUTH` if the broker demands it and a secret is configured.
    ///
    /// Returns the `AUTH` response payload if authentication was performed
    /// (so the caller can raise `on_auth`), or `None` otherwise.
    pub async fn identify(&self) -> Result<Option<Bytes>> {
        let payload = json!({
            "client_id": self.config.client_id,
            "hostname": self.config.hostname,
            "feature_negotiation": true,
            "heartbeat_interval": self.config.heartbeat_interval.as_millis() as i64,
            "output_buffer_size": self.config.output_buffer_size,
            "output_buffer_timeout": self.config.output_buffer_timeout.as_millis() as i64,
            "tls_v1": self.config.tls_v1,
            "snappy": self.config.snappy,
            "deflate": self.config.deflate,
            "deflate_level": self.config.deflate_level,
            "sample_rate": self.config.sample_rate,
            "user_agent": self.config.user_agent,
        });
        let body = serde_json::to_vec(&payload)?;
        self.send(protocol::identify(&body)).await?;

        let frame = self.read_frame().await?;
        if frame.frame_type == FRAME_TYPE_ERROR {
            return Err(NsqError::from_wire(&frame.payload));
        }
        if &frame.payload[..] == OK {
            return Ok(None);
        }

        let negotiated: serde_json::Value = serde_json::from_slice(&frame.payload)?;
        if let Some(max_rdy) = negotiated.get("max_rdy_count").and_then(|v| v.as_u64()) {
            self.max_ready_count.store(max_rdy as u32, Ordering::SeqCst);
        }

        let tls_ok = self.config.tls_v1 && negotiated.get("tls_v1").and_then(|v| v.as_bool()).unwrap_or(false);
        if tls_ok {
            self.upgrade_tls().await?;
            self.expect_ok().await?;
        }

        let snappy_ok = self.config.snappy && negotiated.get("snappy").and_then(|v| v.as_bool()).unwrap_or(false);
        let deflate_ok = !snappy_ok
            && self.config.deflate
            && negotiated.get("deflate").and_then(|v| v.as_bool()).unwrap_or(false);

        if snappy_ok {
            let mut stream = self.stream.lock().await;
            stream.upgrade_to_snappy();
            drop(stream);
            self.expect_ok().await?;
        } else if deflate_ok {
            let mut stream = self.stream.lock().await;
            stream.upgrade_to_deflate();
            drop(stream);
            self.expect_ok().await?;
        }

        if negotiated.get("auth_required").and_then(|v| v.as_bool()).unwrap_or(false) {
            if let Some(secret) = self.config.auth_secret.clone() {
                let auth_response = self.auth(&secret).await?;
                return Ok(Some(auth_response));
            }
        }

        Ok(None)
    }

    async fn upgrade_tls(&self) -> Result<()> {
        let connector = crate::stream::default_tls_connector(self.config.tls_insecure_skip_verify)?;
        let host = self
            .address
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&self.address);
        let domain = rustls::ServerName::try_from(host)
            .map_err(|_| NsqError::SocketError("invalid TLS server name".into()))?;
        let mut stream = self.stream.lock().await;
        stream.upgrade_to_tls(connector, domain).await
    }

    async fn expect_ok(&self) -> Result<()> {
        let frame = self.read_frame().await?;
        if frame.frame_type == FRAME_TYPE_ERROR {
            return Err(NsqError::from_wire(&frame.payload));
        }
        if &frame.payload[..] != OK {
            return Err(NsqError::Invalid);
        }
        Ok(())
    }

    /// Sends `AUTH`, parses the JSON response, and returns its raw payload
    /// so the caller can raise `on_auth` with it.
    pub async fn auth(&self, secret: &[u8]) -> Result<Bytes> {
        self.send(protocol::auth(secret)).await?;
        let frame = self.read_frame().await?;
        if frame.frame_type == FRAME_TYPE_ERROR {
            return Err(NsqError::from_wire(&frame.payload));
        }
        let _: serde_json::Value = serde_json::from_slice(&frame.payload)?;
        Ok(frame.payload)
    }

    pub async fn subscribe(&self, topic: &str, channel: &str) -> Result<()> {
        self.send(protocol::subscribe(topic, channel)?).await
    }

    pub async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        self.send(protocol::publish(topic, body)?).await
    }

    pub async fn multipublish(&self, topic: &str, bodies: &[Bytes]) -> Result<()> {
        self.send(protocol::multipublish(topic, bodies)?).await
    }

    pub async fn defer_publish(&self, topic: &str, body: &[u8], delay_ms: i64) -> Result<()> {
        self.send(protocol::deferpublish(topic, body, delay_ms)?).await
    }

    /// Records the advertised count and sends `RDY n`.
    pub async fn ready(&self, count: u32) -> Result<()> {
        self.last_ready.store(count, Ordering::SeqCst);
        self.ready_count.store(count, Ordering::SeqCst);
        self.send(protocol::ready(count)).await
    }

    pub async fn finish(&self, id: [u8; 16]) -> Result<()> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.send(protocol::finish(&id)).await
    }

    pub async fn requeue(&self, id: [u8; 16], timeout_ms: i64) -> Result<()> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.send(protocol::requeue(&id, timeout_ms)).await
    }

    pub async fn touch(&self, id: [u8; 16]) -> Result<()> {
        self.send(protocol::touch(&id)).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(protocol::close()).await
    }

    fn message_sender(&self) -> mpsc::UnboundedSender<MessageCommand> {
        self.message_tx.clone()
    }

    /// Reads one framed response without the MESSAGE/heartbeat/error
    /// side effects of `read_response` — used during `identify`/`auth`
    /// negotiation where the caller interprets the frame itself.
    async fn read_frame(&self) -> Result<protocol::Frame> {
        let mut stream = self.stream.lock().await;
        let header = match stream.read_exact(4).await {
            Ok(h) => h,
            Err(e) => {
                drop(stream);
                self.close_on_error().await;
                return Err(e);
            }
        };
        let size = protocol::unpack_size(&header)?;
        if size < 4 {
            return Err(NsqError::FrameError(size));
        }
        let rest = match stream.read_exact(size as usize).await {
            Ok(b) => b,
            Err(e) => {
                drop(stream);
                self.close_on_error().await;
                return Err(e);
            }
        };
        protocol::unpack_response(&rest)
    }

    /// Reads one frame and translates it per §4.3: MESSAGE constructs a
    /// `Message` and increments in-flight; heartbeat responses are
    /// transparently answered with `NOP`; ERROR is parsed and, if fatal,
    /// closes the session.
    pub async fn read_response(&self) -> Result<ResponseEvent> {
        let mut stream = self.stream.lock().await;
        let header = match stream.read_exact(4).await {
            Ok(h) => h,
            Err(e) => {
                drop(stream);
                self.close_on_error().await;
                return Err(e);
            }
        };
        let size = protocol::unpack_size(&header)?;
        if size < 4 {
            return Err(NsqError::FrameError(size));
        }
        let rest = match stream.read_exact(size as usize).await {
            Ok(b) => b,
            Err(e) => {
                drop(stream);
                self.close_on_error().await;
                return Err(e);
            }
        };
        drop(stream);

        let frame = protocol::unpack_response(&rest)?;
        match frame.frame_type {
            FRAME_TYPE_MESSAGE => {
                let wm = protocol::unpack_message(&frame.payload)?;
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                *self.last_message_time.lock().unwrap() = Instant::now();
                let msg = Message::new(wm.timestamp, wm.attempts, wm.id, wm.body, self.message_sender());
                Ok(ResponseEvent::Message(msg))
            }
            FRAME_TYPE_RESPONSE => {
                if &frame.payload[..] == HEARTBEAT {
                    self.send(protocol::nop()).await?;
                }
                Ok(ResponseEvent::Response(frame.payload))
            }
            FRAME_TYPE_ERROR => {
                let err = NsqError::from_wire(&frame.payload);
                if err.fatal() {
                    self.close_on_error().await;
                }
                Ok(ResponseEvent::Error(err))
            }
            other => Err(NsqError::FrameError(other)),
        }
    }

    /// Runs `read_response` in a loop, forwarding every event (tagged with
    /// this session's address) to `events_tx`, and draining message
    /// response commands (`finish`/`requeue`/`touch`) issued by handler
    /// tasks holding a `Message` for this session. Returns when the stream
    /// closes or a fatal/transport error occurs.
    pub async fn listen(self: Arc<Self>, events_tx: mpsc::UnboundedSender<(String, ResponseEvent)>) {
        let mut message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .expect("listen called more than once");

        loop {
            tokio::select! {
                response = self.read_response() => {
                    match response {
                        Ok(event) => {
                            if events_tx.send((self.address.clone(), event)).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                cmd = message_rx.recv() => {
                    match cmd {
                        Some(MessageCommand::Finish(id)) => {
                            let _ = self.finish(id).await;
                        }
                        Some(MessageCommand::Requeue { id, timeout_ms, backoff: _ }) => {
                            let _ = self.requeue(id, timeout_ms).await;
                        }
                        Some(MessageCommand::Touch(id)) => {
                            let _ = self.touch(id).await;
                        }
                        None => {}
                    }
                }
            }

            if !self.is_connected() {
                break;
            }
        }
    }

    /// Time since the last MESSAGE frame, used by the RDY redistributor's
    /// `low_ready_idle_timeout` check.
    pub fn idle_duration(&self) -> Duration {
        self.last_message_time.lock().unwrap().elapsed()
    }
}
