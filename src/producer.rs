//! Producer Supervisor: a pool of Broker Sessions used to publish, each
//! with a FIFO queue of outstanding response promises so a publish call
//! can `await` the exact `OK`/`ERROR` the broker sends back for it.
//!
//! Grounded on the reference client's `Producer`: round-robin connection
//! selection plus `_response_queue`'s per-connection FIFO deque matching
//! each queued publish to the next frame the reader receives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use slog::Logger;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::ProducerConfig;
use crate::error::{NsqError, Result};
use crate::session::{BrokerSession, ResponseEvent};

type Pending = (u64, oneshot::Sender<Result<Bytes>>);

struct PooledSession {
    session: Arc<BrokerSession>,
    pending: Arc<Mutex<VecDeque<Pending>>>,
}

type BoxSend = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// A pool of broker connections used to publish, round-robin over whatever
/// is currently connected. Connections are established by `start`; a
/// dropped session removes itself from the pool and fails every promise
/// still queued against it.
pub struct Producer {
    config: ProducerConfig,
    sessions: Mutex<HashMap<String, PooledSession>>,
    cursor: AtomicUsize,
    next_token: AtomicU64,
    log: Logger,
}

impl Producer {
    pub fn new(config: ProducerConfig, log: Logger) -> Self {
        Producer {
            config,
            sessions: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            next_token: AtomicU64::new(0),
            log,
        }
    }

    /// Connects to every configured address and starts each session's
    /// reader loop. Safe to call more than once; already-connected
    /// addresses are left alone.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let addrs = self.config.nsqd_tcp_addresses.clone();
        if addrs.is_empty() {
            return Err(NsqError::Invalid);
        }
        for addr in addrs {
            self.connect_one(addr).await?;
        }
        Ok(())
    }

    async fn connect_one(self: &Arc<Self>, addr: String) -> Result<()> {
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&addr) {
                return Ok(());
            }
        }

        let log = self.log.new(slog::o!("address" => addr.clone()));
        let session = BrokerSession::connect(&addr, self.config.session.clone(), log).await?;
        // A producer-only session has no consumer signals to raise on_auth
        // through; the negotiated auth response itself is discarded.
        session.identify().await?;

        let pending: Arc<Mutex<VecDeque<Pending>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();

        let session_for_reader = session.clone();
        tokio::spawn(async move {
            session_for_reader.listen(wire_tx).await;
        });

        let this = self.clone();
        let addr_for_drain = addr.clone();
        let pending_for_drain = pending.clone();
        tokio::spawn(async move {
            this.drain_responses(addr_for_drain, wire_rx, pending_for_drain).await;
        });

        self.sessions
            .lock()
            .await
            .insert(addr, PooledSession { session, pending });
        Ok(())
    }

    /// Matches every frame this session produces against the head of its
    /// pending-publish queue: `OK` satisfies it, anything else fails it.
    /// A closed reader fails every outstanding promise so no caller hangs
    /// forever on a dead connection.
    async fn drain_responses(
        self: Arc<Self>,
        addr: String,
        mut wire_rx: mpsc::UnboundedReceiver<(String, ResponseEvent)>,
        pending: Arc<Mutex<VecDeque<Pending>>>,
    ) {
        while let Some((_, event)) = wire_rx.recv().await {
            match event {
                ResponseEvent::Response(payload) => {
                    // Only a literal "OK" answers a queued publish; anything
                    // else (e.g. a transparent heartbeat NOP-response) isn't
                    // a response to any outstanding command.
                    if &payload[..] == b"OK" {
                        if let Some((_, tx)) = pending.lock().await.pop_front() {
                            let _ = tx.send(Ok(payload));
                        }
                    }
                }
                ResponseEvent::Error(err) => {
                    // Every promise still queued on this connection failed,
                    // not just the head: nsqd's ERROR closes out whatever
                    // was in flight on the connection, not just one command.
                    let fatal = err.fatal();
                    let mut queue = pending.lock().await;
                    while let Some((_, tx)) = queue.pop_front() {
                        let _ = tx.send(Err(err.clone()));
                    }
                    drop(queue);
                    if fatal {
                        break;
                    }
                }
                ResponseEvent::Message(_) => {
                    // A producer-only session never SUBs, so no MESSAGE
                    // frame should arrive; ignore defensively.
                }
            }
        }

        let mut queue = pending.lock().await;
        while let Some((_, tx)) = queue.pop_front() {
            let _ = tx.send(Err(NsqError::NoConnections));
        }
        drop(queue);
        self.sessions.lock().await.remove(&addr);
        slog::info!(self.log, "producer session closed"; "address" => &addr);
    }

    async fn pick(&self) -> Result<(Arc<BrokerSession>, Arc<Mutex<VecDeque<Pending>>>)> {
        let sessions = self.sessions.lock().await;
        if sessions.is_empty() {
            return Err(NsqError::NoConnections);
        }
        let mut addrs: Vec<&String> = sessions.keys().collect();
        addrs.sort();
        let i = self.cursor.fetch_add(1, Ordering::SeqCst) % addrs.len();
        let pooled = &sessions[addrs[i]];
        Ok((pooled.session.clone(), pooled.pending.clone()))
    }

    /// Queues a response promise before issuing `send`, matching the
    /// reference client's ordering: the broker must never be able to
    /// answer before the promise exists to receive it.
    async fn call(&self, send: impl FnOnce(Arc<BrokerSession>) -> BoxSend) -> Result<()> {
        let (session, pending) = self.pick().await?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.lock().await.push_back((token, tx));

        if let Err(e) = send(session).await {
            let mut queue = pending.lock().await;
            queue.retain(|(t, _)| *t != token);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(payload)) if &payload[..] == b"OK" => Ok(()),
            Ok(Ok(_)) => Err(NsqError::PubFailed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NsqError::NoConnections),
        }
    }

    pub async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        let topic = topic.to_string();
        let body = Bytes::copy_from_slice(body);
        self.call(move |session| Box::pin(async move { session.publish(&topic, &body).await }))
            .await
    }

    pub async fn multipublish(&self, topic: &str, bodies: &[Bytes]) -> Result<()> {
        let topic = topic.to_string();
        let bodies = bodies.to_vec();
        self.call(move |session| Box::pin(async move { session.multipublish(&topic, &bodies).await }))
            .await
    }

    pub async fn defer_publish(&self, topic: &str, body: &[u8], delay_ms: i64) -> Result<()> {
        let topic = topic.to_string();
        let body = Bytes::copy_from_slice(body);
        self.call(move |session| Box::pin(async move { session.defer_publish(&topic, &body, delay_ms).await }))
            .await
    }

    pub async fn close(&self) {
        let sessions = self.sessions.lock().await;
        for pooled in sessions.values() {
            let _ = pooled.session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_empty_address_list() {
        let config = ProducerConfig {
            session: crate::config::SessionConfig::default(),
            nsqd_tcp_addresses: Vec::new(),
        };
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let producer = Arc::new(Producer::new(config, log));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(async move { producer.start().await });
        assert!(matches!(result, Err(NsqError::Invalid)));
    }
}
