//! Consumer Supervisor: owns a set of Broker Sessions subscribed to a
//! (topic, channel), runs discovery polling, RDY redistribution, and the
//! per-session backoff state machine, and dispatches messages to a
//! user-supplied handler.
//!
//! Grounded on the reference client's `Consumer`: the `_connections`
//! bookkeeping dict, `_redistribute_ready_state`'s oversubscribed/saturated
//! split, and `_create_backoff`/`_start_backoff`/`_start_throttled`/
//! `_complete_backoff`'s state machine. The connection map and its
//! bookkeeping are confined to a single event-loop task (§5 "Shared
//! state"), mirroring the way the teacher's `Endpoint` confines all
//! `Connection` mutation to the task draining its `Io`/`Event` queues.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use slog::Logger;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;

use crate::backoff::BackoffTimer;
use crate::config::ConsumerConfig;
use crate::error::{NsqError, Result};
use crate::lookup::LookupClient;
use crate::message::Message;
use crate::protocol;
use crate::session::{BrokerSession, ResponseEvent};
use crate::signal::Signal;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnSessionState {
    Init,
    Running,
    Backoff,
    Throttled,
}

struct ConnEntry {
    session: Arc<BrokerSession>,
    is_static: bool,
    state: ConnSessionState,
    advertised_rdy: u32,
    msg_backoff: BackoffTimer,
}

enum ConsumerControl {
    ReaderExited(String),
    BackoffElapsed(String),
    ReconnectDue(String),
    Outcome(String, bool),
}

#[derive(Clone)]
pub struct GivingUpEvent {
    pub address: String,
    pub message_id: [u8; 16],
    pub attempts: u16,
}

#[derive(Clone)]
pub struct ExceptionEvent {
    pub address: String,
    pub message_id: [u8; 16],
}

/// Named signals per §6: emit-only, subscribers are user code.
#[derive(Default)]
pub struct ConsumerSignals {
    pub on_message: Signal<Message>,
    pub on_response: Signal<(String, bytes::Bytes)>,
    pub on_error: Signal<(String, String)>,
    pub on_finish: Signal<(String, [u8; 16])>,
    pub on_requeue: Signal<(String, [u8; 16], i64)>,
    pub on_giving_up: Signal<GivingUpEvent>,
    pub on_exception: Signal<ExceptionEvent>,
    pub on_auth: Signal<(String, bytes::Bytes)>,
    pub on_close: Signal<()>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum SupervisorState {
    Init = 0,
    Running = 1,
    Closed = 2,
}

pub struct Consumer {
    topic: String,
    channel: String,
    config: ConsumerConfig,
    handler: HandlerFn,
    state: Arc<AtomicU8>,
    pub signals: Arc<std::sync::Mutex<ConsumerSignals>>,
    wake: Arc<Notify>,
    closed_notify: Arc<Notify>,
    done_notify: Arc<Notify>,
    log: Logger,
}

impl Consumer {
    pub fn new(topic: &str, channel: &str, config: ConsumerConfig, handler: HandlerFn, log: Logger) -> Result<Self> {
        protocol::assert_valid_topic_name(topic)?;
        protocol::assert_valid_channel_name(channel)?;
        Ok(Consumer {
            topic: topic.to_string(),
            channel: channel.to_string(),
            config,
            handler,
            state: Arc::new(AtomicU8::new(SupervisorState::Init as u8)),
            signals: Arc::new(std::sync::Mutex::new(ConsumerSignals::default())),
            wake: Arc::new(Notify::new()),
            closed_notify: Arc::new(Notify::new()),
            done_notify: Arc::new(Notify::new()),
            log,
        })
    }

    fn state(&self) -> SupervisorState {
        match self.state.load(Ordering::SeqCst) {
            0 => SupervisorState::Init,
            1 => SupervisorState::Running,
            _ => SupervisorState::Closed,
        }
    }

    /// Transitions INIT -> RUNNING, connects every static address, and
    /// spawns the event loop (discovery + redistribution + dispatch).
    /// Rejects re-entry per §4.5.1.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() != SupervisorState::Init {
            return Err(NsqError::Invalid);
        }
        self.state.store(SupervisorState::Running as u8, Ordering::SeqCst);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_event_loop().await;
        });
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>) {
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<(String, ResponseEvent)>();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ConsumerControl>();
        let mut connections: FnvHashMap<String, ConnEntry> = FnvHashMap::default();

        for addr in self.config.nsqd_tcp_addresses.clone() {
            self.spawn_connect(addr, true, &wire_tx, &control_tx, &mut connections).await;
        }

        let lookupds: Vec<LookupClient> = self
            .config
            .lookupd_http_addresses
            .iter()
            .map(|a| LookupClient::new(a))
            .collect();
        let mut lookup_cursor = 0usize;

        if !lookupds.is_empty() {
            let jitter = self.config.discovery_jitter.clamp(0.0, 1.0);
            let max_delay = self.config.discovery_period.as_secs_f64() * jitter;
            let delay = rand::thread_rng().gen::<f64>() * max_delay;
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let mut redistribute_tick = interval(Duration::from_secs(5));
        let mut discovery_tick = interval(self.config.discovery_period.max(Duration::from_millis(1)));

        loop {
            if self.state() == SupervisorState::Closed {
                break;
            }

            tokio::select! {
                Some((addr, event)) = wire_rx.recv() => {
                    self.handle_wire_event(&addr, event, &control_tx).await;
                    self.wake.notify_one();
                }
                Some(ctrl) = control_rx.recv() => {
                    self.handle_control(ctrl, &mut connections, &wire_tx, &control_tx).await;
                    self.wake.notify_one();
                }
                _ = redistribute_tick.tick() => {
                    self.redistribute(&mut connections).await;
                }
                _ = discovery_tick.tick() => {
                    if !lookupds.is_empty() {
                        let lookupd = &lookupds[lookup_cursor % lookupds.len()];
                        lookup_cursor = lookup_cursor.wrapping_add(1);
                        self.poll_lookupd(lookupd, &mut connections, &wire_tx, &control_tx).await;
                    }
                }
                _ = self.wake.notified() => {
                    self.redistribute(&mut connections).await;
                }
                _ = self.closed_notify.notified() => {
                    break;
                }
            }
        }

        for entry in connections.values() {
            let _ = entry.session.close().await;
        }
        self.signals.lock().unwrap().on_close.emit(&());
        self.done_notify.notify_waiters();
    }

    async fn spawn_connect(
        self: &Arc<Self>,
        addr: String,
        is_static: bool,
        wire_tx: &mpsc::UnboundedSender<(String, ResponseEvent)>,
        control_tx: &mpsc::UnboundedSender<ConsumerControl>,
        connections: &mut FnvHashMap<String, ConnEntry>,
    ) {
        if connections.contains_key(&addr) {
            return;
        }
        let session_config = self.config.session.clone();
        let log = self.log.new(slog::o!("address" => addr.clone()));
        match BrokerSession::connect(&addr, session_config, log).await {
            Ok(session) => {
                match session.identify().await {
                    Ok(Some(auth_response)) => {
                        self.signals
                            .lock()
                            .unwrap()
                            .on_auth
                            .emit(&(addr.clone(), auth_response));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        slog::warn!(self.log, "identify failed"; "address" => &addr, "error" => %e);
                        if is_static {
                            self.schedule_reconnect(addr, control_tx.clone());
                        }
                        return;
                    }
                }
                if let Err(e) = session.subscribe(&self.topic, &self.channel).await {
                    slog::warn!(self.log, "subscribe failed"; "address" => &addr, "error" => %e);
                    if is_static {
                        self.schedule_reconnect(addr, control_tx.clone());
                    }
                    return;
                }

                let session_for_reader = session.clone();
                let wire_tx2 = wire_tx.clone();
                let control_tx2 = control_tx.clone();
                let addr2 = addr.clone();
                tokio::spawn(async move {
                    session_for_reader.listen(wire_tx2).await;
                    let _ = control_tx2.send(ConsumerControl::ReaderExited(addr2));
                });

                connections.insert(
                    addr.clone(),
                    ConnEntry {
                        session,
                        is_static,
                        state: ConnSessionState::Init,
                        advertised_rdy: 0,
                        msg_backoff: BackoffTimer::new(
                            1.0,
                            None,
                            Some(self.config.max_backoff_duration),
                        ),
                    },
                );
                slog::info!(self.log, "broker connected"; "address" => &addr);
            }
            Err(e) => {
                slog::warn!(self.log, "connect failed"; "address" => &addr, "error" => %e);
                if is_static {
                    self.schedule_reconnect(addr, control_tx.clone());
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, addr: String, control_tx: mpsc::UnboundedSender<ConsumerControl>) {
        let delay = Duration::from_secs(1);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control_tx.send(ConsumerControl::ReconnectDue(addr));
        });
    }

    async fn handle_control(
        self: &Arc<Self>,
        ctrl: ConsumerControl,
        connections: &mut FnvHashMap<String, ConnEntry>,
        wire_tx: &mpsc::UnboundedSender<(String, ResponseEvent)>,
        control_tx: &mpsc::UnboundedSender<ConsumerControl>,
    ) {
        match ctrl {
            ConsumerControl::ReaderExited(addr) => {
                let was_static = connections.get(&addr).map(|e| e.is_static).unwrap_or(false);
                connections.remove(&addr);
                slog::info!(self.log, "session disconnected"; "address" => &addr);
                if was_static && self.state() == SupervisorState::Running {
                    self.schedule_reconnect(addr, control_tx.clone());
                }
            }
            ConsumerControl::BackoffElapsed(addr) => {
                if let Some(entry) = connections.get_mut(&addr) {
                    if entry.state == ConnSessionState::Backoff {
                        entry.state = ConnSessionState::Throttled;
                        slog::debug!(self.log, "backoff -> throttled"; "address" => &addr);
                    }
                }
            }
            ConsumerControl::ReconnectDue(addr) => {
                if self.state() == SupervisorState::Running {
                    self.spawn_connect(addr, true, wire_tx, control_tx, connections).await;
                }
            }
            ConsumerControl::Outcome(addr, success) => {
                if let Some(entry) = connections.get_mut(&addr) {
                    self.apply_outcome(entry, &addr, success, control_tx);
                }
            }
        }
    }

    async fn poll_lookupd(
        self: &Arc<Self>,
        lookupd: &LookupClient,
        connections: &mut FnvHashMap<String, ConnEntry>,
        wire_tx: &mpsc::UnboundedSender<(String, ResponseEvent)>,
        control_tx: &mpsc::UnboundedSender<ConsumerControl>,
    ) {
        match lookupd.lookup(&self.topic).await {
            Ok(result) => {
                for p in result.producers {
                    let addr = format!("{}:{}", p.broadcast_address, p.tcp_port);
                    self.spawn_connect(addr, false, wire_tx, control_tx, connections).await;
                }
            }
            Err(e) => {
                slog::warn!(self.log, "lookupd poll failed"; "error" => %e);
            }
        }
    }

    async fn handle_wire_event(
        self: &Arc<Self>,
        addr: &str,
        event: ResponseEvent,
        control_tx: &mpsc::UnboundedSender<ConsumerControl>,
    ) {
        match event {
            ResponseEvent::Message(msg) => {
                self.signals.lock().unwrap().on_message.emit(&msg);
                self.dispatch_message(addr.to_string(), msg, control_tx).await;
            }
            ResponseEvent::Response(payload) => {
                self.signals
                    .lock()
                    .unwrap()
                    .on_response
                    .emit(&(addr.to_string(), payload));
            }
            ResponseEvent::Error(err) => {
                slog::warn!(self.log, "session error"; "address" => addr, "error" => %err);
                self.signals
                    .lock()
                    .unwrap()
                    .on_error
                    .emit(&(addr.to_string(), err.to_string()));
            }
        }
    }

    async fn dispatch_message(
        self: &Arc<Self>,
        addr: String,
        msg: Message,
        control_tx: &mpsc::UnboundedSender<ConsumerControl>,
    ) {
        if self.config.max_tries > 0 && msg.attempts > self.config.max_tries {
            self.signals.lock().unwrap().on_giving_up.emit(&GivingUpEvent {
                address: addr.clone(),
                message_id: msg.id,
                attempts: msg.attempts,
            });
            let _ = msg.finish();
            return;
        }

        let handler = self.handler.clone();
        let this = self.clone();
        let addr_for_task = addr.clone();
        let msg_for_handler = msg.clone();
        let control_tx = control_tx.clone();

        tokio::spawn(async move {
            let outcome = handler(msg_for_handler).await;

            if this.state() == SupervisorState::Closed {
                // §9: do not send a response if we raced a shutdown.
                return;
            }

            let success = match outcome {
                Ok(()) => {
                    if !msg.has_responded() {
                        match msg.finish() {
                            Ok(()) => {
                                this.signals
                                    .lock()
                                    .unwrap()
                                    .on_finish
                                    .emit(&(addr_for_task.clone(), msg.id));
                            }
                            Err(e) => {
                                slog::warn!(this.log, "auto-finish failed"; "error" => %e);
                            }
                        }
                    }
                    true
                }
                Err(NsqError::RequeueRequest) => {
                    // Backoff is driven by the requeue's own backoff flag,
                    // not by the mere fact of requeuing: a plain requeue
                    // (backoff_on_requeue == false) counts as success.
                    let mut requeued_with_backoff = false;
                    if !msg.has_responded() {
                        let delay = this.config.requeue_delay.as_millis() as i64;
                        let backoff_flag = this.config.backoff_on_requeue;
                        if msg.requeue(delay, backoff_flag).is_ok() {
                            this.signals
                                .lock()
                                .unwrap()
                                .on_requeue
                                .emit(&(addr_for_task.clone(), msg.id, delay));
                            requeued_with_backoff = backoff_flag;
                        }
                    }
                    !requeued_with_backoff
                }
                Err(e) => {
                    this.signals.lock().unwrap().on_exception.emit(&ExceptionEvent {
                        address: addr_for_task.clone(),
                        message_id: msg.id,
                    });
                    slog::warn!(this.log, "handler raised"; "error" => %e);
                    if !msg.has_responded() {
                        let delay = this.config.requeue_delay.as_millis() as i64;
                        if msg.requeue(delay, true).is_ok() {
                            this.signals
                                .lock()
                                .unwrap()
                                .on_requeue
                                .emit(&(addr_for_task.clone(), msg.id, delay));
                        }
                    }
                    false
                }
            };

            let _ = control_tx.send(ConsumerControl::Outcome(addr_for_task, success));
        });
    }

    /// Applies the backoff state machine transition for one session based
    /// on the outcome of its most recent finish/requeue, per §4.5.4. Called
    /// from the event loop so all state mutation stays on one task.
    fn apply_outcome(&self, entry: &mut ConnEntry, addr: &str, success: bool, control_tx: &mpsc::UnboundedSender<ConsumerControl>) {
        if self.config.max_backoff_duration.is_zero() {
            if entry.state == ConnSessionState::Init && success {
                entry.state = ConnSessionState::Running;
            }
            return;
        }

        match entry.state {
            ConnSessionState::Init if success => {
                entry.state = ConnSessionState::Running;
            }
            ConnSessionState::Running if !success => {
                entry.msg_backoff.failure();
                entry.state = ConnSessionState::Backoff;
                let interval = entry.msg_backoff.get_interval();
                let addr = addr.to_string();
                let control_tx = control_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    let _ = control_tx.send(ConsumerControl::BackoffElapsed(addr));
                });
                self.wake.notify_one();
            }
            ConnSessionState::Throttled if !success => {
                entry.msg_backoff.failure();
                entry.state = ConnSessionState::Backoff;
                let interval = entry.msg_backoff.get_interval();
                let addr = addr.to_string();
                let control_tx = control_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    let _ = control_tx.send(ConsumerControl::BackoffElapsed(addr));
                });
                self.wake.notify_one();
            }
            ConnSessionState::Throttled if success => {
                entry.msg_backoff.success();
                if entry.msg_backoff.is_reset() {
                    entry.state = ConnSessionState::Running;
                } else {
                    entry.state = ConnSessionState::Backoff;
                    let interval = entry.msg_backoff.get_interval();
                    let addr = addr.to_string();
                    let control_tx = control_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(interval).await;
                        let _ = control_tx.send(ConsumerControl::BackoffElapsed(addr));
                    });
                }
                self.wake.notify_one();
            }
            _ => {}
        }
    }

    /// Runs one redistribution pass per §4.5.3.
    async fn redistribute(&self, connections: &mut FnvHashMap<String, ConnEntry>) {
        if connections.is_empty() {
            return;
        }
        let max_in_flight = self.config.max_in_flight;
        let idle_timeout = self.config.low_ready_idle_timeout;

        let mut targets: FnvHashMap<String, u32> = FnvHashMap::default();

        if connections.len() as u32 > max_in_flight {
            let candidates: Vec<String> = connections
                .iter()
                .filter(|(_, e)| e.state != ConnSessionState::Backoff)
                .map(|(addr, _)| addr.clone())
                .collect();
            let mut rng = rand::thread_rng();
            let mut shuffled = candidates.clone();
            shuffled.shuffle(&mut rng);
            let subset: std::collections::HashSet<&String> =
                shuffled.iter().take(max_in_flight as usize).collect();

            for (addr, entry) in connections.iter() {
                if subset.contains(addr) {
                    let idle = entry.session.idle_duration() > idle_timeout;
                    targets.insert(addr.clone(), if idle { 0 } else { 1 });
                } else {
                    targets.insert(addr.clone(), 0);
                }
            }
        } else {
            let mut already_granted = 0u32;
            let mut running_remaining: Vec<String> = Vec::new();

            for (addr, entry) in connections.iter() {
                match entry.state {
                    ConnSessionState::Backoff => {
                        targets.insert(addr.clone(), 0);
                    }
                    ConnSessionState::Init | ConnSessionState::Throttled => {
                        targets.insert(addr.clone(), 1);
                        already_granted += 1;
                    }
                    ConnSessionState::Running => {
                        if entry.session.idle_duration() > idle_timeout {
                            targets.insert(addr.clone(), 1);
                            already_granted += 1;
                        } else {
                            running_remaining.push(addr.clone());
                        }
                    }
                }
            }

            let remaining_budget = max_in_flight.saturating_sub(already_granted);
            if !running_remaining.is_empty() {
                let n = running_remaining.len() as u32;
                let floor_share = remaining_budget / n;
                let remainder = remaining_budget % n;
                let mut rng = rand::thread_rng();
                running_remaining.shuffle(&mut rng);
                for (i, addr) in running_remaining.iter().enumerate() {
                    let share = floor_share + if (i as u32) < remainder { 1 } else { 0 };
                    targets.insert(addr.clone(), share);
                }
            }
        }

        for (addr, target) in targets {
            if let Some(entry) = connections.get_mut(&addr) {
                if entry.advertised_rdy != target {
                    match entry.session.ready(target).await {
                        Ok(()) => entry.advertised_rdy = target,
                        Err(e) => {
                            slog::warn!(self.log, "ready(n) failed"; "address" => &addr, "error" => %e);
                        }
                    }
                }
            }
        }
    }

    /// Idempotent shutdown: transitions to CLOSED, stops background work,
    /// and closes every session's stream without waiting.
    pub fn close(self: &Arc<Self>) {
        if self.state.swap(SupervisorState::Closed as u8, Ordering::SeqCst) == SupervisorState::Closed as u8 {
            return;
        }
        self.closed_notify.notify_waiters();
    }

    pub async fn join(self: &Arc<Self>, timeout: Option<Duration>) {
        let wait = self.done_notify.notified();
        match timeout {
            Some(d) => {
                let _ = tokio::time::timeout(d, wait).await;
            }
            None => wait.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_log() -> Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn rejects_invalid_topic_name() {
        let config = ConsumerConfig::new("t", "c")
            .nsqd_tcp_addresses(vec!["127.0.0.1:4150".into()])
            .build()
            .unwrap()
            .2;
        let handler: HandlerFn = Arc::new(|_msg| Box::pin(async { Ok(()) }));
        let result = Consumer::new("bad topic", "c", config, handler, noop_log());
        assert!(result.is_err());
    }
}
