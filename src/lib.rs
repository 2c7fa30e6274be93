//! Client library for the NSQ distributed messaging platform.
//!
//! A [`Consumer`] subscribes to a `(topic, channel)` across one or more
//! `nsqd` brokers (statically configured, discovered via `nsqlookupd`, or
//! both), redistributes `RDY` credit across them, and dispatches delivered
//! messages to a handler. A [`Producer`] publishes to a pool of `nsqd`
//! connections. Both are built on top of [`BrokerSession`], a single TCP
//! connection's protocol state machine.

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod error;
pub mod lookup;
pub mod message;
pub mod producer;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod stream;

pub use config::{ConsumerConfig, ProducerConfig, SessionConfig};
pub use consumer::{Consumer, ConsumerSignals, HandlerFn, HandlerFuture};
pub use error::{NsqError, Result};
pub use lookup::LookupClient;
pub use message::Message;
pub use producer::Producer;
pub use session::{BrokerSession, SessionState};
