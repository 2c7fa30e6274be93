//! Configuration surfaces for sessions, consumers, and producers.

use std::time::Duration;

use crate::error::{NsqError, Result};

/// Options shared by every broker session, consumer or producer alike.
///
/// Sent to the broker as the `IDENTIFY` payload and used locally to decide
/// which stream upgrades to request.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Short identifier for this client, sent as `client_id`.
    pub client_id: String,
    /// Sent as `hostname`.
    pub hostname: String,
    /// Interval at which the broker sends heartbeats; 0 disables them.
    pub heartbeat_interval: Duration,
    /// Size of the broker's outbound buffer before it flushes to us.
    pub output_buffer_size: u32,
    /// Maximum time the broker buffers before flushing regardless of size.
    pub output_buffer_timeout: Duration,
    /// Request a TLS upgrade if the broker supports it.
    pub tls_v1: bool,
    /// Accept self-signed / unverified certificates during the TLS upgrade.
    pub tls_insecure_skip_verify: bool,
    /// Request a Snappy upgrade if the broker supports it. Takes priority
    /// over `deflate` when both are requested and the broker supports both.
    pub snappy: bool,
    /// Request a DEFLATE upgrade if the broker supports it.
    pub deflate: bool,
    /// Compression level to request/use for DEFLATE, 0-9.
    pub deflate_level: u32,
    /// Requests the broker randomly drop a percentage of messages, 0-99.
    pub sample_rate: u32,
    /// Secret used for `AUTH` if the broker requires authentication.
    pub auth_secret: Option<Vec<u8>>,
    /// Sent as `user_agent`.
    pub user_agent: String,
    /// Deadline applied to every socket read and write.
    pub socket_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let hostname = hostname_or_unknown();
        SessionConfig {
            client_id: hostname.clone(),
            hostname,
            heartbeat_interval: Duration::from_secs(30),
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            tls_v1: false,
            tls_insecure_skip_verify: false,
            snappy: false,
            deflate: false,
            deflate_level: 6,
            sample_rate: 0,
            auth_secret: None,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            socket_timeout: Duration::from_secs(60),
        }
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Configuration for a `Consumer` supervisor.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub session: SessionConfig,
    /// Statically configured broker addresses (`host:port`), always
    /// eligible for automatic reconnection.
    pub nsqd_tcp_addresses: Vec<String>,
    /// `nsqlookupd` HTTP addresses polled for producers of `topic`.
    pub lookupd_http_addresses: Vec<String>,
    /// Maximum delivery attempts before giving up; 0 means unlimited.
    pub max_tries: u16,
    /// Total RDY credit distributed across every connected session. Must
    /// be at least 1 (§9 open question, resolved: rejected at construction).
    pub max_in_flight: u32,
    /// Delay applied to requeues that don't specify their own.
    pub requeue_delay: Duration,
    /// Interval between discovery polls of the lookupd set.
    pub discovery_period: Duration,
    /// Fractional jitter (0..1) applied to the first discovery delay.
    pub discovery_jitter: f64,
    /// How long a session may go without a message before being granted
    /// RDY 1 regardless of the redistribution regime.
    pub low_ready_idle_timeout: Duration,
    /// Ceiling on the per-session backoff interval; 0 disables backoff.
    pub max_backoff_duration: Duration,
    /// Whether a plain requeue (no explicit backoff hint) also triggers
    /// the backoff state machine.
    pub backoff_on_requeue: bool,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            topic: topic.into(),
            channel: channel.into(),
            config: ConsumerConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_in_flight < 1 {
            return Err(NsqError::Invalid);
        }
        if self.nsqd_tcp_addresses.is_empty() && self.lookupd_http_addresses.is_empty() {
            return Err(NsqError::Invalid);
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            session: SessionConfig::default(),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            max_tries: 5,
            max_in_flight: 1,
            requeue_delay: Duration::from_secs(0),
            discovery_period: Duration::from_secs(60),
            discovery_jitter: 0.3,
            low_ready_idle_timeout: Duration::from_secs(10),
            max_backoff_duration: Duration::from_secs(128),
            backoff_on_requeue: true,
        }
    }
}

/// Builds a `ConsumerConfig` and validates it on `build()`, since
/// `max_in_flight < 1` (§9) must be rejected rather than silently clamped.
pub struct ConsumerConfigBuilder {
    topic: String,
    channel: String,
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn nsqd_tcp_addresses(mut self, addrs: Vec<String>) -> Self {
        self.config.nsqd_tcp_addresses = addrs;
        self
    }

    pub fn lookupd_http_addresses(mut self, addrs: Vec<String>) -> Self {
        self.config.lookupd_http_addresses = addrs;
        self
    }

    pub fn max_in_flight(mut self, n: u32) -> Self {
        self.config.max_in_flight = n;
        self
    }

    pub fn max_tries(mut self, n: u16) -> Self {
        self.config.max_tries = n;
        self
    }

    pub fn build(self) -> Result<(String, String, ConsumerConfig)> {
        self.config.validate()?;
        Ok((self.topic, self.channel, self.config))
    }
}

/// Configuration for a `Producer` supervisor.
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub session: SessionConfig,
    pub nsqd_tcp_addresses: Vec<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            session: SessionConfig::default(),
            nsqd_tcp_addresses: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_in_flight_zero_is_rejected() {
        let result = ConsumerConfig::new("t", "c")
            .nsqd_tcp_addresses(vec!["127.0.0.1:4150".into()])
            .max_in_flight(0)
            .build();
        assert!(matches!(result, Err(NsqError::Invalid)));
    }

    #[test]
    fn no_addresses_is_rejected() {
        let result = ConsumerConfig::new("t", "c").build();
        assert!(matches!(result, Err(NsqError::Invalid)));
    }

    #[test]
    fn valid_config_builds() {
        let (topic, channel, cfg) = ConsumerConfig::new("t", "c")
            .nsqd_tcp_addresses(vec!["127.0.0.1:4150".into()])
            .build()
            .unwrap();
        assert_eq!(topic, "t");
        assert_eq!(channel, "c");
        assert_eq!(cfg.max_in_flight, 1);
        assert_eq!(cfg.max_tries, 5);
    }
}
