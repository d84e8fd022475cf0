//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the upstream
//! engine. All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::CHUNK_SIZE;

/// Root configuration for the upstream fetch engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Optional parent proxy every request is routed through.
    pub parent: ParentConfig,

    /// Per-origin connection pool sizing.
    pub pool: PoolConfig,

    /// Pipelining policy.
    pub pipeline: PipelineConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Thresholds for RTT/rate sampling.
    pub stats: StatsConfig,

    /// Request body relay (POST/PUT).
    pub side: SideConfig,

    /// Identity and admission policy of this proxy.
    pub proxy: ProxyIdentityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl UpstreamConfig {
    /// Apply the clamps the engine relies on. Runs after validation.
    pub fn normalize(mut self) -> Self {
        self.pool.server_slots = self.pool.server_slots.max(1);
        self.pool.server_max_slots = self.pool.server_max_slots.max(1);
        if self.pool.server_slots > self.pool.server_max_slots {
            self.pool.server_slots = self.pool.server_max_slots;
        }
        self.pipeline.max_pipeline_train = self.pipeline.max_pipeline_train.max(1);
        self.pipeline.pmm_first_size = round_segment(self.pipeline.pmm_first_size);
        self.pipeline.pmm_size = round_segment(self.pipeline.pmm_size);
        if self.pipeline.pmm_first_size == 0 {
            self.pipeline.pmm_first_size = self.pipeline.pmm_size;
        }
        self
    }
}

/// Round a segment size to something the object store handles well:
/// a power of two below one chunk, a whole number of chunks above it.
fn round_segment(size: u64) -> u64 {
    let chunk = CHUNK_SIZE as u64;
    if size == 0 {
        0
    } else if size < chunk {
        size.next_power_of_two()
    } else {
        size.div_ceil(chunk) * chunk
    }
}

/// Parent proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ParentConfig {
    /// Parent proxy host name. Requests go direct when unset.
    pub host: Option<String>,

    /// Parent proxy port.
    pub port: u16,

    /// Credentials forwarded as `Proxy-Authorization: Basic ...`.
    pub auth_credentials: Option<String>,
}

impl Default for ParentConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 8123,
            auth_credentials: None,
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Slots per origin while it keeps connections alive.
    pub server_slots: usize,

    /// Slots per origin once it is known to close connections.
    pub server_max_slots: usize,

    /// Number of forced closes after which an origin counts as broken.
    pub broken_origin_threshold: i32,

    /// Idle origins are forgotten after this long.
    pub server_expire_secs: u64,

    /// Global cap on live connections (0 = unlimited).
    pub max_total_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            server_slots: 2,
            server_max_slots: 4,
            broken_origin_threshold: 5,
            server_expire_secs: 86_400,
            max_total_connections: 0,
        }
    }
}

impl PoolConfig {
    pub fn server_expire(&self) -> Duration {
        Duration::from_secs(self.server_expire_secs)
    }

    /// Interval of the idle-origin sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.server_expire_secs / 60 + 60)
    }
}

/// Whether extra requests may be pipelined behind a busy connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdditionalRequests {
    Never,
    Maybe,
    Always,
}

/// Pipelining configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Policy for pipelining behind an already busy connection.
    pub pipeline_additional_requests: AdditionalRequests,

    /// Maximum requests written in one batch once pipelining is enabled.
    pub max_pipeline_train: usize,

    /// A request counts as small if the origin's rate moves it within this time.
    pub small_request_secs: u64,

    /// Size of the first segment when segmenting large GETs (0 = off).
    pub pmm_first_size: u64,

    /// Size of subsequent segments (0 = off).
    pub pmm_size: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_additional_requests: AdditionalRequests::Maybe,
            max_pipeline_train: 10,
            small_request_secs: 10,
            pmm_first_size: 0,
            pmm_size: 0,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// DNS resolution plus TCP connect.
    pub connect_secs: u64,

    /// Waiting for reply bytes or write progress.
    pub read_secs: u64,

    /// Keep-alive connections with nothing to do.
    pub idle_secs: u64,

    /// CNAME hops followed before giving up.
    pub cname_max_depth: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 60,
            read_secs: 60,
            idle_secs: 60,
            cname_max_depth: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Statistics sampling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Minimum body size for a transfer-rate sample.
    pub rate_sample_min_bytes: u64,

    /// Minimum body transfer time for a transfer-rate sample.
    pub rate_sample_min_elapsed_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            rate_sample_min_bytes: 4096,
            rate_sample_min_elapsed_ms: 50,
        }
    }
}

/// Request body relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SideConfig {
    /// 0: never send `Expect: 100-continue`; 1: when the client asked;
    /// 2: also for every POST/PUT to an HTTP/1.1 origin.
    pub expect_continue: u8,

    /// Buffered body bytes that trigger a flush to the origin.
    pub flush_threshold: usize,

    /// Wait for `flush_threshold` bytes before writing.
    pub batching: bool,
}

impl Default for SideConfig {
    fn default() -> Self {
        Self {
            expect_continue: 1,
            flush_threshold: 1500,
            batching: true,
        }
    }
}

/// Inclusive port range a request may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }
}

/// Proxy identity and admission policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyIdentityConfig {
    /// Name appended to `Via` headers; also used for loop detection.
    pub proxy_name: String,

    /// Whether this cache is shared between users (honours `private`, `s-maxage`).
    pub cache_is_shared: bool,

    /// Ports requests may be sent to.
    pub allowed_ports: Vec<PortRange>,

    /// Refuse all upstream traffic.
    pub offline: bool,
}

impl Default for ProxyIdentityConfig {
    fn default() -> Self {
        Self {
            proxy_name: "proxy-upstream".to_string(),
            cache_is_shared: true,
            allowed_ports: vec![
                PortRange { from: 80, to: 100 },
                PortRange { from: 1024, to: 65535 },
            ],
            offline: false,
        }
    }
}

impl ProxyIdentityConfig {
    pub fn port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.iter().any(|r| r.contains(port))
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: UpstreamConfig = toml::from_str("").unwrap();
        assert_eq!(config.pool.server_slots, 2);
        assert_eq!(config.pool.server_max_slots, 4);
        assert_eq!(config.timeouts.cname_max_depth, 10);
        assert_eq!(
            config.pipeline.pipeline_additional_requests,
            AdditionalRequests::Maybe
        );
        assert!(config.proxy.port_allowed(80));
        assert!(!config.proxy.port_allowed(25));
    }

    #[test]
    fn sections_override_defaults() {
        let config: UpstreamConfig = toml::from_str(
            r#"
            [parent]
            host = "parent.example"
            port = 3128

            [pipeline]
            pipeline_additional_requests = "never"

            [[proxy.allowed_ports]]
            from = 25
            to = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.parent.host.as_deref(), Some("parent.example"));
        assert_eq!(config.parent.port, 3128);
        assert_eq!(
            config.pipeline.pipeline_additional_requests,
            AdditionalRequests::Never
        );
        assert!(config.proxy.port_allowed(25));
        assert!(!config.proxy.port_allowed(80));
    }

    #[test]
    fn normalize_clamps_slots_and_rounds_segments() {
        let mut config = UpstreamConfig::default();
        config.pool.server_slots = 9;
        config.pool.server_max_slots = 3;
        config.pipeline.pmm_size = 5000;
        let config = config.normalize();
        assert_eq!(config.pool.server_slots, 3);
        assert_eq!(config.pipeline.pmm_size, 8192);
        assert_eq!(config.pipeline.pmm_first_size, 8192);
    }

    #[test]
    fn sweep_interval_follows_expiry() {
        let pool = PoolConfig::default();
        assert_eq!(pool.sweep_interval(), Duration::from_secs(86_400 / 60 + 60));
    }
}
