//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipe::Watermarks;
use crate::security::min_data_rate::{DataRateLimits, MinDataRate};

/// Root configuration for the transport core.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Listener configuration (bind address, limits, accept loop).
    pub listener: ListenerConfig,

    /// Duplex pipe sizing and watermarks.
    pub pipe: PipeConfig,

    /// Object pool capacities.
    pub pool: PoolConfig,

    /// Minimum data rate enforcement.
    pub min_data_rate: MinDataRateConfig,

    /// Graceful shutdown deadlines.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections. Accepts over the limit are rejected.
    pub max_connections: usize,

    /// Reactor worker threads (0 = runtime default).
    pub io_threads: usize,

    /// Base delay after a transient accept failure, in milliseconds.
    pub accept_backoff_base_ms: u64,

    /// Maximum delay after repeated accept failures, in milliseconds.
    pub accept_backoff_max_ms: u64,

    /// Bytes read from the socket per read call.
    pub read_buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            io_threads: 0,
            accept_backoff_base_ms: 10,
            accept_backoff_max_ms: 1000,
            read_buffer_size: 8192,
        }
    }
}

/// High/low watermarks for one pipe direction, in bytes.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct WatermarkConfig {
    /// Writers pause above this many unconsumed bytes (0 = never).
    pub high_watermark: usize,

    /// Paused writers resume below this many unconsumed bytes.
    pub low_watermark: usize,
}

impl WatermarkConfig {
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            high: self.high_watermark,
            low: self.low_watermark,
        }
    }
}

/// Duplex pipe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Size of each pooled buffer segment.
    pub segment_size: usize,

    /// Network → application direction.
    pub input: WatermarkConfig,

    /// Application → network direction.
    pub output: WatermarkConfig,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            segment_size: 4096,
            input: WatermarkConfig {
                high_watermark: 1024 * 1024,
                low_watermark: 512 * 1024,
            },
            output: WatermarkConfig {
                high_watermark: 64 * 1024,
                low_watermark: 32 * 1024,
            },
        }
    }
}

/// Object pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle buffer segments kept for reuse.
    pub segment_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            segment_capacity: 256,
        }
    }
}

/// A minimum rate for one phase.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RateThreshold {
    /// Minimum average throughput.
    pub bytes_per_second: f64,

    /// Time after phase start before the rate is enforced, in milliseconds.
    pub grace_period_ms: u64,
}

impl RateThreshold {
    pub fn min_data_rate(&self) -> MinDataRate {
        MinDataRate::new(
            self.bytes_per_second,
            Duration::from_millis(self.grace_period_ms),
        )
    }
}

/// Minimum data rate configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MinDataRateConfig {
    /// Enforce minimum rates on new connections.
    pub enabled: bool,

    /// How often every connection's rate is checked, in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Threshold while receiving the request head (`None` = unmonitored).
    pub request_head: Option<RateThreshold>,

    /// Threshold while receiving a request body.
    pub request_body: Option<RateThreshold>,

    /// Threshold while sending a response body.
    pub response_body: Option<RateThreshold>,
}

impl MinDataRateConfig {
    pub fn limits(&self) -> DataRateLimits {
        DataRateLimits {
            request_head: self.request_head.map(|t| t.min_data_rate()),
            request_body: self.request_body.map(|t| t.min_data_rate()),
            response_body: self.response_body.map(|t| t.min_data_rate()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for MinDataRateConfig {
    fn default() -> Self {
        let body = RateThreshold {
            bytes_per_second: 240.0,
            grace_period_ms: 5000,
        };
        Self {
            enabled: true,
            heartbeat_interval_ms: 1000,
            request_head: None,
            request_body: Some(body),
            response_body: Some(body),
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for connections to close gracefully, in seconds.
    pub close_timeout_secs: u64,

    /// Time allowed for forced aborts to complete, in seconds.
    pub abort_timeout_secs: u64,
}

impl ShutdownConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_timeout_secs: 5,
            abort_timeout_secs: 2,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Colored log output.
    pub ansi: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            ansi: true,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
