//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → shared via Arc with the transport and its tasks
//! ```
//!
//! # Design Decisions
//! - Config is an immutable snapshot; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ListenerConfig, MinDataRateConfig, ObservabilityConfig, PipeConfig, PoolConfig,
    RateThreshold, ShutdownConfig, TransportConfig, WatermarkConfig,
};
pub use validation::{validate_config, ValidationError};
