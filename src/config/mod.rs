//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (YAML)
//!     → loader.rs (parse, compile route patterns and targets)
//!     → validation.rs (semantic checks)
//!     → Snapshot (validated, immutable)
//!     → store.rs (atomic slot, shared via Arc to all subsystems)
//!
//! On reload:
//!     watcher.rs detects change
//!     → loader + validation as above
//!     → store.publish: atomic swap + transport cache invalidation
//!     → in-flight requests finish on the snapshot they captured
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a full publish
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod store;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, CompiledRoute, ConfigError, Snapshot};
pub use schema::{GatewayConfig, HttpTransportConfig, RouteConfig, TransportConfig};
pub use store::ConfigStore;
