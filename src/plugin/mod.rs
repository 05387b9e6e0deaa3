//! Signed middleware plugins.
//!
//! # Data Flow
//! ```text
//! plugin dir: <name>/<name>.bin + <name>.bin.sig + config.yaml
//!     → verify.rs (public-key integrity, Ed25519 over SHA-256)
//!     → registry.rs (dynamic load, factory symbol, init)
//!     → chain.rs (per-route handler composition)
//! ```
//!
//! # Design Decisions
//! - Trust is established before any plugin code is mapped into the
//!   process: a tampered public key or binary never loads
//! - A plugin failing verification is skipped; a plugin failing `init`
//!   aborts startup
//! - Built-in middlewares register through the same registry seam

pub mod chain;
pub mod registry;
pub mod verify;

pub use chain::{build_chain, CRITICAL_MIDDLEWARES};
pub use registry::PluginRegistry;

use std::sync::Arc;

use crate::config::Snapshot;
use crate::lifecycle::Shutdown;
use crate::observability::MetricsRecorder;
use crate::proxy::SharedHandler;

/// Symbol every plugin library exports: `fn() -> Box<dyn GatewayPlugin>`.
pub const PLUGIN_CONSTRUCTOR_SYMBOL: &[u8] = b"new_instance";

pub type PluginConstructor = fn() -> Box<dyn GatewayPlugin>;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("trust failure: {0}")]
    Trust(#[from] verify::TrustError),

    #[error("failed to load plugin library: {0}")]
    Load(String),

    #[error("plugin is missing the `new_instance` constructor: {0}")]
    Symbol(String),

    #[error("invalid plugin config: {0}")]
    Config(String),

    #[error("plugin '{name}' failed to initialise: {reason}")]
    Init { name: String, reason: String },
}

/// Application surface handed to plugins during `init`.
pub trait AppAccessor: Send + Sync {
    fn snapshot(&self) -> Arc<Snapshot>;
    fn metrics(&self) -> Arc<dyn MetricsRecorder>;
}

/// Startup context handed to plugins during `init`. Long-running plugin
/// work must stop when the shutdown signal fires.
pub struct PluginContext {
    shutdown: Arc<Shutdown>,
}

impl PluginContext {
    pub fn new(shutdown: Arc<Shutdown>) -> Self {
        Self { shutdown }
    }

    pub fn on_shutdown(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

/// A handler-wrapping middleware provided by a plugin.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: SharedHandler) -> SharedHandler;
}

/// The interface every plugin implements. Instances are shared across
/// requests and must be reentrant.
pub trait GatewayPlugin: Send + Sync {
    /// Unique plugin name, matched against route `middlewares` lists.
    fn name(&self) -> &str;

    /// One-time initialisation with the plugin's own `config.yaml`.
    fn init(
        &mut self,
        ctx: &PluginContext,
        config: serde_yaml::Value,
        app: &dyn AppAccessor,
    ) -> Result<(), PluginError>;

    /// The middleware this plugin contributes, if any.
    fn middleware(&self) -> Option<Arc<dyn Middleware>>;
}
