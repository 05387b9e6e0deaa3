//! Plugin loading and lookup.
//!
//! Scans the configured directory for `<name>/<name>.bin` layouts,
//! verifies each binary against the trusted key, loads it with
//! `libloading`, and initialises the instance with its own `config.yaml`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use libloading::Library;

use crate::config::schema::PluginsConfig;
use crate::plugin::verify::{load_trusted_public_key, verify_plugin_signature};
use crate::plugin::{
    AppAccessor, GatewayPlugin, PluginConstructor, PluginContext, PluginError,
    PLUGIN_CONSTRUCTOR_SYMBOL,
};

struct LoadedPlugin {
    instance: Arc<dyn GatewayPlugin>,
    /// Keeps the dynamic library mapped for the instance's lifetime.
    /// `None` for statically registered (built-in) plugins.
    _library: Option<Library>,
}

/// Named middleware plugins, loaded once at startup and shared by every
/// request.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, LoadedPlugin>,
}

impl PluginRegistry {
    /// Registry with no plugins; used when the config leaves plugins off.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Verify, load, and initialise every plugin under the configured
    /// directory.
    ///
    /// A plugin failing signature verification is logged and skipped; a
    /// plugin whose `init` fails aborts startup, as does a public key
    /// that fails its integrity check.
    pub fn load(
        config: &PluginsConfig,
        app: &dyn AppAccessor,
        ctx: &PluginContext,
    ) -> Result<Self, PluginError> {
        if !config.is_configured() {
            return Ok(Self::empty());
        }

        let key = load_trusted_public_key(
            Path::new(&config.public_key_path),
            &config.public_key_hash,
        )?;

        let dir = Path::new(&config.directory);
        let entries = fs::read_dir(dir).map_err(|source| PluginError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut registry = Self::empty();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match load_one(dir, &name, &key, app, ctx) {
                Ok(loaded) => {
                    let registered = loaded.instance.name().to_string();
                    tracing::info!(plugin = %registered, "Plugin loaded and initialised");
                    registry.plugins.insert(registered, loaded);
                }
                Err(e @ PluginError::Init { .. }) => {
                    // An initialised-but-broken plugin is worse than a
                    // missing one; refuse to start.
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(plugin = %name, error = %e, "Failed to load plugin, skipping");
                }
            }
        }

        Ok(registry)
    }

    /// Register an in-process plugin. Built-in middlewares and tests use
    /// this seam; these skip signature verification because their code is
    /// already part of the binary.
    pub fn register_static(&mut self, plugin: Arc<dyn GatewayPlugin>) {
        let name = plugin.name().to_string();
        self.plugins.insert(
            name,
            LoadedPlugin {
                instance: plugin,
                _library: None,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn GatewayPlugin>> {
        self.plugins.get(name).map(|p| Arc::clone(&p.instance))
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

fn load_one(
    dir: &Path,
    name: &str,
    key: &VerifyingKey,
    app: &dyn AppAccessor,
    ctx: &PluginContext,
) -> Result<LoadedPlugin, PluginError> {
    let binary_path = dir.join(name).join(format!("{}.bin", name));
    verify_plugin_signature(&binary_path, key)?;

    // SAFETY: the binary's signature was just verified against the pinned
    // key, which is the trust boundary for mapping foreign code. The
    // library must export `new_instance` with the documented signature
    // and stays alive as long as the instance it produced.
    let library = unsafe { Library::new(&binary_path) }
        .map_err(|e| PluginError::Load(e.to_string()))?;
    let mut instance = {
        let constructor = unsafe { library.get::<PluginConstructor>(PLUGIN_CONSTRUCTOR_SYMBOL) }
            .map_err(|e| PluginError::Symbol(e.to_string()))?;
        constructor()
    };

    let plugin_config = load_plugin_config(&dir.join(name).join("config.yaml"))?;
    instance
        .init(ctx, plugin_config, app)
        .map_err(|e| PluginError::Init {
            name: instance.name().to_string(),
            reason: e.to_string(),
        })?;

    Ok(LoadedPlugin {
        instance: Arc::from(instance),
        _library: Some(library),
    })
}

/// A plugin's own `config.yaml`; absent files mean an empty config.
fn load_plugin_config(path: &Path) -> Result<serde_yaml::Value, PluginError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Plugin config not found, using empty config");
        return Ok(serde_yaml::Value::Null);
    }
    let raw = fs::read_to_string(path).map_err(|source| PluginError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|e| PluginError::Config(e.to_string()))
}
