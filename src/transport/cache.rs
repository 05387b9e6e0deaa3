//! Content-addressed cache of built upstream transports.
//!
//! # Responsibilities
//! - Derive a stable fingerprint from an effective transport config
//! - Build hyper clients (connection pool, HTTP/2, mTLS material) on demand
//! - Publish exactly one client per fingerprint under concurrent lookups
//!
//! # Design Decisions
//! - The fingerprint hashes a canonical serialisation (fixed field order,
//!   absolute TLS paths), never in-memory layout, so it is stable across
//!   reloads and processes
//! - `clear` is the reload hook: snapshots swap, pools rebuild lazily

use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use dashmap::DashMap;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sha2::{Digest, Sha256};

use crate::config::schema::HttpTransportConfig;

/// The built transport: a pooled hyper client with the route's TLS setup.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, axum::body::Body>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to read TLS material '{path}': {source}")]
    ReadTls {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid TLS material '{path}': {reason}")]
    InvalidTls { path: String, reason: String },
}

/// Thread-safe map from config fingerprint to built client.
#[derive(Default)]
pub struct TransportCache {
    transports: DashMap<String, UpstreamClient>,
}

impl TransportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the client for `config`, building and publishing it if
    /// absent. Concurrent builders may race; exactly one result is
    /// published and every caller receives it.
    pub fn get_or_build(
        &self,
        config: &HttpTransportConfig,
    ) -> Result<UpstreamClient, TransportError> {
        let key = fingerprint(config);

        if let Some(existing) = self.transports.get(&key) {
            return Ok(existing.clone());
        }

        let built = build_client(config)?;
        let entry = self.transports.entry(key).or_insert(built);
        Ok(entry.clone())
    }

    /// Drop the entry for `config`; the next lookup rebuilds it.
    pub fn invalidate(&self, config: &HttpTransportConfig) {
        self.transports.remove(&fingerprint(config));
    }

    /// Drop every entry. Called when a new snapshot is published.
    pub fn clear(&self) {
        self.transports.clear();
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

/// Stable digest of the effective transport settings.
pub fn fingerprint(config: &HttpTransportConfig) -> String {
    let normalized = normalize(config);
    let bytes = serde_json::to_vec(&normalized)
        .expect("transport config serialises to JSON");
    hex::encode(Sha256::digest(&bytes))
}

/// Normalise path fields to absolute form so the digest does not depend on
/// the working directory the config was loaded from.
fn normalize(config: &HttpTransportConfig) -> HttpTransportConfig {
    let mut normalized = config.clone();
    for path in [
        &mut normalized.cert_file,
        &mut normalized.key_file,
        &mut normalized.ca_file,
    ] {
        if !path.is_empty() {
            if let Ok(abs) = std::path::absolute(path.as_str()) {
                *path = abs.display().to_string();
            }
        }
    }
    normalized
}

fn build_client(config: &HttpTransportConfig) -> Result<UpstreamClient, TransportError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    if config.dial_timeout_secs > 0 {
        http.set_connect_timeout(Some(Duration::from_secs(config.dial_timeout_secs)));
    }
    if config.keep_alive_secs > 0 {
        http.set_keepalive(Some(Duration::from_secs(config.keep_alive_secs)));
    }

    let tls = build_tls_config(config)?;
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_timer(hyper_util::rt::TokioTimer::new());
    if config.idle_conn_timeout_secs > 0 {
        builder.pool_idle_timeout(Duration::from_secs(config.idle_conn_timeout_secs));
    }
    if config.max_idle_conns_per_host > 0 {
        builder.pool_max_idle_per_host(config.max_idle_conns_per_host);
    }
    if config.force_http2 {
        builder.http2_only(true);
    }

    Ok(builder.build(https))
}

fn build_tls_config(config: &HttpTransportConfig) -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    if config.ca_file.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        let file = File::open(&config.ca_file).map_err(|source| TransportError::ReadTls {
            path: config.ca_file.clone(),
            source,
        })?;
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
        let certs = certs.map_err(|source| TransportError::ReadTls {
            path: config.ca_file.clone(),
            source,
        })?;
        for cert in certs {
            roots.add(cert).map_err(|e| TransportError::InvalidTls {
                path: config.ca_file.clone(),
                reason: e.to_string(),
            })?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    if !config.cert_file.is_empty() && !config.key_file.is_empty() {
        let cert_file = File::open(&config.cert_file).map_err(|source| TransportError::ReadTls {
            path: config.cert_file.clone(),
            source,
        })?;
        let certs: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect();
        let certs = certs.map_err(|source| TransportError::ReadTls {
            path: config.cert_file.clone(),
            source,
        })?;

        let key_file = File::open(&config.key_file).map_err(|source| TransportError::ReadTls {
            path: config.key_file.clone(),
            source,
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|source| TransportError::ReadTls {
                path: config.key_file.clone(),
                source,
            })?
            .ok_or_else(|| TransportError::InvalidTls {
                path: config.key_file.clone(),
                reason: "no private key found".to_string(),
            })?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::InvalidTls {
                path: config.cert_file.clone(),
                reason: e.to_string(),
            })
    } else {
        Ok(builder.with_no_client_auth())
    }
}
