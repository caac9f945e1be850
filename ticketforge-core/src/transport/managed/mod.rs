//! Managed-protocol backend.
//!
//! A self-contained Kerberos client that needs no system GSS library. It
//! reads the user's file credential cache and krb5.conf, talks to the KDC
//! over TCP for service tickets, and emits a SPNEGO-wrapped AP-REQ.
//!
//! This module provides:
//! - [`ManagedTransport`] - The [`TicketTransport`] implementation
//! - [`EnvOverrides`] - `KRB5CCNAME` / `KRB5_CONFIG` captured once
//! - The protocol pieces it is built from, in submodules

pub mod ccache;
pub mod client;
pub mod crypto;
pub mod kdc;
pub mod krb5conf;
pub mod messages;
pub mod spnego;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;

use self::ccache::CCache;
use self::client::SpnegoClient;
use self::kdc::{KdcExchange, TcpKdc};
use self::krb5conf::Krb5Config;
use super::{ServiceTicket, TicketError, TicketTransport};
use crate::spn::ServicePrincipal;

/// Environment-provided locations, read once so a transport never consults
/// the process environment mid-request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `KRB5CCNAME`
    pub ccache: Option<String>,
    /// `KRB5_CONFIG`
    pub krb5_config: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            ccache: std::env::var("KRB5CCNAME").ok(),
            krb5_config: std::env::var("KRB5_CONFIG").ok(),
        }
    }
}

/// Ticket transport backed by a file credential cache and a direct KDC
/// connection.
#[derive(Debug)]
pub struct ManagedTransport<K: KdcExchange + Clone = TcpKdc> {
    debug: bool,
    ccache_override: Option<PathBuf>,
    krb5_override: Option<PathBuf>,
    env: EnvOverrides,
    kdc: K,
    connected: Option<Connected<K>>,
}

#[derive(Debug)]
struct Connected<K: KdcExchange> {
    ccache_path: PathBuf,
    client: SpnegoClient<K>,
}

impl ManagedTransport<TcpKdc> {
    pub fn new() -> Self {
        Self::with_kdc(TcpKdc::default(), EnvOverrides::from_env())
    }
}

impl Default for ManagedTransport<TcpKdc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KdcExchange + Clone> ManagedTransport<K> {
    pub fn with_kdc(kdc: K, env: EnvOverrides) -> Self {
        Self {
            debug: false,
            ccache_override: None,
            krb5_override: None,
            env,
            kdc,
            connected: None,
        }
    }

    fn resolve_ccache(&self) -> Result<PathBuf, ccache::CcacheError> {
        ccache::resolve_path(self.ccache_override.as_deref(), self.env.ccache.as_deref())
    }

    fn resolve_krb5_config(&self) -> PathBuf {
        krb5conf::resolve_path(
            self.krb5_override.as_deref(),
            self.env.krb5_config.as_deref(),
        )
    }

    fn load(&self) -> Result<Connected<K>, TicketError> {
        let ccache_path = self.resolve_ccache().map_err(connection)?;
        let cache = CCache::load(&ccache_path).map_err(connection)?;
        let config = Krb5Config::load(&self.resolve_krb5_config()).map_err(connection)?;

        if self.debug {
            tracing::debug!(
                ccache = %ccache_path.display(),
                principal = %cache.default_principal,
                credentials = cache.credentials.len(),
                "credential cache loaded"
            );
        }

        let mut client = SpnegoClient::new(cache, config, self.kdc.clone());
        client.set_debug(self.debug);
        Ok(Connected {
            ccache_path,
            client,
        })
    }
}

fn connection(e: impl std::fmt::Display) -> TicketError {
    TicketError::Connection {
        message: e.to_string(),
    }
}

impl<K: KdcExchange + Clone> TicketTransport for ManagedTransport<K> {
    fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
        if let Some(connected) = self.connected.as_mut() {
            connected.client.set_debug(enabled);
        }
    }

    fn set_ccache_path(&mut self, path: Option<PathBuf>) {
        self.ccache_override = path;
    }

    fn set_krb5_config(&mut self, path: Option<PathBuf>) {
        self.krb5_override = path;
    }

    fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        if let Some(timeout) = timeout {
            self.kdc.set_timeout(timeout);
        }
    }

    fn connect(&mut self) -> Result<(), TicketError> {
        self.connected = Some(self.load()?);
        Ok(())
    }

    fn close(&mut self) {
        if self.connected.take().is_some() && self.debug {
            tracing::debug!("managed transport closed");
        }
    }

    fn get_service_ticket(&mut self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        let connected = self.connected.as_mut().ok_or(TicketError::NotConnected)?;
        let client = &mut connected.client;

        let now = Utc::now();
        client.acquire_credential(now)?;
        let token = client.init_sec_context(spn, now)?;
        let bytes = client.marshal(&token);
        if bytes.is_empty() {
            return Err(TicketError::EmptyToken);
        }
        Ok(ServiceTicket::new(bytes))
    }

    fn default_principal(&self) -> Result<String, TicketError> {
        match &self.connected {
            Some(connected) => Ok(connected.client.default_principal().to_string()),
            None => Err(TicketError::NotConnected),
        }
    }

    fn cache_location(&self) -> String {
        match &self.connected {
            Some(connected) => display(&connected.ccache_path),
            None => self
                .resolve_ccache()
                .map(|p| display(&p))
                .unwrap_or_else(|e| e.to_string()),
        }
    }
}

fn display(path: &Path) -> String {
    format!("FILE:{}", path.display())
}
