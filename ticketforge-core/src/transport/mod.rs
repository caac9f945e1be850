//! Service ticket transports.
//!
//! This module provides:
//! - [`TicketTransport`] - The capability every credential backend implements
//! - [`ServiceTicket`] - The opaque negotiation token a backend produces
//! - [`TicketError`] - The shared error taxonomy
//! - [`TransportSettings`] - Debug flag and path overrides applied before `connect`
//! - [`ConnectedTransport`] - Scoped guard that closes a transport on every exit path
//! - [`Platform`] - Host platform detection
//! - [`PlatformTransport`] - The backend selected for this build target
//!
//! # Backends
//!
//! | Target   | Backend                                   |
//! |----------|-------------------------------------------|
//! | macOS    | [`gss::GssTransport`] (GSS.framework)     |
//! | Windows  | [`sspi::SspiTransport`] (SSPI Negotiate)  |
//! | Linux    | [`managed::ManagedTransport`] (ccache + KDC) |
//! | other    | [`unsupported::UnsupportedTransport`]     |
//!
//! The choice is made at compile time; there is no runtime dispatch.
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! use ticketforge_core::transport::{ConnectedTransport, PlatformTransport, TicketTransport};
//!
//! let transport = PlatformTransport::default();
//! let mut connected = ConnectedTransport::connect(transport)?;
//! let ticket = connected.ticket_for("HTTP/svc.example.com")?;
//! // `close` runs when `connected` is dropped
//! ```

pub mod managed;
pub mod negotiate;
pub mod scripted;
pub mod unsupported;

#[cfg(target_os = "macos")]
pub mod gss;

#[cfg(windows)]
pub mod sspi;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::spn::{ServicePrincipal, SpnError};

/// Error type for ticket acquisition.
///
/// Every variant names the step that failed. Nothing is retried internally.
#[derive(Debug, Clone, Error)]
pub enum TicketError {
    /// No usable local credential (no session, empty or missing cache, service unreachable).
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The initiator credential could not be acquired.
    #[error("credential acquisition failed: {message}")]
    Acquisition { message: String },

    /// The target name could not be imported.
    #[error("name import failed for {spn}: {message}")]
    NameImport { spn: String, message: String },

    /// Context initialization failed under every mechanism tried.
    #[error("negotiation failed: {message}")]
    Negotiation { message: String },

    /// The backend reported success but produced no token.
    #[error("negotiation produced an empty token")]
    EmptyToken,

    /// The identity is not `service/host` or `service@host`.
    #[error(transparent)]
    InvalidSpnFormat(#[from] SpnError),

    /// No backend exists for this platform.
    #[error("unsupported platform: {platform}")]
    UnsupportedPlatform { platform: String },

    /// A ticket was requested before a successful `connect`.
    #[error("not connected")]
    NotConnected,

    /// The backend did not answer within the configured bound.
    #[error("ticket acquisition timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// The blocking worker running the backend failed.
    #[error("acquisition worker failed: {message}")]
    Worker { message: String },
}

impl TicketError {
    /// Whether retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedPlatform { .. } | Self::InvalidSpnFormat(_)
        )
    }

    /// Whether the failure means no local credential was usable.
    pub fn is_missing_credential(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Acquisition { .. })
    }
}

/// An opaque negotiation token.
///
/// The bytes are never printed; `Debug` shows only the length.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceTicket(Bytes);

impl ServiceTicket {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Standard base64, as used in an `Authorization: Negotiate` header.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }
}

impl std::fmt::Debug for ServiceTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceTicket([REDACTED; {} bytes])", self.0.len())
    }
}

/// Options applied to a transport before it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Emit step-by-step diagnostics.
    pub debug: bool,
    /// Credential cache override. Ignored by backends that manage their own cache.
    pub ccache_path: Option<PathBuf>,
    /// Realm configuration override. Only the managed backend reads it.
    pub krb5_config: Option<PathBuf>,
    /// Socket timeout for KDC traffic. Only the managed backend uses it.
    pub kdc_timeout: Option<Duration>,
}

/// A credential backend able to produce service tickets.
///
/// One instance owns at most one credential handle. Call [`connect`](Self::connect)
/// once, request any number of tickets, then [`close`](Self::close). All calls
/// block; run them off any path that must stay responsive.
pub trait TicketTransport: Send + 'static {
    /// Toggle diagnostic verbosity. No functional effect.
    fn set_debug(&mut self, enabled: bool);

    /// Advisory credential cache override.
    fn set_ccache_path(&mut self, path: Option<PathBuf>);

    /// Advisory realm configuration override.
    fn set_krb5_config(&mut self, _path: Option<PathBuf>) {}

    /// Socket timeout for network traffic the backend performs itself.
    fn set_network_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Acquire the local credential handle.
    fn connect(&mut self) -> Result<(), TicketError>;

    /// Release the credential handle and any lingering context.
    ///
    /// Idempotent, and safe when `connect` failed or never ran.
    fn close(&mut self);

    /// Produce a negotiation token for `spn`.
    fn get_service_ticket(&mut self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError>;

    /// The client principal behind the local credential.
    fn default_principal(&self) -> Result<String, TicketError>;

    /// Where the backend reads credentials from.
    fn cache_location(&self) -> String;

    /// Apply all settings at once.
    fn configure(&mut self, settings: &TransportSettings) {
        self.set_debug(settings.debug);
        self.set_ccache_path(settings.ccache_path.clone());
        self.set_krb5_config(settings.krb5_config.clone());
        self.set_network_timeout(settings.kdc_timeout);
    }

    /// Validate `identity` and request a ticket for it.
    ///
    /// Malformed identities fail with [`TicketError::InvalidSpnFormat`] before
    /// the backend is touched.
    fn ticket_for(&mut self, identity: &str) -> Result<ServiceTicket, TicketError> {
        let spn = ServicePrincipal::parse(identity)?;
        self.get_service_ticket(&spn)
    }
}

/// Builds fresh transports, one per logical ticket-request session.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: TicketTransport;

    fn create(&self) -> Self::Transport;
}

/// Factory for the build target's native backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformFactory;

impl TransportFactory for PlatformFactory {
    type Transport = PlatformTransport;

    fn create(&self) -> Self::Transport {
        PlatformTransport::default()
    }
}

#[cfg(target_os = "macos")]
pub type PlatformTransport = gss::GssTransport;

#[cfg(windows)]
pub type PlatformTransport = sspi::SspiTransport;

#[cfg(target_os = "linux")]
pub type PlatformTransport = managed::ManagedTransport;

#[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
pub type PlatformTransport = unsupported::UnsupportedTransport;

/// A connected transport that closes itself when dropped.
///
/// If `connect` fails, `close` still runs before the error is returned.
#[derive(Debug)]
pub struct ConnectedTransport<T: TicketTransport> {
    inner: T,
}

impl<T: TicketTransport> ConnectedTransport<T> {
    pub fn connect(mut transport: T) -> Result<Self, TicketError> {
        if let Err(e) = transport.connect() {
            transport.close();
            return Err(e);
        }
        Ok(Self { inner: transport })
    }
}

impl<T: TicketTransport> Deref for ConnectedTransport<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: TicketTransport> DerefMut for ConnectedTransport<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: TicketTransport> Drop for ConnectedTransport<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// The host platform, as far as ticket acquisition is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Unsupported { os: String },
}

impl Platform {
    /// Detect the platform this binary runs on.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            "macos" if macos_framework_supported() => Self::MacOs,
            "macos" => Self::Unsupported {
                os: "macOS < 11".to_string(),
            },
            other => Self::Unsupported {
                os: other.to_string(),
            },
        }
    }

    /// Human readable label including the backend in use.
    pub fn label(&self) -> String {
        match self {
            Self::Linux => "Linux (managed client)".to_string(),
            Self::MacOs => "macOS (GSS API)".to_string(),
            Self::Windows => "Windows (SSPI)".to_string(),
            Self::Unsupported { os } => format!("{} (unsupported)", os),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported { .. })
    }
}

#[cfg(target_os = "macos")]
fn macos_framework_supported() -> bool {
    gss::framework_supported()
}

#[cfg(not(target_os = "macos"))]
fn macos_framework_supported() -> bool {
    false
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}
