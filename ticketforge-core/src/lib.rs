//! # Ticketforge Core
//!
//! Core library for acquiring Kerberos service tickets for HTTP `Negotiate`
//! authentication.
//!
//! This crate provides:
//! - Service principal parsing and normalization
//! - A blocking [`TicketTransport`] capability with one backend per platform
//!   (GSS.framework on macOS, SSPI on Windows, a pure-Rust client on Linux)
//! - An expiring [`TokenCache`] with a background sweeper
//! - Shared [`Session`] state and the [`TicketBroker`] that drives both
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ticketforge_core::{BrokerSettings, CachePolicy, ServicePrincipal, TicketBroker, TokenCache};
//!
//! async fn header(spn: &str) -> Result<String, ticketforge_core::TicketforgeError> {
//!     let broker = TicketBroker::native(TokenCache::new(), BrokerSettings::default());
//!     let spn = ServicePrincipal::parse(spn)?;
//!     let ticket = broker.ticket(&spn, CachePolicy::PreferCached).await?;
//!     Ok(ticket.authorization_header().expose().to_string())
//! }
//! ```

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod spn;
pub mod store;
pub mod transport;

// Re-export commonly used types at crate root
pub use spn::{
    ServicePrincipal,
    SpnError,
    SpnForm,
};

pub use store::{
    Secret,
    SecretBytes,
};

pub use transport::{
    ConnectedTransport,
    Platform,
    PlatformFactory,
    PlatformTransport,
    ServiceTicket,
    TicketError,
    TicketTransport,
    TransportFactory,
    TransportSettings,
};

pub use cache::{
    Namespace,
    TokenCache,
};

pub use session::{
    Session,
    SessionRecord,
    SessionToken,
};

pub use broker::{
    BrokerSettings,
    CachePolicy,
    IssuedTicket,
    TicketBroker,
    TransportStatus,
};

pub use config::{
    ConfigError,
    NamedSpn,
    SpnEntry,
    TicketforgeConfig,
};

pub use error::TicketforgeError;
