//! Ticket acquisition flow.
//!
//! [`TicketBroker`] ties the pieces together: it checks the token cache,
//! builds a fresh transport from its factory on a miss, connects, requests
//! the ticket and closes, then stores the base64 result. Backend calls block,
//! so they run on tokio's blocking pool under an optional timeout.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Namespace, TokenCache};
use crate::error::TicketforgeError;
use crate::session::{Session, SessionToken};
use crate::spn::ServicePrincipal;
use crate::store::Secret;
use crate::transport::{
    ConnectedTransport, Platform, PlatformFactory, ServiceTicket, TicketError, TicketTransport,
    TransportFactory, TransportSettings,
};

/// How [`TicketBroker::ticket`] treats a cached token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Serve a live cached token when there is one.
    #[default]
    PreferCached,
    /// Always acquire, then overwrite the cache.
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub transport: TransportSettings,
    /// Lifetime of tokens stored in the cache.
    pub token_ttl: Duration,
    /// Give up waiting on a backend after this long.
    pub acquire_timeout: Option<Duration>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            token_ttl: Namespace::Token.default_ttl(),
            acquire_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// A ticket handed out by the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedTicket {
    pub spn: ServicePrincipal,
    /// Base64 of the negotiation token.
    pub encoded: Secret,
    /// Time left before the cache entry expires.
    pub expires_in: Duration,
    pub from_cache: bool,
}

impl IssuedTicket {
    /// `Negotiate <token>`
    pub fn authorization_header(&self) -> Secret {
        Secret::new(format!("Negotiate {}", self.encoded.expose()))
    }
}

/// What a transport reports about the local credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub platform: Platform,
    pub cache_location: String,
    /// The client principal, or why it could not be determined.
    pub principal: Result<String, String>,
}

/// Acquires tickets through transports made by `F`.
#[derive(Debug)]
pub struct TicketBroker<F: TransportFactory = PlatformFactory> {
    factory: Arc<F>,
    cache: TokenCache,
    settings: BrokerSettings,
    platform: Platform,
}

impl TicketBroker<PlatformFactory> {
    /// A broker for this platform's native backend.
    pub fn native(cache: TokenCache, settings: BrokerSettings) -> Self {
        Self::new(PlatformFactory, cache, settings)
    }
}

impl<F: TransportFactory> TicketBroker<F> {
    pub fn new(factory: F, cache: TokenCache, settings: BrokerSettings) -> Self {
        Self {
            factory: Arc::new(factory),
            cache,
            settings,
            platform: Platform::current(),
        }
    }

    /// Treat the host as `platform` when checking for backend support.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    fn ensure_supported(&self) -> Result<(), TicketError> {
        if self.platform.is_supported() {
            Ok(())
        } else {
            Err(TicketError::UnsupportedPlatform {
                platform: self.platform.label(),
            })
        }
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Connect, request and close on the calling thread.
    pub fn acquire_blocking(&self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        self.ensure_supported()?;
        acquire_with(self.factory.as_ref(), &self.settings.transport, spn)
    }

    /// [`acquire_blocking`](Self::acquire_blocking) on the blocking pool,
    /// bounded by the configured timeout.
    ///
    /// On timeout the worker thread is abandoned, not interrupted. An
    /// unsupported platform fails before any transport is created.
    pub async fn acquire(&self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        self.ensure_supported()?;
        let factory = self.factory.clone();
        let settings = self.settings.transport.clone();
        let target = spn.clone();
        let task = tokio::task::spawn_blocking(move || {
            acquire_with(factory.as_ref(), &settings, &target)
        });

        let joined = match self.settings.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| TicketError::Timeout { after: limit })?,
            None => task.await,
        };
        joined.map_err(|e| TicketError::Worker {
            message: e.to_string(),
        })?
    }

    /// A ticket for `spn`, from the cache when allowed.
    ///
    /// A failed acquisition evicts any cached token for `spn`.
    pub async fn ticket(
        &self,
        spn: &ServicePrincipal,
        policy: CachePolicy,
    ) -> Result<IssuedTicket, TicketError> {
        let key = Namespace::Token.key(spn.as_str());

        if policy == CachePolicy::PreferCached {
            if let Some((encoded, expires_in)) = self.cache.get_with_expiry(&key) {
                tracing::debug!(spn = %spn, "serving cached ticket");
                return Ok(IssuedTicket {
                    spn: spn.clone(),
                    encoded,
                    expires_in,
                    from_cache: true,
                });
            }
        }

        match self.acquire(spn).await {
            Ok(ticket) => {
                let encoded = Secret::new(ticket.to_base64());
                self.cache.set(key, encoded.clone(), self.settings.token_ttl);
                tracing::info!(spn = %spn, len = ticket.len(), "ticket acquired");
                Ok(IssuedTicket {
                    spn: spn.clone(),
                    encoded,
                    expires_in: self.settings.token_ttl,
                    from_cache: false,
                })
            }
            Err(e) => {
                self.cache.delete(&key);
                tracing::warn!(spn = %spn, error = %e, "ticket acquisition failed");
                Err(e)
            }
        }
    }

    /// Select `spn` in `session` and refresh it.
    pub async fn select(
        &self,
        session: &Session,
        spn: ServicePrincipal,
        display_name: Option<String>,
    ) -> Result<SessionToken, TicketforgeError> {
        session.select(spn, display_name);
        self.refresh(session).await
    }

    /// Acquire a ticket for the session's identity and commit it.
    ///
    /// The session lock is not held while the backend runs. On failure the
    /// cached token and the session token for that identity are dropped.
    pub async fn refresh(&self, session: &Session) -> Result<SessionToken, TicketforgeError> {
        let spn = session
            .identity()
            .ok_or(TicketforgeError::NoIdentitySelected)?;
        let key = Namespace::Token.key(spn.as_str());

        match self.acquire(&spn).await {
            Ok(ticket) => {
                let token = SessionToken {
                    spn,
                    encoded: Secret::new(ticket.to_base64()),
                    len: ticket.len(),
                    obtained_at: Utc::now(),
                };
                session.commit(token.clone());
                self.cache
                    .set(key, token.encoded.clone(), self.settings.token_ttl);
                tracing::info!(spn = %token.spn, len = token.len, "session token refreshed");
                Ok(token)
            }
            Err(e) => {
                self.cache.delete(&key);
                session.clear_token_for(&spn);
                tracing::warn!(spn = %spn, error = %e, "session refresh failed");
                Err(e.into())
            }
        }
    }

    /// Platform, credential cache and principal, as the backend sees them.
    pub async fn status(&self) -> Result<TransportStatus, TicketError> {
        let factory = self.factory.clone();
        let settings = self.settings.transport.clone();
        let platform = self.platform.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut transport = factory.create();
            transport.configure(&settings);
            let cache_location = transport.cache_location();
            let principal = ConnectedTransport::connect(transport)
                .and_then(|t| t.default_principal())
                .map_err(|e| e.to_string());
            TransportStatus {
                platform,
                cache_location,
                principal,
            }
        });

        let joined = match self.settings.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| TicketError::Timeout { after: limit })?,
            None => task.await,
        };
        joined.map_err(|e| TicketError::Worker {
            message: e.to_string(),
        })
    }
}

fn acquire_with<F: TransportFactory>(
    factory: &F,
    settings: &TransportSettings,
    spn: &ServicePrincipal,
) -> Result<ServiceTicket, TicketError> {
    let mut transport = factory.create();
    transport.configure(settings);

    let mut transport = ConnectedTransport::connect(transport)?;
    let ticket = transport.get_service_ticket(spn)?;
    if ticket.is_empty() {
        return Err(TicketError::EmptyToken);
    }
    Ok(ticket)
}
