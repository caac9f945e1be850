//! Shared session state.
//!
//! A [`Session`] holds the currently selected identity and the most recently
//! obtained token behind a single reader/writer lock. Ticket acquisition
//! never runs under the lock; callers acquire first and then
//! [`commit`](Session::commit), so readers are not blocked by slow backends.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::spn::ServicePrincipal;
use crate::store::Secret;

/// The token most recently committed to a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionToken {
    /// The identity the token was issued for.
    pub spn: ServicePrincipal,
    /// Base64 of the ticket bytes.
    pub encoded: Secret,
    /// Raw ticket length in bytes.
    pub len: usize,
    pub obtained_at: DateTime<Utc>,
}

/// `(currentIdentity, lastToken, lastTokenTimestamp)`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionRecord {
    pub identity: Option<ServicePrincipal>,
    pub display_name: Option<String>,
    pub token: Option<SessionToken>,
}

impl SessionRecord {
    /// Label for the selected identity: the display name if set.
    pub fn label(&self) -> Option<String> {
        match (&self.display_name, &self.identity) {
            (Some(name), _) if !name.is_empty() => Some(name.clone()),
            (_, Some(spn)) => Some(spn.to_string()),
            _ => None,
        }
    }
}

/// Session state shared by every caller.
#[derive(Debug, Default)]
pub struct Session {
    record: RwLock<SessionRecord>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current record.
    pub fn snapshot(&self) -> SessionRecord {
        self.record.read().clone()
    }

    pub fn identity(&self) -> Option<ServicePrincipal> {
        self.record.read().identity.clone()
    }

    /// The last committed token, encoded.
    pub fn token(&self) -> Option<Secret> {
        self.record.read().token.as_ref().map(|t| t.encoded.clone())
    }

    /// `Negotiate <token>`, ready for an `Authorization` header.
    pub fn authorization_header(&self) -> Option<Secret> {
        self.record
            .read()
            .token
            .as_ref()
            .map(|t| Secret::new(format!("Negotiate {}", t.encoded.expose())))
    }

    /// Select `spn`. The previous token stays until replaced or cleared.
    pub fn select(&self, spn: ServicePrincipal, display_name: Option<String>) {
        let mut record = self.record.write();
        record.identity = Some(spn);
        record.display_name = display_name;
    }

    /// Record a freshly acquired token. Last writer wins.
    pub fn commit(&self, token: SessionToken) {
        let mut record = self.record.write();
        if record.identity.as_ref() != Some(&token.spn) {
            record.identity = Some(token.spn.clone());
            record.display_name = None;
        }
        record.token = Some(token);
    }

    /// Drop the stored token if it was issued for `spn`.
    ///
    /// Returns whether a token was removed.
    pub fn clear_token_for(&self, spn: &ServicePrincipal) -> bool {
        let mut record = self.record.write();
        if record.token.as_ref().is_some_and(|t| &t.spn == spn) {
            record.token = None;
            true
        } else {
            false
        }
    }
}
