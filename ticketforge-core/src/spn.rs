//! Service principal names.
//!
//! This module provides:
//! - [`ServicePrincipal`] - A validated target service identity
//! - [`SpnForm`] - Which separator the identity was written with
//! - [`SpnError`] - Rejection reasons for malformed identities
//!
//! Identities are accepted in two spellings:
//!
//! - `service/host` (optionally `service/host@REALM`), the Kerberos form
//! - `service@host`, the GSS host-based service form
//!
//! The original string is always kept for display and diagnostics. Backends ask
//! for the spelling they need through [`ServicePrincipal::host_based`] or
//! [`ServicePrincipal::service`] / [`ServicePrincipal::host`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a service principal name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpnError {
    /// The identity has neither a `/` nor an `@` separator.
    #[error("invalid SPN format: {spn} (expected service/hostname or service@hostname)")]
    MissingSeparator { spn: String },

    /// The service or host part is empty.
    #[error("invalid SPN format: {spn} (service and host must not be empty)")]
    EmptyComponent { spn: String },

    /// More separators than the form allows.
    #[error("invalid SPN format: {spn} (unexpected extra separator)")]
    ExtraSeparator { spn: String },
}

impl SpnError {
    /// The identity that was rejected, as written by the caller.
    pub fn spn(&self) -> &str {
        match self {
            Self::MissingSeparator { spn }
            | Self::EmptyComponent { spn }
            | Self::ExtraSeparator { spn } => spn,
        }
    }
}

/// The separator an identity was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpnForm {
    /// `service/host[@REALM]`
    Slash,
    /// `service@host`
    At,
}

/// A validated service principal identity.
///
/// # Examples
///
/// ```
/// use ticketforge_core::ServicePrincipal;
///
/// let spn: ServicePrincipal = "HTTP/svc.example.com".parse().unwrap();
/// assert_eq!(spn.service(), "HTTP");
/// assert_eq!(spn.host(), "svc.example.com");
/// assert_eq!(spn.host_based(), "HTTP@svc.example.com");
/// assert_eq!(spn.as_str(), "HTTP/svc.example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServicePrincipal {
    original: String,
    form: SpnForm,
    service: String,
    host: String,
    realm: Option<String>,
}

impl ServicePrincipal {
    /// Parse and validate an identity.
    ///
    /// Surrounding whitespace is trimmed; everything else is kept verbatim.
    pub fn parse(input: &str) -> Result<Self, SpnError> {
        let original = input.trim().to_string();

        if let Some((service, rest)) = original.split_once('/') {
            if rest.contains('/') {
                return Err(SpnError::ExtraSeparator { spn: original });
            }
            let (host, realm) = match rest.split_once('@') {
                Some((host, realm)) => {
                    if realm.is_empty() {
                        return Err(SpnError::EmptyComponent { spn: original });
                    }
                    if realm.contains('@') {
                        return Err(SpnError::ExtraSeparator { spn: original });
                    }
                    (host, Some(realm.to_string()))
                }
                None => (rest, None),
            };
            if service.is_empty() || host.is_empty() {
                return Err(SpnError::EmptyComponent { spn: original });
            }
            return Ok(Self {
                service: service.to_string(),
                host: host.to_string(),
                realm,
                form: SpnForm::Slash,
                original,
            });
        }

        if let Some((service, host)) = original.split_once('@') {
            if host.contains('@') {
                return Err(SpnError::ExtraSeparator { spn: original });
            }
            if service.is_empty() || host.is_empty() {
                return Err(SpnError::EmptyComponent { spn: original });
            }
            return Ok(Self {
                service: service.to_string(),
                host: host.to_string(),
                realm: None,
                form: SpnForm::At,
                original,
            });
        }

        Err(SpnError::MissingSeparator { spn: original })
    }

    /// The identity as passed to [`parse`](Self::parse), minus surrounding
    /// whitespace. Cache keys and display use this text.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Which separator the identity used.
    pub fn form(&self) -> SpnForm {
        self.form
    }

    /// The service component (e.g. `HTTP`).
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The host component, without any realm suffix.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The realm suffix, when one was given in slash form.
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    /// The `service@host` spelling used for GSS host-based name import.
    ///
    /// For slash form this is the text before the first `/`, an `@`, and
    /// everything after it. At-form identities are returned unchanged.
    pub fn host_based(&self) -> String {
        match self.form {
            SpnForm::At => self.original.clone(),
            SpnForm::Slash => match self.original.split_once('/') {
                Some((prefix, suffix)) => format!("{}@{}", prefix, suffix),
                None => self.original.clone(),
            },
        }
    }

    /// The `service/host` spelling, without realm.
    pub fn slash_form(&self) -> String {
        format!("{}/{}", self.service, self.host)
    }

    /// The `service/host[@REALM]` spelling used as an SSPI target name.
    ///
    /// A realm suffix is kept so the KDC of that realm is asked.
    pub fn target_name(&self) -> String {
        match &self.realm {
            Some(realm) => format!("{}/{}@{}", self.service, self.host, realm),
            None => self.slash_form(),
        }
    }
}

impl fmt::Display for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl FromStr for ServicePrincipal {
    type Err = SpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServicePrincipal {
    type Error = SpnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServicePrincipal> for String {
    fn from(spn: ServicePrincipal) -> Self {
        spn.original
    }
}
