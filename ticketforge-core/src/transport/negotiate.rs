//! Mechanism negotiation with fallback.
//!
//! A context is first initialized under SPNEGO. If that attempt ends in a
//! definite failure (neither complete nor continue-needed), the caller releases
//! the partial context and one more attempt is made directly under Kerberos V5.
//! Each attempt reports an [`AttemptOutcome`]; [`negotiate`] walks the sequence
//! and turns the outcomes into a token or a [`TicketError`].

use std::fmt;

use super::TicketError;

/// A GSS mechanism a context can be initialized under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// SPNEGO, 1.3.6.1.5.5.2
    Spnego,
    /// Kerberos V5, 1.2.840.113554.1.2.2
    Krb5,
}

impl Mechanism {
    /// Attempt order: broad wrapper first, then the narrow mechanism.
    pub const FALLBACK_ORDER: [Mechanism; 2] = [Mechanism::Spnego, Mechanism::Krb5];

    /// DER-encoded OID body (no tag or length).
    pub fn oid_der(self) -> &'static [u8] {
        match self {
            Self::Spnego => &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02],
            Self::Krb5 => &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02],
        }
    }

    /// OID arcs, as yasna expects them.
    pub fn oid_arcs(self) -> &'static [u64] {
        match self {
            Self::Spnego => &[1, 3, 6, 1, 5, 5, 2],
            Self::Krb5 => &[1, 2, 840, 113554, 1, 2, 2],
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spnego => f.write_str("SPNEGO"),
            Self::Krb5 => f.write_str("Kerberos V5"),
        }
    }
}

/// What one context-initialization attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The context is fully established.
    Complete(Vec<u8>),
    /// The first leg succeeded; the peer is expected to answer.
    ContinueNeeded(Vec<u8>),
    /// The mechanism refused. The string is the backend's description.
    Failed(String),
}

/// A successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub mechanism: Mechanism,
    pub token: Vec<u8>,
    pub complete: bool,
}

/// Run the fallback sequence.
///
/// `attempt` is called with each mechanism in [`Mechanism::FALLBACK_ORDER`]
/// until one yields a token. It must release whatever context it created before
/// returning a failure; the next attempt starts from a fresh context.
///
/// A zero-length token on a complete or continue-needed result is
/// [`TicketError::EmptyToken`] and stops the sequence.
pub fn negotiate<F>(debug: bool, mut attempt: F) -> Result<Negotiated, TicketError>
where
    F: FnMut(Mechanism) -> AttemptOutcome,
{
    let mut failures = Vec::with_capacity(Mechanism::FALLBACK_ORDER.len());

    for mechanism in Mechanism::FALLBACK_ORDER {
        let (token, complete) = match attempt(mechanism) {
            AttemptOutcome::Complete(token) => (token, true),
            AttemptOutcome::ContinueNeeded(token) => (token, false),
            AttemptOutcome::Failed(reason) => {
                if debug {
                    tracing::debug!(%mechanism, %reason, "context initialization failed");
                }
                failures.push(format!("{}: {}", mechanism, reason));
                continue;
            }
        };

        if token.is_empty() {
            return Err(TicketError::EmptyToken);
        }
        if debug {
            tracing::debug!(%mechanism, complete, len = token.len(), "context initialized");
        }
        return Ok(Negotiated {
            mechanism,
            token,
            complete,
        });
    }

    Err(TicketError::Negotiation {
        message: failures.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spnego_success_skips_fallback() {
        let mut tried = Vec::new();
        let result = negotiate(false, |mech| {
            tried.push(mech);
            AttemptOutcome::ContinueNeeded(vec![1, 2, 3])
        })
        .unwrap();

        assert_eq!(tried, vec![Mechanism::Spnego]);
        assert_eq!(result.mechanism, Mechanism::Spnego);
        assert!(!result.complete);
    }

    #[test]
    fn test_falls_back_to_krb5() {
        let mut tried = Vec::new();
        let result = negotiate(true, |mech| {
            tried.push(mech);
            match mech {
                Mechanism::Spnego => AttemptOutcome::Failed("bad mech".into()),
                Mechanism::Krb5 => AttemptOutcome::Complete(vec![9]),
            }
        })
        .unwrap();

        assert_eq!(tried, vec![Mechanism::Spnego, Mechanism::Krb5]);
        assert_eq!(result.mechanism, Mechanism::Krb5);
        assert_eq!(result.token, vec![9]);
        assert!(result.complete);
    }

    #[test]
    fn test_both_failing_is_negotiation_error() {
        let err = negotiate(false, |mech| AttemptOutcome::Failed(format!("{mech} refused")))
            .unwrap_err();
        match err {
            TicketError::Negotiation { message } => {
                assert!(message.contains("SPNEGO"));
                assert!(message.contains("Kerberos V5"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_complete_token_is_error() {
        let mut calls = 0;
        let err = negotiate(false, |_| {
            calls += 1;
            AttemptOutcome::Complete(Vec::new())
        })
        .unwrap_err();
        assert!(matches!(err, TicketError::EmptyToken));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_oid_encodings_agree() {
        for mech in Mechanism::FALLBACK_ORDER {
            let der = yasna::construct_der(|w| {
                w.write_oid(&yasna::models::ObjectIdentifier::from_slice(mech.oid_arcs()))
            });
            assert_eq!(&der[2..], mech.oid_der());
        }
    }
}
