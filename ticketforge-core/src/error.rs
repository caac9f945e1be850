//! Top-level error types for Ticketforge.

use thiserror::Error;

use crate::config::ConfigError;
use crate::spn::SpnError;
use crate::transport::TicketError;

/// Top-level error type encompassing all Ticketforge errors.
#[derive(Debug, Error)]
pub enum TicketforgeError {
    /// A malformed service identity.
    #[error("invalid service principal: {0}")]
    Spn(#[from] SpnError),

    /// Error from a ticket transport.
    #[error("ticket error: {0}")]
    Ticket(#[from] TicketError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A refresh was requested before any identity was selected.
    #[error("no service principal selected")]
    NoIdentitySelected,
}

impl TicketforgeError {
    /// The transport error behind this one, if any.
    pub fn ticket_error(&self) -> Option<&TicketError> {
        match self {
            Self::Ticket(e) => Some(e),
            _ => None,
        }
    }
}
