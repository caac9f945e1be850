//! No-op transport for platforms without a credential backend.

use std::path::PathBuf;

use super::{ServiceTicket, TicketError, TicketTransport};
use crate::spn::ServicePrincipal;

/// Every operation fails with [`TicketError::UnsupportedPlatform`]; `close` does nothing.
#[derive(Debug, Clone)]
pub struct UnsupportedTransport {
    platform: String,
}

impl UnsupportedTransport {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }

    fn error(&self) -> TicketError {
        TicketError::UnsupportedPlatform {
            platform: self.platform.clone(),
        }
    }
}

impl Default for UnsupportedTransport {
    fn default() -> Self {
        Self::new(std::env::consts::OS)
    }
}

impl TicketTransport for UnsupportedTransport {
    fn set_debug(&mut self, _enabled: bool) {}

    fn set_ccache_path(&mut self, _path: Option<PathBuf>) {}

    fn connect(&mut self) -> Result<(), TicketError> {
        Err(self.error())
    }

    fn close(&mut self) {}

    fn get_service_ticket(&mut self, _spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        Err(self.error())
    }

    fn default_principal(&self) -> Result<String, TicketError> {
        Err(self.error())
    }

    fn cache_location(&self) -> String {
        "none".to_string()
    }
}
