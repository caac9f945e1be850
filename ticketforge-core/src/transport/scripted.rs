//! In-memory transport that replays configured outcomes.
//!
//! [`ScriptedTransport`] stands in for a native backend in tests and dry runs.
//! Every instance created from the same [`Script`] shares its plan and its
//! counters, so a test can hand a [`ScriptedFactory`] to the broker and then
//! inspect how many transports were connected, used and closed.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ServiceTicket, TicketError, TicketTransport, TransportFactory};
use crate::spn::ServicePrincipal;

/// Outcome of a scripted `connect`.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(TicketError),
}

#[derive(Debug)]
struct ScriptState {
    connect: Mutex<Step>,
    queued: Mutex<VecDeque<Result<Bytes, TicketError>>>,
    fallback: Mutex<Result<Bytes, TicketError>>,
    delay: Mutex<Option<Duration>>,
    principal: Mutex<String>,
    requested: Mutex<Vec<String>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    releases: AtomicUsize,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            connect: Mutex::new(Step::Succeed),
            queued: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Err(TicketError::Negotiation {
                message: "no scripted ticket".to_string(),
            })),
            delay: Mutex::new(None),
            principal: Mutex::new("user@EXAMPLE.COM".to_string()),
            requested: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }
}

/// Shared plan and counters for scripted transports.
#[derive(Debug, Clone, Default)]
pub struct Script {
    state: Arc<ScriptState>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how `connect` behaves from now on.
    pub fn set_connect(&self, step: Step) {
        *self.state.connect.lock() = step;
    }

    /// Answer every ticket request with `token` once the queue is empty.
    pub fn set_ticket(&self, token: impl Into<Bytes>) {
        *self.state.fallback.lock() = Ok(token.into());
    }

    /// Fail every ticket request with `error` once the queue is empty.
    pub fn set_ticket_error(&self, error: TicketError) {
        *self.state.fallback.lock() = Err(error);
    }

    /// Queue a one-shot outcome, consumed before the standing answer.
    pub fn push_outcome(&self, outcome: Result<Bytes, TicketError>) {
        self.state.queued.lock().push_back(outcome);
    }

    /// Block inside `get_service_ticket` for `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock() = delay;
    }

    pub fn set_principal(&self, principal: impl Into<String>) {
        *self.state.principal.lock() = principal.into();
    }

    /// Number of `connect` calls.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of `close` calls, including redundant ones.
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Number of credential handles actually released.
    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    /// Number of ticket requests that reached the backend.
    pub fn ticket_requests(&self) -> usize {
        self.state.requested.lock().len()
    }

    /// Identities requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.state.requested.lock().clone()
    }

    fn next_outcome(&self) -> Result<Bytes, TicketError> {
        if let Some(outcome) = self.state.queued.lock().pop_front() {
            return outcome;
        }
        self.state.fallback.lock().clone()
    }
}

/// A transport whose behavior is driven by a [`Script`].
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Script,
    connected: bool,
    debug: bool,
    ccache_path: Option<PathBuf>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Builder form of [`Script::set_ticket`].
    pub fn with_ticket(self, token: impl Into<Bytes>) -> Self {
        self.script.set_ticket(token);
        self
    }

    /// Builder form of [`Script::set_connect`].
    pub fn with_connect(self, step: Step) -> Self {
        self.script.set_connect(step);
        self
    }

    /// Handle for inspecting and steering this transport after it is moved.
    pub fn handle(&self) -> Script {
        self.script.clone()
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}

impl TicketTransport for ScriptedTransport {
    fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    fn set_ccache_path(&mut self, path: Option<PathBuf>) {
        self.ccache_path = path;
    }

    fn connect(&mut self) -> Result<(), TicketError> {
        self.script.state.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.script.state.connect.lock().clone();
        match step {
            Step::Succeed => {
                self.connected = true;
                Ok(())
            }
            Step::Fail(e) => Err(e),
        }
    }

    fn close(&mut self) {
        self.script.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.connected {
            self.connected = false;
            self.script.state.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn get_service_ticket(&mut self, spn: &ServicePrincipal) -> Result<ServiceTicket, TicketError> {
        if !self.connected {
            return Err(TicketError::NotConnected);
        }
        self.script.state.requested.lock().push(spn.as_str().to_string());

        let delay = *self.script.state.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let token = self.script.next_outcome()?;
        if token.is_empty() {
            return Err(TicketError::EmptyToken);
        }
        if self.debug {
            tracing::debug!(spn = %spn, len = token.len(), "scripted ticket issued");
        }
        Ok(ServiceTicket::new(token))
    }

    fn default_principal(&self) -> Result<String, TicketError> {
        if !self.connected {
            return Err(TicketError::NotConnected);
        }
        Ok(self.script.state.principal.lock().clone())
    }

    fn cache_location(&self) -> String {
        self.ccache_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "scripted".to_string())
    }
}

/// Factory producing [`ScriptedTransport`]s that share one [`Script`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    script: Script,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self { script }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }
}

impl TransportFactory for ScriptedFactory {
    type Transport = ScriptedTransport;

    fn create(&self) -> Self::Transport {
        ScriptedTransport::with_script(self.script.clone())
    }
}
