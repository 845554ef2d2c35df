use paylock::{Actuator, LockStateMachine, NotificationGate, PagBankVerifier};

pub type Gate = NotificationGate<PagBankVerifier, Actuator>;

/// Shared application state for the webhook server.
pub struct AppState {
    pub gate: Gate,
    pub simulation_mode: bool,
    /// Bearer token for /metrics.
    pub metrics_token: Option<Vec<u8>>,
    /// Serve /metrics without a token when no token is configured.
    pub public_metrics: bool,
    /// Bearer token for POST /lock/close. The endpoint is disabled without it.
    pub admin_token: Option<Vec<u8>>,
}

impl AppState {
    pub fn machine(&self) -> &LockStateMachine<Actuator> {
        self.gate.machine()
    }
}
