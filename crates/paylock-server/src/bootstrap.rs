//! Wire the core components together from a [`ControllerConfig`].

use std::sync::Arc;
use std::time::Duration;

use paylock::dedup::spawn_purge_task;
use paylock::{
    Actuator, CredentialCache, GateConfig, InMemoryNotificationStore, LockStateMachine,
    NotificationGate, NotificationStore, PagBankVerifier, SimulatedActuator, TtlockActuator,
    TtlockTokenExchange, VendorCredentials,
};

use crate::config::ControllerConfig;
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Build the shared [`AppState`] and start the dedup purge task.
///
/// Must be called from within a Tokio runtime.
pub fn build_state(config: &ControllerConfig) -> Result<AppState, BootstrapError> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("paylock/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let actuator = match (&config.vendor, config.simulation_mode) {
        (Some(account), false) => {
            let exchange = TtlockTokenExchange::new(
                http.clone(),
                config.tt_api_base.clone(),
                VendorCredentials::new(
                    account.client_id.clone(),
                    account.client_secret.clone(),
                    account.email.clone(),
                    &account.password,
                ),
                config.auth_timeout,
            );
            let credentials = Arc::new(CredentialCache::with_margin(
                exchange,
                config.credential_margin,
            ));
            tracing::info!(lock_id = %config.lock_id, "actuation mode: TTLock cloud");
            Actuator::Vendor(TtlockActuator::new(
                http.clone(),
                config.tt_api_base.clone(),
                account.client_id.clone(),
                credentials,
                config.vendor_timeout,
            ))
        }
        _ => {
            tracing::warn!(lock_id = %config.lock_id, "actuation mode: SIMULATION");
            Actuator::Simulated(SimulatedActuator::new())
        }
    };

    let verifier = PagBankVerifier::new(
        http,
        config.pag_api_base.clone(),
        config.pag_email.clone().unwrap_or_default(),
        config.pag_token.clone().unwrap_or_default(),
        config.provider_timeout,
    );

    let store: Arc<dyn NotificationStore> = Arc::new(InMemoryNotificationStore::new(
        config.dedup_capacity,
        config.dedup_window,
    ));
    spawn_purge_task(
        Arc::clone(&store),
        (config.dedup_window / 4).max(Duration::from_secs(1)),
    );

    let gate = NotificationGate::new(
        verifier,
        LockStateMachine::new(config.lock_id.clone(), actuator),
        store,
        GateConfig {
            shared_secret: config.webhook_secret.clone(),
            hold: config.hold,
            max_concurrent: config.max_concurrent,
        },
    );

    Ok(AppState {
        gate,
        simulation_mode: config.simulation_mode,
        metrics_token: config.metrics_token.clone(),
        public_metrics: config.public_metrics,
        admin_token: config.admin_token.clone(),
    })
}

/// Fetch the first vendor token so the first payment does not pay for it.
/// Failure is logged and otherwise ignored; the next command retries.
pub async fn warm_credentials(state: &AppState) {
    let Some(cache) = state.machine().actuator().credentials() else {
        return;
    };
    match cache.get_credential().await {
        Ok(_) => tracing::info!("vendor token cached at startup"),
        Err(e) => tracing::warn!(error = %e, "could not fetch vendor token at startup"),
    }
}
