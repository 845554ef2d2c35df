use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use paylock::constants::SIGNATURE_HEADER;
use paylock::security::bearer_matches;
use paylock::{metrics, CredentialStatus, InboundNotification, LockStatus, TokenExchange};

use crate::error::ApiError;
use crate::state::AppState;

const SERVICE: &str = "paylock";

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Credential cache state as a short word; `simulated` when no vendor is used.
fn cache_status(state: &AppState) -> &'static str {
    state
        .machine()
        .actuator()
        .credentials()
        .map(|c| c.status().as_str())
        .unwrap_or("simulated")
}

/// Payment provider webhook. Acknowledges as soon as the notification is
/// authenticated and deduplicated; the lock opens in the background.
#[post("/webhook/pagamento")]
pub async fn webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let notification = InboundNotification {
        content_type: header(&req, "content-type").map(str::to_string),
        signature: header(&req, SIGNATURE_HEADER).map(str::to_string),
        body,
    };
    let ack = state.gate.handle(notification)?;
    Ok(HttpResponse::Ok().json(ack))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(flatten)]
    lock: LockStatus,
    credentials: Option<CredentialStatus>,
    simulation_mode: bool,
}

#[get("/status")]
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        lock: state.machine().status(),
        credentials: state.machine().actuator().credentials().map(|c| c.status()),
        simulation_mode: state.simulation_mode,
    })
}

#[derive(Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub probe: bool,
}

#[get("/health")]
pub async fn health(query: web::Query<HealthQuery>, state: web::Data<AppState>) -> HttpResponse {
    let mut body = serde_json::json!({
        "status": "ok",
        "service": SERVICE,
        "simulationMode": state.simulation_mode,
        "lockId": state.machine().lock_id(),
        "cacheStatus": cache_status(&state),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if !query.probe {
        return HttpResponse::Ok().json(body);
    }

    let Some(cache) = state.machine().actuator().credentials() else {
        body["probe"] = "skipped".into();
        return HttpResponse::Ok().json(body);
    };
    // Talk to the token endpoint directly; the cached token is left alone.
    match cache.exchange().exchange().await {
        Ok(_) => {
            body["probe"] = "ok".into();
            HttpResponse::Ok().json(body)
        }
        Err(e) => {
            tracing::warn!(error = %e, "vendor credential probe failed");
            body["status"] = "degraded".into();
            body["probe"] = "failed".into();
            body["error"] = e.to_string().into();
            HttpResponse::ServiceUnavailable().json(body)
        }
    }
}

#[get("/")]
pub async fn home(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "PagBank + TTLock controller running",
        "status": "online",
        "simulationMode": state.simulation_mode,
        "lockId": state.machine().lock_id(),
        "cacheStatus": cache_status(&state),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Close the lock now instead of waiting for the auto-close timer.
#[post("/lock/close")]
pub async fn close_lock(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let Some(token) = &state.admin_token else {
        return Err(ApiError::Forbidden(
            "set ADMIN_TOKEN to enable manual close",
        ));
    };
    if !bearer_matches(header(&req, "authorization"), token) {
        tracing::warn!("manual close rejected: bad admin token");
        return Err(ApiError::Unauthorized);
    }

    state.machine().request_close().await?;
    Ok(HttpResponse::Ok().json(state.machine().status()))
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            if !bearer_matches(header(&req, "authorization"), token) {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None if !state.public_metrics => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN or PAYLOCK_PUBLIC_METRICS=true to access /metrics"
            }));
        }
        None => {}
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

/// Register every route on an app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(home)
        .service(health)
        .service(status)
        .service(webhook)
        .service(close_lock)
        .service(metrics_endpoint);
}
