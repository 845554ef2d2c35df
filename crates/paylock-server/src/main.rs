use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paylock_server::bootstrap;
use paylock_server::config::ControllerConfig;
use paylock_server::routes;

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec!["content-type", "authorization", "x-signature"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec!["content-type", "authorization", "x-signature"])
            .max_age(3600)
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ControllerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "loaded configuration");

    let state = match bootstrap::build_state(&config) {
        Ok(state) => web::Data::new(state),
        Err(e) => {
            tracing::error!("Startup failed: {e}");
            std::process::exit(1);
        }
    };
    bootstrap::warm_credentials(&state).await;

    let port = config.port;
    tracing::info!(
        "PagBank + TTLock controller listening on port {port} ({} mode)",
        if config.simulation_mode { "SIMULATION" } else { "LIVE" }
    );
    tracing::info!("Lock: {}, hold: {}s", config.lock_id, config.hold.as_secs());
    tracing::info!("Rate limit: {} req/min per IP", config.rate_limit_rpm);
    tracing::info!("  POST http://localhost:{port}/webhook/pagamento");
    tracing::info!("  GET  http://localhost:{port}/status");

    let governor_conf = match GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
    {
        Some(conf) => conf,
        None => {
            tracing::error!("Invalid RATE_LIMIT_RPM: {}", config.rate_limit_rpm);
            std::process::exit(1);
        }
    };

    let origins = config.allowed_origins.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(65_536))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
