use std::sync::Arc;

use quiz_proctor::api;
use quiz_proctor::config::Config;
use quiz_proctor::signaling::SignalHub;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "quiz_proctor=info,warp=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let hub = SignalHub::new();
    let routes = api::routes(hub, config.clone());

    let (ip, port) = config.bind_address();
    tracing::info!(host = %config.server.host, port = port, "Signaling relay listening");

    warp::serve(routes).run((ip, port)).await;
}
