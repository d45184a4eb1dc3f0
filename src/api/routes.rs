use std::sync::Arc;

use serde_json::json;
use warp::Filter;

use super::relay_websocket;
use crate::config::Config;
use crate::signaling::SignalHub;

/// `GET /signal/{quizId}`: websocket relay for one quiz's signaling topic.
pub fn signal_websocket_route(
    hub: Arc<SignalHub>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("signal")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_hub(hub))
        .map(|raw_quiz_id: String, ws: warp::ws::Ws, hub: Arc<SignalHub>| {
            let quiz_id = urlencoding::decode(&raw_quiz_id)
                .map(|id| id.into_owned())
                .unwrap_or(raw_quiz_id);
            ws.on_upgrade(move |websocket| {
                relay_websocket::handle_relay_websocket(websocket, quiz_id, hub)
            })
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&json!({
                "status": "healthy",
                "service": "quiz-proctor",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

/// Client-facing ICE servers and proctoring intervals.
pub fn config_endpoint(
    config: Arc<Config>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("config")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&client_config(&config)))
}

fn client_config(config: &Config) -> serde_json::Value {
    let mut ice_servers: Vec<serde_json::Value> = config
        .webrtc
        .stun_servers
        .iter()
        .map(|url| json!({ "urls": [url] }))
        .collect();
    ice_servers.extend(config.webrtc.turn_servers.iter().map(|turn| {
        json!({
            "urls": turn.urls,
            "username": turn.username,
            "credential": turn.credential,
        })
    }));

    let proctoring = &config.proctoring;
    json!({
        "iceServers": ice_servers,
        "alertDurationSecs": proctoring.alert_duration.as_secs(),
        "faceSampleIntervalSecs": proctoring.face_sample_interval.as_secs(),
        "reconcileIntervalSecs": proctoring.reconcile_interval.as_secs(),
    })
}

/// All relay routes.
pub fn routes(
    hub: Arc<SignalHub>,
    config: Arc<Config>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    signal_websocket_route(hub)
        .or(health_check())
        .or(config_endpoint(config))
}

fn with_hub(
    hub: Arc<SignalHub>,
) -> impl Filter<Extract = (Arc<SignalHub>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || hub.clone())
}
