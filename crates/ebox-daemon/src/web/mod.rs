//! JSON web API with a server-sent event stream.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tower_http::cors::{Any, CorsLayer};

use crate::settings::SettingValue;
use crate::state::{AppState, StateError};

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        (StatusCode::NOT_FOUND, self.to_string()).into_response()
    }
}

/// Creates the web router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/snapshot", get(snapshot))
        .route("/api/modules", get(modules))
        .route("/api/modules/:key", get(module))
        .route("/api/modules/:key/enabled", post(module_enabled_set))
        .route("/api/settings", get(settings))
        .route("/api/settings/:key", put(setting_set))
        .route("/api/access", get(access))
        .route("/api/events", get(events))
        .layer(cors)
        .with_state(state)
}

/// GET /api/snapshot - All published modules in display order
async fn snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

/// GET /api/modules - Module list with enabled flags
async fn modules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.modules())
}

/// GET /api/modules/:key - One module's snapshot
async fn module(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, StateError> {
    Ok(match state.module(&key)? {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, "No data published yet").into_response(),
    })
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

/// POST /api/modules/:key/enabled - Enable or disable a module
async fn module_enabled_set(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Result<StatusCode, StateError> {
    state.set_module_enabled(&key, body.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/settings - All runtime settings
async fn settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.settings())
}

#[derive(Deserialize)]
struct SettingBody {
    value: SettingValue,
}

/// PUT /api/settings/:key - Store one runtime setting
async fn setting_set(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<SettingBody>,
) -> StatusCode {
    state.set_setting(&key, body.value);
    StatusCode::NO_CONTENT
}

/// GET /api/access - Current privilege tier
async fn access(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.access_info().await)
}

/// GET /api/events - Snapshot and alert events
async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let snapshots = {
        let state = state.clone();
        WatchStream::new(state.subscribe_snapshot()).map(move |version| {
            let data = serde_json::to_string(&state.snapshot()).unwrap_or_default();
            Event::default()
                .event("snapshot")
                .id(version.to_string())
                .data(data)
        })
    };
    let alerts = BroadcastStream::new(state.subscribe_alerts()).filter_map(|alert| async move {
        let data = serde_json::to_string(&alert.ok()?).ok()?;
        Some(Event::default().event("alert").data(data))
    });

    Sse::new(stream::select(snapshots, alerts).map(Ok)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleKey;
    use crate::state::tests::{publish, test_state};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn serve(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(Arc::new(state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_snapshot_endpoint() {
        let (state, snapshot, _) = test_state();
        publish(&snapshot, ModuleKey::Battery, "80%");
        let addr = serve(state).await;

        let body = reqwest::get(format!("http://{}/api/snapshot", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json[0]["key"], "battery");
        assert_eq!(json[0]["readouts"]["value"], "80%");
    }

    #[tokio::test]
    async fn test_module_endpoint() {
        let (state, snapshot, _) = test_state();
        publish(&snapshot, ModuleKey::Uptime, "3h");
        let addr = serve(state).await;

        let ok = reqwest::get(format!("http://{}/api/modules/uptime", addr))
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);

        let missing = reqwest::get(format!("http://{}/api/modules/storage", addr))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let unknown = reqwest::get(format!("http://{}/api/modules/torch", addr))
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
        assert!(unknown.text().await.unwrap().contains("Unknown module"));
    }

    #[tokio::test]
    async fn test_enable_module() {
        let (state, _, waker) = test_state();
        let addr = serve(state).await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/api/modules/storage/enabled", addr))
            .header("content-type", "application/json")
            .body(r#"{"enabled": true}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        tokio::time::timeout(std::time::Duration::from_secs(1), waker.notified())
            .await
            .unwrap();

        let body = reqwest::get(format!("http://{}/api/modules", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let storage = json
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["key"] == "storage")
            .unwrap();
        assert_eq!(storage["enabled"], true);
    }

    #[tokio::test]
    async fn test_settings_endpoints() {
        let (state, _, _) = test_state();
        let addr = serve(state).await;
        let client = reqwest::Client::new();

        for (key, body) in [
            ("net_interval", r#"{"value": 2000}"#),
            ("bat_low_alert", r#"{"value": false}"#),
            ("dash_card_order", r#"{"value": "network,battery"}"#),
        ] {
            let response = client
                .put(format!("http://{}/api/settings/{}", addr, key))
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        }

        let body = reqwest::get(format!("http://{}/api/settings", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["net_interval"], 2000);
        assert_eq!(json["bat_low_alert"], false);
        assert_eq!(json["dash_card_order"], "network,battery");
    }

    #[tokio::test]
    async fn test_access_endpoint() {
        let (state, _, _) = test_state();
        let addr = serve(state).await;
        let body = reqwest::get(format!("http://{}/api/access", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["enhanced"], false);
        assert!(json["tier"].is_string());
    }
}
