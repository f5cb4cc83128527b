//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Connection
        .route("/api/status", get(api::get_status))
        .route("/api/connect", post(api::connect))
        .route("/api/disconnect", post(api::disconnect))
        .route("/api/error/clear", post(api::clear_error))
        // Register map
        .route("/api/map", get(api::get_map).put(api::put_map))
        // Registers
        .route("/api/registers", get(api::list_registers))
        .route(
            "/api/registers/{address}",
            get(api::get_register).put(api::write_register),
        )
        .route("/api/registers/{address}/read", post(api::read_register))
        .route(
            "/api/registers/{address}/bits/{bit}",
            put(api::write_register_bit),
        )
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        // CORS
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // State
        .with_state(state)
}

/// Run the web server
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> Router {
        router(AppState::new(Config::default()).await.unwrap())
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn map() -> Value {
        json!({
            "version": "1.0",
            "name": "Demo",
            "registers": [
                { "address": "0x02", "name": "ID", "type": "indicator" },
                { "address": "0x12", "name": "FLAGS", "writable": true, "type": "bitfield",
                  "fields": [
                    { "bit": 0, "name": "EN" },
                    { "bit": 2, "name": "MODE" },
                    { "bit": 5, "name": "GO" }
                  ] }
            ]
        })
    }

    #[tokio::test]
    async fn test_register_flow() {
        let app = app().await;

        let (status, _) = call(&app, Method::GET, "/api/registers", None).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);

        let (status, body) = call(&app, Method::PUT, "/api/map", Some(map())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registers"], 2);

        let (status, _) = call(&app, Method::POST, "/api/registers/0x12/read", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(&app, Method::POST, "/api/connect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], true);

        let (status, _) = call(&app, Method::POST, "/api/connect", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/registers/0x12",
            Some(json!({ "value": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["raw"], 0b0010_0001);
        assert_eq!(body["logical"], 5);
        assert_eq!(body["address"], "0x12");

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/registers/0x12/bits/2",
            Some(json!({ "value": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["raw"], 0b0010_0101);

        let (status, body) = call(&app, Method::GET, "/api/registers/0x12", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "FLAGS");
        assert_eq!(body["value"]["logical"], 0b111);

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/registers/0x02",
            Some(json!({ "value": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, Method::GET, "/api/registers/0x99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/api/registers/zz", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::POST, "/api/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], false);
    }

    #[tokio::test]
    async fn test_invalid_map_upload() {
        let app = app().await;
        call(&app, Method::PUT, "/api/map", Some(map())).await;

        let mut broken = map();
        broken["registers"][1]["address"] = json!("0x02");
        let (status, _) = call(&app, Method::PUT, "/api/map", Some(broken)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(&app, Method::GET, "/api/map", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registers"][1]["address"], "0x12");
    }

    #[tokio::test]
    async fn test_status_and_error_clear() {
        let app = app().await;

        call(&app, Method::PUT, "/api/map", Some(map())).await;
        call(&app, Method::POST, "/api/registers/0x12/read?slave=0x51", None).await;

        let (status, body) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["map"]["name"], "Demo");
        assert_eq!(body["connection"]["last_error"]["error"]["operation"], "io");

        let (_, body) = call(&app, Method::POST, "/api/error/clear", None).await;
        assert!(body["last_error"].is_null());
    }
}
