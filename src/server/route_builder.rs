use axum::{Router, routing::get};

use crate::wisp::{WispConfig, WispState, wisp_ws_handler, wsproxy_handler};

/// Register all routes
pub fn build_router(config: WispConfig) -> Router {
    let wisp_state = WispState::new(config);

    Router::new()
        // Wisp WebSocket endpoint
        .route("/wisp/", get(wisp_ws_handler))
        // Legacy wsproxy: any deeper path, target in the last segment
        .route("/wisp/*path", get(wsproxy_handler))
        .with_state(wisp_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let response = build_router(WispConfig::default())
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wisp_endpoint_requires_websocket_upgrade() {
        let response = build_router(WispConfig::default())
            .oneshot(Request::get("/wisp/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
