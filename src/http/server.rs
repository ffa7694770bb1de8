//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, limits, request ID, timeout)
//! - Bind server to listener and shut down gracefully

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ListenerConfig;
use crate::http::handlers;
use crate::http::request::request_id_header;
use crate::lifecycle::Shutdown;
use crate::todo::client::TodoClient;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub todos: Arc<TodoClient>,
}

/// HTTP front end translating REST calls into todo commands.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(listener: &ListenerConfig, todos: Arc<TodoClient>) -> Self {
        let state = AppState { todos };
        Self {
            router: Self::build_router(listener, state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ListenerConfig, state: AppState) -> Router {
        Router::new()
            .route("/todo", get(handlers::list_todos).post(handlers::create_todo))
            .route(
                "/todo/{id}",
                get(handlers::get_todo)
                    .patch(handlers::update_todo)
                    .delete(handlers::delete_todo),
            )
            .route("/todo/{operation}/health", get(handlers::health))
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.max_body_size))
            .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::new(request_id_header()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(request_id_header(), MakeRequestUuid))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::config::QueueConfig;
    use crate::rpc::RpcClient;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn router_without_worker() -> Router {
        let broker = InMemoryBroker::new();
        broker.declare_queue("todo.commands").await.unwrap();
        let rpc = RpcClient::new(Arc::new(broker) as Arc<dyn Broker>, Duration::from_millis(50));
        let todos = Arc::new(TodoClient::new(rpc, QueueConfig::default()));
        GatewayServer::new(&ListenerConfig::default(), todos).router()
    }

    #[tokio::test]
    async fn test_health_route() {
        let router = router_without_worker().await;
        let response = router
            .oneshot(Request::get("/todo/patch/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], handlers::HEALTH_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_invalid_json_never_reaches_broker() {
        let router = router_without_worker().await;
        let response = router
            .oneshot(
                Request::post("/todo")
                    .header("content-type", "application/json")
                    .body(Body::from("[oops"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_unanswered_call_is_gateway_timeout() {
        let router = router_without_worker().await;
        let response = router
            .oneshot(Request::get("/todo/abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"timeout"}"#);
    }
}
