//! Read-only JSON projections of core state, matching what vitess's
//! `vtgate/gateway` status page and `healthcheck.go`'s `CacheStatus`/
//! `StatusAsHTML` render. The HTML templating glue is out of scope here;
//! the data it renders is not, so this module exposes it as plain JSON
//! over a minimal `hyper` server.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, instrument};

use vtrouter_client::SrvKeyspace;
use vtrouter_discovery::HealthCheck;
use vtrouter_util::shutdown::ShutdownReceiver;

/// Aggregates `HealthCheck::cache_status` with the keyspace shard summaries
/// currently known to the caller, for `/debug/gateway` and
/// `/debug/tablet_vschema`.
#[derive(Serialize)]
pub struct DebugSnapshot {
    pub tablets: Vec<vtrouter_discovery::CacheStatusGroup>,
    pub vschema: HashMap<String, SrvKeyspace>,
}

/// Shared state backing the debug endpoints. `vschema` is a caller-maintained
/// view refreshed out of band (e.g. from `ResilientSrvTopoServer` polling);
/// this module only ever reads it.
pub struct DebugState {
    pub health: Arc<HealthCheck>,
    pub vschema: Arc<RwLock<HashMap<String, SrvKeyspace>>>,
}

impl DebugState {
    pub fn new(health: Arc<HealthCheck>) -> Self {
        Self {
            health,
            vschema: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            tablets: self.health.cache_status(),
            vschema: self.vschema.read().clone(),
        }
    }
}

fn json_response(code: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("building a response from a well-formed header set cannot fail")
}

async fn route(req: Request<Body>, state: Arc<DebugState>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/debug/gateway") => {
            let snapshot = state.snapshot();
            match serde_json::to_string(&snapshot.tablets) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{{\"error\":\"{e}\"}}")),
            }
        }
        (&Method::GET, "/debug/tablet_vschema") => {
            let snapshot = state.snapshot();
            match serde_json::to_string(&snapshot.vschema) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{{\"error\":\"{e}\"}}")),
            }
        }
        (&Method::GET, path) if path.starts_with("/streamqueryz") => {
            // The live-query registry lives in the MySQL wire-protocol
            // front door, which this crate does not implement. The route
            // exists for API completeness but has nothing behind it here.
            json_response(
                StatusCode::NOT_IMPLEMENTED,
                "{\"error\":\"streamqueryz is served by the wire-protocol front door, not this core\"}".to_string(),
            )
        }
        _ => json_response(StatusCode::NOT_FOUND, "{\"error\":\"not found\"}".to_string()),
    };
    Ok(response)
}

/// Serves `/debug/gateway`, `/debug/tablet_vschema`, and the `/streamqueryz`
/// stub until `shutdown` fires.
#[instrument(skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, state: Arc<DebugState>, mut shutdown: ShutdownReceiver) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| route(req, state.clone()))) }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!("debug HTTP surface listening");
    server.with_graceful_shutdown(async move { shutdown.recv().await }).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vtrouter_discovery::{HealthCheck, HealthCheckConfig};

    use super::*;

    struct NoopDialer;

    #[async_trait::async_trait]
    impl vtrouter_discovery::health_check::Dialer for NoopDialer {
        async fn dial(&self, _tablet: &vtrouter_client::Tablet, _timeout: std::time::Duration) -> vtrouter_errors::RouterResult<Arc<dyn vtrouter_client::QueryService>> {
            Err(vtrouter_errors::unavailable!("not dialed in this test"))
        }
    }

    #[tokio::test]
    async fn gateway_route_returns_empty_json_array_with_no_tablets() {
        let health = Arc::new(HealthCheck::new(Arc::new(NoopDialer), HealthCheckConfig::default()));
        let state = Arc::new(DebugState::new(health.clone()));
        let req = Request::builder().uri("/debug/gateway").method(Method::GET).body(Body::empty()).unwrap();
        let resp = route(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        health.close().await;
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let health = Arc::new(HealthCheck::new(Arc::new(NoopDialer), HealthCheckConfig::default()));
        let state = Arc::new(DebugState::new(health.clone()));
        let req = Request::builder().uri("/nope").method(Method::GET).body(Body::empty()).unwrap();
        let resp = route(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        health.close().await;
    }

    #[tokio::test]
    async fn streamqueryz_is_stubbed_not_implemented() {
        let health = Arc::new(HealthCheck::new(Arc::new(NoopDialer), HealthCheckConfig::default()));
        let state = Arc::new(DebugState::new(health.clone()));
        let req = Request::builder().uri("/streamqueryz").method(Method::GET).body(Body::empty()).unwrap();
        let resp = route(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
        health.close().await;
    }
}
