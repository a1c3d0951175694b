//! Health-check registry and endpoint
//!
//! Components register `(path → handler)` entries; each handler returns a
//! status code and body. The registry is served over http on the address
//! configured by `health_addr`. Producers register a default liveness
//! check under `/producer/<label>/alive`.
use axum::http::{StatusCode, Uri};
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::Error;

/// Handler returning `(status-code, body-text)`.
pub type HealthHandler = Arc<dyn Fn() -> (u16, String) + Send + Sync>;

/// Registry of health-check routes.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    routes: Arc<RwLock<FxHashMap<String, HealthHandler>>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        HealthRegistry::default()
    }

    /// Registers a handler under `path`. Later registrations replace
    /// earlier ones.
    pub fn register(&self, path: impl Into<String>, handler: HealthHandler) {
        let path = path.into();
        debug!(path = path, "health check registered");
        if let Ok(mut routes) = self.routes.write() {
            let _ = routes.insert(path, handler);
        }
    }

    /// Evaluates the handler registered under `path`; unknown paths return
    /// 404.
    pub fn respond(&self, path: &str) -> (u16, String) {
        let handler = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(path).cloned());
        match handler {
            Some(h) => h(),
            None => (404, format!("no health check at {path}\n")),
        }
    }

    /// Registered paths, for diagnostics.
    pub fn paths(&self) -> Vec<String> {
        self.routes
            .read()
            .map(|routes| routes.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Serves the registry over http until the task is cancelled.
pub async fn serve(addr: String, registry: HealthRegistry) -> Result<(), Error> {
    let app = axum::Router::new().fallback(move |uri: Uri| {
        let registry = registry.clone();
        async move {
            let (code, body) = registry.respond(uri.path());
            let status =
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, body)
        }
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::ExecutionError(format!("health listener on {addr}: {e}")))?;
    info!(addr = addr, "health endpoint listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ExecutionError(format!("health endpoint: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_path_is_404() {
        let registry = HealthRegistry::new();
        let (code, _) = registry.respond("/nope");
        assert_eq!(code, 404);
    }

    #[test]
    fn registered_handler_is_evaluated() {
        let registry = HealthRegistry::new();
        registry.register("/ready", Arc::new(|| (200, "OK".into())));
        assert_eq!(registry.respond("/ready"), (200, "OK".to_string()));
    }

    #[test]
    fn later_registration_replaces() {
        let registry = HealthRegistry::new();
        registry.register("/ready", Arc::new(|| (503, "warming up".into())));
        registry.register("/ready", Arc::new(|| (200, "OK".into())));
        assert_eq!(registry.respond("/ready").0, 200);
    }

    #[tokio::test]
    async fn endpoint_serves_the_registry() {
        let registry = HealthRegistry::new();
        registry.register("/ping", Arc::new(|| (200, "pong".into())));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let serve_registry = registry.clone();
        let server = tokio::spawn(serve(addr.to_string(), serve_registry));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("200"));
        assert!(response.contains("pong"));
        server.abort();
    }
}
