//! Server assembly and lifecycle.
//!
//! Wires the dispatcher, HMR hub and file watcher into one axum application
//! sharing a single port: the hub's WebSocket endpoint and bootstrap script
//! are fixed routes, everything else falls through to the dispatcher. CORS
//! is wide open, which is standard for a dev server.

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, ServerError};
use crate::html;
use crate::hub::{self, HmrHub};
use crate::watcher::{FileWatcher, WatchEvent};
use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The development/preview server.
pub struct DevServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    hub: HmrHub,
}

impl DevServer {
    /// Freeze the configuration and build the dispatcher.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(&config)?);
        Ok(Self {
            config,
            dispatcher,
            hub: HmrHub::new(),
        })
    }

    /// The broadcast hub (register shared state before or after `serve`).
    pub fn hub(&self) -> &HmrHub {
        &self.hub
    }

    /// The frozen configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the axum application.
    ///
    /// Separated from `serve` so tests can drive it in-process without a
    /// listener.
    pub fn build_app(&self) -> axum::Router {
        use tower_http::cors::{Any, CorsLayer};

        let dispatcher = Arc::clone(&self.dispatcher);

        axum::Router::new()
            .route(html::HMR_WS_PATH, get(hub::ws_handler))
            .route(html::HMR_CLIENT_PATH, get(hub::hmr_client_script))
            .fallback(move |req: Request<Body>| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.dispatch(req).await }
            })
            .layer(
                // CORS: allow all origins for dev.
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(self.hub.clone())
    }

    /// Bind, start the watcher and serve until shut down.
    ///
    /// Returns once the listener is bound; use the handle to wait or to
    /// drain.
    pub async fn serve(self) -> Result<ServerHandle> {
        let addr = self.config.addr;
        let app = self.build_app();

        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        let mount_paths = self.dispatcher.mount_paths();
        let mut roots: Vec<PathBuf> = mount_paths.iter().map(|(root, _)| root.clone()).collect();
        for extra in &self.config.watch_roots {
            if !roots.contains(extra) {
                roots.push(extra.clone());
            }
        }

        let (watcher, mut events) = FileWatcher::new(
            roots,
            self.config.watch_ignore.clone(),
            self.config.debounce_ms,
        )?;

        let cancel = CancellationToken::new();

        let hub = self.hub.clone();
        let watch_cancel = cancel.clone();
        let watch_task = tokio::spawn(async move {
            // The watcher stops delivering when dropped; it lives here.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        hub.broadcast_file_event(&to_url_event(&mount_paths, event));
                    }
                }
            }
        });

        let serve_cancel = cancel.clone();
        let serve_task = tokio::spawn(async move {
            let shutdown = async move { serve_cancel.cancelled().await };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %err, "server error");
            }
        });

        info!(addr = %local_addr, "quay server listening");

        Ok(ServerHandle {
            addr: local_addr,
            hub: self.hub,
            cancel,
            drained: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Some((watch_task, serve_task))),
        })
    }
}

/// Map an absolute watched path onto the URL space of the mount that owns
/// it; paths outside every mount pass through unchanged.
fn to_url_event(mount_paths: &[(PathBuf, String)], event: WatchEvent) -> WatchEvent {
    let map = |path: PathBuf| -> PathBuf {
        for (root, base) in mount_paths {
            if let Ok(rel) = path.strip_prefix(root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                return PathBuf::from(format!("{}/{}", base, rel));
            }
        }
        path
    };

    match event {
        WatchEvent::Added(p) => WatchEvent::Added(map(p)),
        WatchEvent::Changed(p) => WatchEvent::Changed(map(p)),
        WatchEvent::Removed(p) => WatchEvent::Removed(map(p)),
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: HmrHub,
    cancel: CancellationToken,
    drained: CancellationToken,
    tasks: tokio::sync::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl ServerHandle {
    /// The bound address (resolves port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The broadcast hub.
    pub fn hub(&self) -> &HmrHub {
        &self.hub
    }

    /// Graceful drain: stop the watcher, close every WebSocket connection,
    /// close the listener, then return.
    ///
    /// Idempotent and safe to call concurrently; every caller returns only
    /// after the drain has completed, and resources are released exactly
    /// once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.hub.close_all();

        let tasks = self.tasks.lock().await.take();
        match tasks {
            Some((watch_task, serve_task)) => {
                let _ = watch_task.await;
                let _ = serve_task.await;
                self.drained.cancel();
            }
            // Another caller owns the join; wait for it to finish.
            None => self.drained.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientMount;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config(root: &Path) -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap()).mount(ClientMount::new(root))
    }

    #[tokio::test]
    async fn test_app_serves_static_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("hello.txt"), "hello quay").unwrap();

        let server = DevServer::new(test_config(temp.path())).unwrap();
        let app = server.build_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/hello.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello quay");
    }

    #[tokio::test]
    async fn test_app_serves_hmr_bootstrap_script() {
        let temp = TempDir::new().unwrap();
        let server = DevServer::new(test_config(temp.path())).unwrap();
        let app = server.build_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(html::HMR_CLIENT_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("javascript"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("WebSocket"));
    }

    #[test]
    fn test_watch_paths_mapped_to_mount_urls() {
        let pairs = vec![(PathBuf::from("/srv/app"), "/app".to_string())];

        let mapped = to_url_event(
            &pairs,
            WatchEvent::Changed(PathBuf::from("/srv/app/src/main.ts")),
        );
        assert_eq!(
            mapped,
            WatchEvent::Changed(PathBuf::from("/app/src/main.ts"))
        );

        let unmapped = to_url_event(&pairs, WatchEvent::Removed(PathBuf::from("/other/x")));
        assert_eq!(unmapped, WatchEvent::Removed(PathBuf::from("/other/x")));
    }

    #[tokio::test]
    async fn test_serve_and_idempotent_shutdown() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("x.txt"), "x").unwrap();

        let server = DevServer::new(test_config(temp.path())).unwrap();
        let handle = match server.serve().await {
            Ok(h) => h,
            Err(ServerError::Bind { .. }) => return, // sandboxed environments
            Err(e) => panic!("serve failed: {}", e),
        };

        let body = reqwest::get(format!("{}/x.txt", handle.url()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "x");

        handle.shutdown().await;
        handle.shutdown().await; // second drain must be a no-op

        assert!(reqwest::get(format!("{}/x.txt", handle.url())).await.is_err());
    }
}
