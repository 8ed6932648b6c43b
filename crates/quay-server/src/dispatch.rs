//! Per-request dispatch.
//!
//! The top-level composition for every incoming HTTP request:
//!
//! 1. optional domain remap (302 to the configured public domain),
//! 2. mount selection by base path (declaration order, fallback last),
//! 3. proxy rules (the mount's own list, then the global list, matched
//!    against the original path),
//! 4. API routers (the mount router sees the mount-relative path, the
//!    global router the original; an unmatched mutating verb is a 405 when
//!    any router is configured),
//! 5. SSR for `/` when hooked without an index override, otherwise the
//!    secure file resolver plus transform/MIME/injection on the way out.
//!
//! The proxy-before-API-before-static ordering and first-match-wins within
//! each list are load-bearing contracts. Whatever happens inside, exactly
//! one response is produced per request.

use crate::config::{ResolvedMount, ServerConfig, validate_mounts};
use crate::error::{HttpError, Result, ServerError};
use crate::html;
use crate::importmap::ImportMapCache;
use crate::mime::{MimeTable, content_type_for};
use crate::proxy;
use crate::resolver::{self, ResolvedFile, Resolution};
use crate::router::{Router, RouterOutcome};
use crate::ssr::{self, DomSerializer};
use crate::transform::{Transform, default_transform_extensions};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Immutable per-request dispatcher, built once at server construction.
pub struct Dispatcher {
    /// Mounts with non-empty base paths, in declaration order
    mounts: Vec<Arc<ResolvedMount>>,
    /// The mount with an empty base path, if any
    fallback: Option<Arc<ResolvedMount>>,
    global_proxy: Vec<crate::config::ProxyRule>,
    global_api: Option<Arc<Router>>,
    public_domain: Option<String>,
    /// Host header values that trigger the domain remap
    bind_hosts: Vec<String>,
    client: reqwest::Client,
    transform: Option<Arc<dyn Transform>>,
    transform_exts: HashSet<String>,
    mime: Arc<dyn MimeTable>,
    serializer: Arc<dyn DomSerializer>,
    import_map: ImportMapCache,
}

impl Dispatcher {
    /// Freeze a [`ServerConfig`] into a dispatcher.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let mut mounts = Vec::new();
        let mut fallback = None;
        let mut resolved_all = Vec::new();

        for mount in &config.mounts {
            let resolved = ResolvedMount::resolve(mount)?;
            resolved_all.push(resolved.clone());
            if resolved.base_path.is_empty() {
                if fallback.is_some() {
                    return Err(ServerError::Config(
                        "more than one fallback mount (empty base path)".into(),
                    ));
                }
                fallback = Some(Arc::new(resolved));
            } else {
                mounts.push(Arc::new(resolved));
            }
        }
        validate_mounts(&resolved_all)?;

        let bind_hosts = vec![
            config.addr.to_string(),
            format!("localhost:{}", config.addr.port()),
        ];

        Ok(Self {
            mounts,
            fallback,
            global_proxy: config.proxy.clone(),
            global_api: config.api.clone().map(Arc::new),
            public_domain: config.public_domain.clone(),
            bind_hosts,
            client: reqwest::Client::new(),
            transform: config.transform.clone(),
            transform_exts: default_transform_extensions(),
            mime: Arc::clone(&config.mime),
            serializer: Arc::clone(&config.dom_serializer),
            import_map: ImportMapCache::new(config.import_map.clone()),
        })
    }

    /// The import-map cache (exposed so the server can invalidate it on
    /// dependency changes).
    pub fn import_map(&self) -> &ImportMapCache {
        &self.import_map
    }

    /// Resolved `(root, base_path)` pairs, used to watch mount roots and to
    /// map changed files back to URL paths.
    pub fn mount_paths(&self) -> Vec<(std::path::PathBuf, String)> {
        self.mounts
            .iter()
            .chain(self.fallback.iter())
            .map(|m| (m.root.clone(), m.base_path.clone()))
            .collect()
    }

    /// Handle one request, always producing a response.
    pub async fn dispatch(&self, req: Request<Body>) -> Response {
        let path = req.uri().path().to_string();

        match self.dispatch_inner(req).await {
            Ok(resp) => resp,
            // Browsers request this unconditionally; answer quietly instead
            // of logging a 404 per page load.
            Err(HttpError::NotFound(_)) if path == "/favicon.ico" => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty())),
            Err(err) => {
                debug!(path = %path, error = %err, "request failed");
                err.into_response()
            }
        }
    }

    async fn dispatch_inner(&self, req: Request<Body>) -> Result<Response, HttpError> {
        if let Some(redirect) = self.domain_remap(&req) {
            return Ok(redirect);
        }

        let path = req.uri().path().to_string();

        let mount = self
            .select_mount(&path)
            .ok_or_else(|| HttpError::NotFound(format!("no mount serves {}", path)))?;
        let mount = Arc::clone(mount);
        let rel = mount
            .strip_base(&path)
            .unwrap_or_else(|| path.clone());

        // Proxy first: the mount's rules, then the global list, both against
        // the original path.
        if let Some(rule) = proxy::match_rule(&mount.proxy, &path)
            .or_else(|| proxy::match_rule(&self.global_proxy, &path))
        {
            return proxy::forward(&self.client, rule, req).await;
        }

        // API routers: the mount's router matches mount-relative so its
        // templates are base-path agnostic; the global router matches the
        // original path.
        let api_configured = mount.api.is_some() || self.global_api.is_some();
        let mut req = req;
        if let Some(api) = &mount.api {
            match api.handle(req, Some(rel.clone())).await {
                RouterOutcome::Handled(resp) => return Ok(resp),
                RouterOutcome::Pass(back) => req = back,
            }
        }
        if let Some(api) = &self.global_api {
            match api.handle(req, None).await {
                RouterOutcome::Handled(resp) => return Ok(resp),
                RouterOutcome::Pass(back) => req = back,
            }
        }
        if api_configured && is_mutating(req.method()) {
            return Err(HttpError::MethodNotAllowed(format!(
                "{} {}",
                req.method(),
                path
            )));
        }

        // SSR answers `/` directly unless an index override points at a
        // real file.
        if rel == "/" && mount.ssr.is_some() && !mount.has_index_override {
            return self.render_ssr(&mount).await;
        }

        let serve_path = if rel == "/" {
            format!("/{}", mount.index_file)
        } else {
            rel
        };

        match resolver::resolve(&mount, &serve_path).await? {
            Resolution::SsrFallback => self.render_ssr(&mount).await,
            Resolution::File(file) => self.serve_file(&file).await,
        }
    }

    /// 302 to the configured public domain when the request targeted the
    /// bind host directly.
    fn domain_remap(&self, req: &Request<Body>) -> Option<Response> {
        let domain = self.public_domain.as_ref()?;
        let host = req.headers().get(header::HOST)?.to_str().ok()?;
        if !self.bind_hosts.iter().any(|bound| bound == host) {
            return None;
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, format!("http://{}{}", domain, path_and_query))
            .body(Body::empty())
            .ok()
    }

    /// First declared mount whose base path owns the request, else the
    /// fallback mount.
    fn select_mount(&self, path: &str) -> Option<&Arc<ResolvedMount>> {
        self.mounts
            .iter()
            .find(|mount| mount.strip_base(path).is_some())
            .or(self.fallback.as_ref())
    }

    async fn render_ssr(&self, mount: &ResolvedMount) -> Result<Response, HttpError> {
        let hook = mount
            .ssr
            .as_ref()
            .ok_or_else(|| HttpError::Internal("ssr requested without a hook".into()))?;

        let shell = mount.root.join(&mount.index_file);
        let has_static_shell = tokio::fs::metadata(&shell)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        let import_map = self.import_map.get();
        let page = ssr::render_page(
            hook.as_ref(),
            self.serializer.as_ref(),
            &mount.base_path,
            has_static_shell,
            import_map.as_deref(),
        )
        .await?;

        Ok(html_response(page))
    }

    async fn serve_file(&self, file: &ResolvedFile) -> Result<Response, HttpError> {
        let ext = file
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        if let Some(transform) = &self.transform {
            if self.transform_exts.contains(&ext) {
                let source = tokio::fs::read_to_string(&file.path)
                    .await
                    .map_err(HttpError::from)?;
                let output = transform.transform(&source, &ext).await?;
                return Ok(content_response(output.code.into_bytes(), &output.mime));
            }
        }

        let bytes = tokio::fs::read(&file.path).await.map_err(HttpError::from)?;
        let mime = content_type_for(self.mime.as_ref(), &file.path.to_string_lossy());

        if mime.starts_with("text/html") {
            let mut page = String::from_utf8_lossy(&bytes).into_owned();
            if let Some(map) = self.import_map.get() {
                page = html::inject_import_map(&page, &map);
            }
            return Ok(html_response(html::inject_hmr_script(&page)));
        }

        Ok(content_response(bytes, mime))
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn html_response(page: String) -> Response {
    content_response(page.into_bytes(), "text/html; charset=utf-8")
}

fn content_response(bytes: Vec<u8>, mime: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        // Dev mode: always fresh.
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientMount;
    use crate::error::HttpError;
    use crate::ssr::{RenderResult, SsrHook};
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::fs;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    struct HiHook;

    #[async_trait]
    impl SsrHook for HiHook {
        async fn render(&self) -> Result<RenderResult, HttpError> {
            Ok(RenderResult::Html("<h1>hi</h1>".to_string()))
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:3900".parse().unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_mounts_routed_by_base_path() {
        let temp_a = TempDir::new().unwrap();
        let temp_b = TempDir::new().unwrap();
        fs::write(temp_a.path().join("who.txt"), "alpha").unwrap();
        fs::write(temp_b.path().join("who.txt"), "beta").unwrap();

        let config = ServerConfig::new(addr())
            .mount(ClientMount::new(temp_a.path()).base_path("/a"))
            .mount(ClientMount::new(temp_b.path()).base_path("/b"));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/a/who.txt")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "alpha");

        let resp = dispatcher.dispatch(get("/b/who.txt")).await;
        assert_eq!(body_string(resp).await, "beta");
    }

    #[tokio::test]
    async fn test_fallback_mount_catches_the_rest() {
        let base = TempDir::new().unwrap();
        let scoped = TempDir::new().unwrap();
        fs::write(base.path().join("root.txt"), "fallback").unwrap();

        let config = ServerConfig::new(addr())
            .mount(ClientMount::new(scoped.path()).base_path("/app"))
            .mount(ClientMount::new(base.path()));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/root.txt")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "fallback");
    }

    #[tokio::test]
    async fn test_no_mount_is_404() {
        let scoped = TempDir::new().unwrap();
        let config =
            ServerConfig::new(addr()).mount(ClientMount::new(scoped.path()).base_path("/app"));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/elsewhere")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_two_fallback_mounts_rejected() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let config = ServerConfig::new(addr())
            .mount(ClientMount::new(a.path()))
            .mount(ClientMount::new(b.path()));
        assert!(Dispatcher::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_ssr_scenario_index_without_file() {
        // Mount {root, basePath:"/a"} with an SSR hook and no physical
        // index.html: GET /a/index.html renders the hook output with the
        // HMR script before </body>.
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::new(addr()).mount(
            ClientMount::new(temp.path())
                .base_path("/a")
                .ssr(Arc::new(HiHook)),
        );
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/a/index.html")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );

        let page = body_string(resp).await;
        assert!(page.contains("<h1>hi</h1>"));
        let script_pos = page.find(&html::hmr_script_tag()).unwrap();
        let body_pos = page.rfind("</body>").unwrap();
        assert!(script_pos < body_pos);
    }

    #[tokio::test]
    async fn test_root_renders_ssr_directly() {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::new(addr())
            .mount(ClientMount::new(temp.path()).ssr(Arc::new(HiHook)));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("<h1>hi</h1>"));
    }

    #[tokio::test]
    async fn test_index_override_beats_ssr_for_root() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("custom.html"), "<html><body>shell</body></html>").unwrap();

        let config = ServerConfig::new(addr()).mount(
            ClientMount::new(temp.path())
                .index("custom.html")
                .ssr(Arc::new(HiHook)),
        );
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/")).await;
        let page = body_string(resp).await;
        assert!(page.contains("shell"));
        assert!(!page.contains("<h1>hi</h1>"));
    }

    #[tokio::test]
    async fn test_served_html_gets_hmr_script() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("index.html"),
            "<html><body><p>static</p></body></html>",
        )
        .unwrap();

        let config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/")).await;
        let page = body_string(resp).await;
        assert!(page.contains("<p>static</p>"));
        assert!(page.contains(&html::hmr_script_tag()));
    }

    #[tokio::test]
    async fn test_unmatched_mutating_verb_is_405_when_api_configured() {
        let temp = TempDir::new().unwrap();
        let api = Router::new().get("/known", |_req| async {
            Ok(crate::router::ApiResponse::text("ok"))
        });
        let config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()).api(api));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        // A non-mutating miss still falls through to static (and 404s).
        let resp = dispatcher.dispatch(get("/unknown")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mount_api_sees_mount_relative_path() {
        let temp = TempDir::new().unwrap();
        let api = Router::new().get("/status", |_req| async {
            Ok(crate::router::ApiResponse::text("up"))
        });
        let config = ServerConfig::new(addr())
            .mount(ClientMount::new(temp.path()).base_path("/app").api(api));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/app/status")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "up");
    }

    #[tokio::test]
    async fn test_domain_remap_preserves_path() {
        let temp = TempDir::new().unwrap();
        let mut config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        config.public_domain = Some("preview.example.dev".to_string());
        let dispatcher = Dispatcher::new(&config).unwrap();

        let req = Request::builder()
            .uri("/deep/page?x=1")
            .header(header::HOST, "localhost:3900")
            .body(Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await;

        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "http://preview.example.dev/deep/page?x=1"
        );
    }

    #[tokio::test]
    async fn test_other_hosts_not_remapped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("x.txt"), "x").unwrap();
        let mut config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        config.public_domain = Some("preview.example.dev".to_string());
        let dispatcher = Dispatcher::new(&config).unwrap();

        let req = Request::builder()
            .uri("/x.txt")
            .header(header::HOST, "preview.example.dev")
            .body(Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_favicon_miss_is_quiet_204() {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/favicon.ico")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    struct UppercaseTransform;

    #[async_trait]
    impl Transform for UppercaseTransform {
        async fn transform(
            &self,
            source: &str,
            _ext: &str,
        ) -> Result<crate::transform::TransformOutput, HttpError> {
            Ok(crate::transform::TransformOutput {
                code: source.to_uppercase(),
                mime: "application/javascript; charset=utf-8".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_transform_applied_to_source_extensions() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("mod.ts"), "export const x = 1;").unwrap();

        let mut config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        config.transform = Some(Arc::new(UppercaseTransform));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/mod.ts")).await;
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/javascript; charset=utf-8"
        );
        assert_eq!(body_string(resp).await, "EXPORT CONST X = 1;");
    }

    #[tokio::test]
    async fn test_ts_fallback_for_js_request_hits_transform() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("script.ts"), "let a = 1;").unwrap();

        let mut config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        config.transform = Some(Arc::new(UppercaseTransform));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/script.js")).await;
        assert_eq!(body_string(resp).await, "LET A = 1;");
    }

    #[tokio::test]
    async fn test_traversal_is_403_through_dispatch() {
        let temp = TempDir::new().unwrap();
        let config = ServerConfig::new(addr()).mount(ClientMount::new(temp.path()));
        let dispatcher = Dispatcher::new(&config).unwrap();

        let resp = dispatcher.dispatch(get("/%2e%2e/secret")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
