//! Server and mount configuration.
//!
//! The embedding application (or the CLI) constructs a [`ServerConfig`] with
//! one or more [`ClientMount`]s; the server freezes each mount into a
//! [`ResolvedMount`] at startup. Config-file loading lives outside this
//! crate.

use crate::error::{Result, ServerError};
use crate::importmap::ImportMapScanner;
use crate::mime::{DefaultMimeTable, MimeTable};
use crate::router::Router;
use crate::ssr::{DefaultDomSerializer, DomSerializer, SsrHook};
use crate::transform::Transform;
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Default index file served for `/`.
pub const DEFAULT_INDEX: &str = "index.html";

/// Default request body limit for API routes (10 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Default debounce window for the file watcher.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// A reverse-proxy forwarding rule.
///
/// Rules are matched in list order against the original request path; the
/// first rule whose `context` is a prefix wins.
#[derive(Debug, Clone)]
pub struct ProxyRule {
    /// Path prefix that activates this rule (e.g. `/api`)
    pub context: String,
    /// Upstream base URL
    pub target: Url,
    /// Rewrite the `Host` header to the target's host
    pub change_origin: bool,
    /// Extra headers overlaid on the forwarded request
    pub headers: Vec<(String, String)>,
    /// Ordered (pattern, replacement) pairs; the first matching pattern
    /// rewrites the forwarded path
    rewrites: Vec<(Regex, String)>,
}

impl ProxyRule {
    /// Create a rule forwarding `context`-prefixed paths to `target`.
    pub fn new(context: impl Into<String>, target: &str) -> Result<Self> {
        let target = Url::parse(target)
            .map_err(|e| ServerError::ProxyRule(format!("invalid target '{}': {}", target, e)))?;
        Ok(Self {
            context: context.into(),
            target,
            change_origin: false,
            headers: Vec::new(),
            rewrites: Vec::new(),
        })
    }

    /// Append a path rewrite pair. Patterns are tried in insertion order and
    /// the first match is applied.
    pub fn rewrite(mut self, pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| ServerError::ProxyRule(format!("invalid rewrite '{}': {}", pattern, e)))?;
        self.rewrites.push((re, replacement.into()));
        Ok(self)
    }

    /// Rewrite the `Host` header to the upstream host.
    pub fn change_origin(mut self) -> Self {
        self.change_origin = true;
        self
    }

    /// Overlay a header on every forwarded request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Does this rule apply to `path`?
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.context)
    }

    /// Apply the first matching rewrite pair, or return the path unchanged.
    pub fn rewrite_path(&self, path: &str) -> String {
        for (pattern, replacement) in &self.rewrites {
            if pattern.is_match(path) {
                return pattern.replace(path, replacement.as_str()).into_owned();
            }
        }
        path.to_string()
    }
}

/// One client application served by the server.
#[derive(Clone)]
pub struct ClientMount {
    /// Filesystem root of the client's files
    pub root: PathBuf,
    /// URL prefix this client answers under; `""` makes it the fallback
    pub base_path: String,
    /// Index file served for `/` instead of `index.html`
    pub index: Option<String>,
    /// Server-side render hook for the index route
    pub ssr: Option<Arc<dyn SsrHook>>,
    /// API routes scoped to this mount (matched mount-relative)
    pub api: Option<Router>,
    /// Proxy rules consulted before the global rules
    pub proxy: Vec<ProxyRule>,
}

impl ClientMount {
    /// Create a mount serving files from `root` at the fallback base path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_path: String::new(),
            index: None,
            ssr: None,
            api: None,
            proxy: Vec::new(),
        }
    }

    /// Mount under a URL prefix such as `/admin`.
    pub fn base_path(mut self, base: impl Into<String>) -> Self {
        self.base_path = base.into();
        self
    }

    /// Serve `file` for `/` instead of `index.html`.
    pub fn index(mut self, file: impl Into<String>) -> Self {
        self.index = Some(file.into());
        self
    }

    /// Attach a server-side render hook.
    pub fn ssr(mut self, hook: Arc<dyn SsrHook>) -> Self {
        self.ssr = Some(hook);
        self
    }

    /// Attach an API router scoped to this mount.
    pub fn api(mut self, router: Router) -> Self {
        self.api = Some(router);
        self
    }

    /// Append a proxy rule scoped to this mount.
    pub fn proxy_rule(mut self, rule: ProxyRule) -> Self {
        self.proxy.push(rule);
        self
    }
}

impl std::fmt::Debug for ClientMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMount")
            .field("root", &self.root)
            .field("base_path", &self.base_path)
            .field("index", &self.index)
            .field("ssr", &self.ssr.is_some())
            .field("api", &self.api.is_some())
            .field("proxy", &self.proxy.len())
            .finish()
    }
}

/// Top-level server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// Client mounts in declaration order (first match wins)
    pub mounts: Vec<ClientMount>,
    /// Global proxy rules, consulted after each mount's own rules
    pub proxy: Vec<ProxyRule>,
    /// Global API router, matched against the original request path
    pub api: Option<Router>,
    /// Public domain to 302-redirect to when the request host matches the
    /// bind host
    pub public_domain: Option<String>,
    /// Extra directories watched for hot reload (mount roots are always
    /// watched)
    pub watch_roots: Vec<PathBuf>,
    /// Watcher ignore patterns
    pub watch_ignore: Vec<String>,
    /// Watcher debounce window
    pub debounce_ms: u64,
    /// Source transform collaborator
    pub transform: Option<Arc<dyn Transform>>,
    /// Content-type lookup collaborator
    pub mime: Arc<dyn MimeTable>,
    /// Import-map scanner collaborator
    pub import_map: Option<Arc<dyn ImportMapScanner>>,
    /// Serializer for structural SSR output
    pub dom_serializer: Arc<dyn DomSerializer>,
    /// Body size limit for API routes
    pub max_body_bytes: usize,
}

impl ServerConfig {
    /// Configuration with defaults for everything but the bind address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            mounts: Vec::new(),
            proxy: Vec::new(),
            api: None,
            public_domain: None,
            watch_roots: Vec::new(),
            watch_ignore: default_watch_ignore(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            transform: None,
            mime: Arc::new(DefaultMimeTable),
            import_map: None,
            dom_serializer: Arc::new(DefaultDomSerializer),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Append a mount. Declaration order decides precedence.
    pub fn mount(mut self, mount: ClientMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Append a global proxy rule.
    pub fn proxy_rule(mut self, rule: ProxyRule) -> Self {
        self.proxy.push(rule);
        self
    }

    /// Set the global API router.
    pub fn api(mut self, router: Router) -> Self {
        self.api = Some(router);
        self
    }

    /// The server URL as a string.
    pub fn server_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Ignore patterns applied to every watched root.
pub fn default_watch_ignore() -> Vec<String> {
    vec![
        "node_modules".to_string(),
        ".git".to_string(),
        "dist".to_string(),
        "build".to_string(),
        "*.log".to_string(),
        ".DS_Store".to_string(),
    ]
}

/// A mount frozen at server construction: canonical root, normalized base
/// path, Arc'd router. Never recomputed per request.
#[derive(Clone)]
pub struct ResolvedMount {
    /// Normalized base path: `""` or `/segment`, no trailing slash
    pub base_path: String,
    /// Canonicalized filesystem root
    pub root: PathBuf,
    /// Index file name served for `/`
    pub index_file: String,
    /// Whether the index file was explicitly overridden
    pub has_index_override: bool,
    /// SSR hook, if any
    pub ssr: Option<Arc<dyn SsrHook>>,
    /// Mount-scoped API router
    pub api: Option<Arc<Router>>,
    /// Mount-scoped proxy rules
    pub proxy: Vec<ProxyRule>,
}

impl ResolvedMount {
    /// Freeze a [`ClientMount`]. Fails if the root does not exist.
    pub fn resolve(mount: &ClientMount) -> Result<Self> {
        let root = std::fs::canonicalize(&mount.root)
            .map_err(|_| ServerError::PathNotFound(mount.root.clone()))?;
        if !root.is_dir() {
            return Err(ServerError::Config(format!(
                "mount root is not a directory: {}",
                root.display()
            )));
        }

        Ok(Self {
            base_path: normalize_base_path(&mount.base_path)?,
            root,
            index_file: mount.index.clone().unwrap_or_else(|| DEFAULT_INDEX.to_string()),
            has_index_override: mount.index.is_some(),
            ssr: mount.ssr.clone(),
            api: mount.api.clone().map(Arc::new),
            proxy: mount.proxy.clone(),
        })
    }

    /// Strip this mount's base path from a request path.
    ///
    /// Returns `None` when the path is not under the mount. The match is
    /// segment-aware: `/app` owns `/app` and `/app/x` but not `/appx`.
    pub fn strip_base(&self, path: &str) -> Option<String> {
        if self.base_path.is_empty() {
            return Some(path.to_string());
        }
        if path == self.base_path {
            return Some("/".to_string());
        }
        let rest = path.strip_prefix(&self.base_path)?;
        if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ResolvedMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedMount")
            .field("base_path", &self.base_path)
            .field("root", &self.root)
            .field("index_file", &self.index_file)
            .finish()
    }
}

/// Normalize a configured base path to `""` or `/segment` form.
pub fn normalize_base_path(base: &str) -> Result<String> {
    let trimmed = base.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if trimmed.contains("..") {
        return Err(ServerError::Config(format!("invalid base path: {}", base)));
    }
    Ok(format!("/{}", trimmed))
}

/// Validate mount invariants: at most one fallback (empty base path) and no
/// duplicate base paths.
pub fn validate_mounts(mounts: &[ResolvedMount]) -> Result<()> {
    let mut seen: Vec<&str> = Vec::new();
    for mount in mounts {
        if seen.contains(&mount.base_path.as_str()) {
            let label = if mount.base_path.is_empty() {
                "more than one fallback mount (empty base path)".to_string()
            } else {
                format!("duplicate base path: {}", mount.base_path)
            };
            return Err(ServerError::Config(label));
        }
        seen.push(mount.base_path.as_str());
    }
    Ok(())
}

/// Find an available port starting from the requested port.
///
/// Tries the requested port first, then the next ten. Binding to a
/// privileged port logs a warning but is attempted anyway.
pub fn find_available_port(host: [u8; 4], requested_port: u16) -> Result<SocketAddr> {
    use std::net::TcpListener;

    if requested_port < 1024 {
        tracing::warn!(
            port = requested_port,
            "port is in privileged range, may require elevated permissions"
        );
    }

    let addr = SocketAddr::from((host, requested_port));
    if TcpListener::bind(addr).is_ok() {
        return Ok(addr);
    }

    for offset in 1..=10 {
        let port = requested_port.saturating_add(offset);
        let addr = SocketAddr::from((host, port));
        if TcpListener::bind(addr).is_ok() {
            tracing::warn!(
                requested = requested_port,
                using = port,
                "requested port is busy, falling back"
            );
            return Ok(addr);
        }
    }

    Err(ServerError::Config(format!(
        "ports {}-{} are all in use",
        requested_port,
        requested_port + 10
    )))
}
