//! API router and middleware engine.
//!
//! Routes are registered once at startup and scanned linearly in
//! registration order; the first match wins. Path templates use `:name`
//! segments (`/users/:id`) compiled to capturing patterns. Matched requests
//! run through `[global middlewares..., route middlewares..., handler]` via
//! an explicit [`Next`] continuation.
//!
//! `handle` returns the request untouched when no route matches so the
//! dispatcher can hand it to the next collaborator.

use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::error::HttpError;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use axum::response::Response;
use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Method selector for a route. `All` matches any HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
    All,
}

impl RouteMethod {
    /// Does this selector accept the given HTTP method?
    pub fn accepts(&self, method: &Method) -> bool {
        match self {
            RouteMethod::All => true,
            RouteMethod::Get => method == Method::GET,
            RouteMethod::Post => method == Method::POST,
            RouteMethod::Put => method == Method::PUT,
            RouteMethod::Delete => method == Method::DELETE,
            RouteMethod::Patch => method == Method::PATCH,
            RouteMethod::Options => method == Method::OPTIONS,
            RouteMethod::Head => method == Method::HEAD,
        }
    }
}

/// Decoded request body, keyed by Content-Type.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyData {
    /// No body (or a non-mutating method)
    None,
    /// `application/json`
    Json(Value),
    /// `application/x-www-form-urlencoded`, flat last-wins map
    Form(HashMap<String, String>),
    /// `text/*`
    Text(String),
    /// Anything else, raw
    Bytes(Vec<u8>),
}

impl BodyData {
    /// The JSON value, if the body was JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            BodyData::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// A matched request as seen by middlewares and handlers.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Path the route matched against (query stripped)
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Named `:param` captures in template order
    pub params: HashMap<String, String>,
    /// Query string as a flat map; the last value wins on duplicates
    pub query: HashMap<String, String>,
    /// Decoded body
    pub body: BodyData,
    /// Peer address when known (used by the rate-limit middleware)
    pub remote_ip: Option<IpAddr>,
}

/// Response produced by a handler or middleware.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: StatusCode,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Body bytes
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// 200 with a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self {
            status: StatusCode::OK,
            headers: vec![(header::CONTENT_TYPE.to_string(), "application/json".into())],
            body,
        }
    }

    /// 200 with a plain-text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![(
                header::CONTENT_TYPE.to_string(),
                "text/plain; charset=utf-8".into(),
            )],
            body: body.into().into_bytes(),
        }
    }

    /// Empty response with the given status.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Replace the status code.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Convert into an axum response.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Future type returned by handlers and middlewares.
pub type HandlerFuture = BoxFuture<'static, Result<ApiResponse, HttpError>>;

/// Terminal route handler.
pub type Handler = Arc<dyn Fn(ApiRequest) -> HandlerFuture + Send + Sync>;

/// A middleware in the per-request chain.
///
/// Implementations call `next.run(req)` to continue, or return early to
/// short-circuit.
pub trait Middleware: Send + Sync {
    fn handle(&self, req: ApiRequest, next: Next) -> HandlerFuture;
}

/// Explicit continuation through the middleware chain to the handler.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: Handler,
}

impl Next {
    /// Run the rest of the chain.
    pub fn run(self, req: ApiRequest) -> HandlerFuture {
        if self.index < self.chain.len() {
            let mw = Arc::clone(&self.chain[self.index]);
            let next = Next {
                chain: self.chain,
                index: self.index + 1,
                handler: self.handler,
            };
            mw.handle(req, next)
        } else {
            (self.handler)(req)
        }
    }
}

struct Route {
    method: RouteMethod,
    pattern: Regex,
    params: Vec<String>,
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Handler,
}

/// Outcome of [`Router::handle`].
pub enum RouterOutcome {
    /// A route matched; here is the response.
    Handled(Response),
    /// No route matched; the request is returned untouched.
    Pass(Request<Body>),
}

/// Linear-scan router with ordered middleware.
#[derive(Clone)]
pub struct Router {
    routes: Vec<Arc<Route>>,
    global: Vec<Arc<dyn Middleware>>,
    max_body_bytes: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            global: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Override the request body size limit (413 above it).
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Register a global middleware. Globals run before every route's own
    /// middlewares, in registration order.
    pub fn layer(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.global.push(mw);
        self
    }

    /// Register a route with its own middleware list.
    pub fn route_with<F, Fut>(
        mut self,
        method: RouteMethod,
        path: &str,
        middlewares: Vec<Arc<dyn Middleware>>,
        handler: F,
    ) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        let (pattern, params) = compile_template(path);
        let handler: Handler = Arc::new(move |req| Box::pin(handler(req)));
        self.routes.push(Arc::new(Route {
            method,
            pattern,
            params,
            middlewares,
            handler,
        }));
        self
    }

    /// Register a route.
    pub fn route<F, Fut>(self, method: RouteMethod, path: &str, handler: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        self.route_with(method, path, Vec::new(), handler)
    }

    pub fn get<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        self.route(RouteMethod::Get, path, handler)
    }

    pub fn post<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        self.route(RouteMethod::Post, path, handler)
    }

    pub fn put<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        self.route(RouteMethod::Put, path, handler)
    }

    pub fn delete<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        self.route(RouteMethod::Delete, path, handler)
    }

    pub fn all<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, HttpError>> + Send + 'static,
    {
        self.route(RouteMethod::All, path, handler)
    }

    /// True when no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Try to handle a request.
    ///
    /// `match_path` is the path to match templates against (the dispatcher
    /// passes the mount-relative path for mount routers); the query string
    /// is always taken from the request URI. When no route matches the
    /// request is returned untouched inside [`RouterOutcome::Pass`].
    pub async fn handle(&self, req: Request<Body>, match_path: Option<String>) -> RouterOutcome {
        let path = match &match_path {
            Some(p) => strip_query(p).to_string(),
            None => req.uri().path().to_string(),
        };

        let Some((route, params)) = self.find_route(req.method(), &path) else {
            return RouterOutcome::Pass(req);
        };

        let query = parse_query(req.uri().query().unwrap_or(""));
        let method = req.method().clone();
        let headers = req.headers().clone();
        let remote_ip = req
            .extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|info| info.0.ip());

        // Body is only read for mutating methods, and only after a route
        // matched.
        let body = match self.read_body(&method, &headers, req.into_body()).await {
            Ok(body) => body,
            Err(err) => return RouterOutcome::Handled(err.into_response()),
        };

        let api_req = ApiRequest {
            method,
            path,
            headers,
            params,
            query,
            body,
            remote_ip,
        };

        let chain: Vec<Arc<dyn Middleware>> = self
            .global
            .iter()
            .chain(route.middlewares.iter())
            .cloned()
            .collect();
        let next = Next {
            chain: chain.into(),
            index: 0,
            handler: Arc::clone(&route.handler),
        };

        match next.run(api_req).await {
            Ok(resp) => RouterOutcome::Handled(resp.into_response()),
            Err(err) => {
                // Nothing has been written yet at this point, so the error
                // becomes the response. Non-taxonomy failures surface as a
                // 500 JSON body.
                tracing::debug!(error = %err, "route handler returned an error");
                RouterOutcome::Handled(err.into_response())
            }
        }
    }

    fn find_route(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        for route in &self.routes {
            if !route.method.accepts(method) {
                continue;
            }
            if let Some(captures) = route.pattern.captures(path) {
                let mut params = HashMap::new();
                for (i, name) in route.params.iter().enumerate() {
                    if let Some(m) = captures.get(i + 1) {
                        params.insert(name.clone(), m.as_str().to_string());
                    }
                }
                return Some((Arc::clone(route), params));
            }
        }
        None
    }

    async fn read_body(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<BodyData, HttpError> {
        if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
            return Ok(BodyData::None);
        }

        let bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| HttpError::PayloadTooLarge {
                limit: self.max_body_bytes,
            })?;

        if bytes.is_empty() {
            return Ok(BodyData::None);
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match content_type.as_str() {
            "application/json" => {
                let value: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| HttpError::BadRequest(format!("malformed JSON body: {}", e)))?;
                Ok(BodyData::Json(value))
            }
            "application/x-www-form-urlencoded" => {
                Ok(BodyData::Form(parse_query(&String::from_utf8_lossy(&bytes))))
            }
            ct if ct.starts_with("text/") => {
                Ok(BodyData::Text(String::from_utf8_lossy(&bytes).into_owned()))
            }
            _ => Ok(BodyData::Bytes(bytes.to_vec())),
        }
    }
}

/// Compile a `:name` template into an anchored pattern plus the ordered
/// parameter names. Literal segments are escaped before compilation.
fn compile_template(path: &str) -> (Regex, Vec<String>) {
    let mut params = Vec::new();
    let mut pattern = String::from("^");

    for (i, segment) in path.split('/').enumerate() {
        if i > 0 {
            pattern.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            params.push(name.to_string());
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');

    // Templates are static strings supplied at startup; an invalid escape
    // here is a programmer error.
    let regex = Regex::new(&pattern).expect("route template compiled to invalid pattern");
    (regex, params)
}

/// Parse a query string (or form body) into a flat map, last value wins.
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.insert(key.into_owned(), value.into_owned());
    }
    map
}

fn strip_query(path: &str) -> &str {
    match path.find('?') {
        Some(idx) => &path[..idx],
        None => path,
    }
}
