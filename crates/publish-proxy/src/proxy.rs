//! Same-origin reverse proxy to running agents.
//!
//! Requests for `{mount}/ui/{port}/{path}` are forwarded to
//! `http://localhost:{port}/{path}`, but only when `port` belongs to an agent
//! this process launched. Without that check the editor's authenticated
//! session could be used to reach any local port.
//!
//! Two response headers are rewritten on the way back:
//! - `Location` becomes the inbound request path. The agent only redirects to
//!   re-authenticate the same page, and its own URL is meaningless outside
//!   its private origin.
//! - `Set-Cookie` is scoped to `{mount}/ui/{port}` so the agent's session
//!   cookie is never sent to other agents or the editor.

use std::future::Future;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION, SET_COOKIE};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, warn};

use crate::agent::PortAllowList;
use crate::config::url_path_join;
use crate::server::text_response;
use crate::{BoxError, ProxyBody};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Error type for forwarding a request to an agent.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid upstream URI {uri}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

/// Sends a fully-addressed request to an agent and returns its response.
pub trait Forward: Send + Sync + 'static {
    fn forward(
        &self,
        request: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send;
}

/// [`Forward`] over plain HTTP/1 using a pooled hyper client.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, ProxyBody>,
}

impl HttpForwarder {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forward for HttpForwarder {
    fn forward(
        &self,
        request: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send {
        let response = self.client.request(request);
        async move {
            let response = response.await?;
            Ok(response.map(|body| body.map_err(BoxError::from).boxed()))
        }
    }
}

/// Forwards requests to allow-listed agent ports.
pub struct ProxyHandler<F = HttpForwarder> {
    allowed_ports: Arc<PortAllowList>,
    forwarder: F,
    mount_path: String,
}

impl<F: Forward> ProxyHandler<F> {
    pub fn new(
        allowed_ports: Arc<PortAllowList>,
        forwarder: F,
        mount_path: impl Into<String>,
    ) -> Self {
        Self {
            allowed_ports,
            forwarder,
            mount_path: mount_path.into(),
        }
    }

    /// Proxy `request` to `sub_path` on the agent listening on `port`.
    ///
    /// Ports that no agent reported get a 400 and are never contacted.
    pub async fn proxy(
        &self,
        port: u16,
        sub_path: &str,
        request: Request<ProxyBody>,
    ) -> Response<ProxyBody> {
        if !self.allowed_ports.contains(port) {
            warn!(
                "[proxy] Rejected {} {}: port {} does not belong to a launched agent",
                request.method(),
                request.uri().path(),
                port
            );
            return text_response(StatusCode::BAD_REQUEST, "Invalid proxy path");
        }

        let request_path = request.uri().path().to_string();
        let upstream = match upstream_request(port, sub_path, request) {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("[proxy] {}", e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };
        debug!("[proxy] {} {}", upstream.method(), upstream.uri());

        match self.forwarder.forward(upstream).await {
            Ok(mut response) => {
                let scope = cookie_scope_path(&self.mount_path, port);
                rewrite_response_headers(response.headers_mut(), &request_path, &scope);
                response
            }
            Err(e) => {
                error!("[proxy] Request to port {} failed: {:?}", port, e);
                text_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }
}

/// Re-address an inbound request to `http://localhost:{port}/{sub_path}`,
/// keeping method, headers, body and query.
fn upstream_request(
    port: u16,
    sub_path: &str,
    request: Request<ProxyBody>,
) -> Result<Request<ProxyBody>, ProxyError> {
    let (mut parts, body) = request.into_parts();

    let mut target = format!(
        "http://localhost:{}/{}",
        port,
        sub_path.trim_start_matches('/')
    );
    if let Some(query) = parts.uri.query() {
        target.push('?');
        target.push_str(query);
    }
    let uri: Uri = target
        .parse()
        .map_err(|source| ProxyError::InvalidUri { uri: target, source })?;

    strip_hop_by_hop(&mut parts.headers);
    if let Some(authority) = uri.authority() {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(HOST, host);
        }
    }
    parts.uri = uri;

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Cookie path for the agent on `port`: `{mount}/ui/{port}`.
pub fn cookie_scope_path(mount_path: &str, port: u16) -> String {
    url_path_join(&[mount_path, "ui", &port.to_string()])
}

/// Apply the redirect and cookie rewrites to an agent response.
pub fn rewrite_response_headers(headers: &mut HeaderMap, request_path: &str, scope_path: &str) {
    strip_hop_by_hop(headers);
    rewrite_location(headers, request_path);

    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }
    headers.remove(SET_COOKIE);
    for cookie in cookies {
        let scoped = cookie
            .to_str()
            .ok()
            .and_then(|c| HeaderValue::from_str(&scope_cookie(c, scope_path)).ok());
        headers.append(SET_COOKIE, scoped.unwrap_or(cookie));
    }
}

/// Replace any `Location` header with the inbound request path.
pub fn rewrite_location(headers: &mut HeaderMap, request_path: &str) {
    if headers.contains_key(LOCATION) {
        if let Ok(value) = HeaderValue::from_str(request_path) {
            headers.insert(LOCATION, value);
        }
    }
}

/// Set the `Path` attribute of a `Set-Cookie` value, dropping any existing one.
pub fn scope_cookie(cookie: &str, scope_path: &str) -> String {
    let mut parts: Vec<&str> = cookie
        .split(';')
        .map(str::trim)
        .enumerate()
        .filter(|(i, attr)| {
            *i == 0 || {
                let name = attr.split('=').next().unwrap_or("").trim();
                !attr.is_empty() && !name.eq_ignore_ascii_case("path")
            }
        })
        .map(|(_, attr)| attr)
        .collect();
    let path = format!("Path={}", scope_path);
    parts.push(&path);
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::full_body;
    use hyper::Method;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Seen {
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    }

    /// Records forwarded requests and answers with a canned response.
    struct FakeForwarder {
        seen: Arc<Mutex<Vec<Seen>>>,
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
    }

    impl FakeForwarder {
        fn new(status: StatusCode, headers: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                seen: Arc::new(Mutex::new(Vec::new())),
                status,
                headers,
            }
        }
    }

    impl Forward for FakeForwarder {
        fn forward(
            &self,
            request: Request<ProxyBody>,
        ) -> impl Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send {
            self.seen.lock().unwrap().push(Seen {
                method: request.method().clone(),
                uri: request.uri().clone(),
                headers: request.headers().clone(),
            });
            let mut builder = Response::builder().status(self.status);
            for (name, value) in &self.headers {
                builder = builder.header(*name, *value);
            }
            let response = builder.body(full_body("agent says hi")).unwrap();
            async move { Ok(response) }
        }
    }

    fn handler(ports: &[u16], forwarder: FakeForwarder) -> ProxyHandler<FakeForwarder> {
        let allowed = Arc::new(PortAllowList::new());
        for port in ports {
            allowed.insert(*port);
        }
        ProxyHandler::new(allowed, forwarder, "/connect-jupyterlab")
    }

    fn request(method: Method, uri: &str) -> Request<ProxyBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "editor.example.com")
            .header("connection", "keep-alive")
            .header("cookie", "session=abc")
            .body(full_body(""))
            .unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_rewrite_redirect() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("/"));
        rewrite_location(&mut headers, "/connect-jupyterlab/ui/12345/");
        assert_eq!(headers[LOCATION], "/connect-jupyterlab/ui/12345/");

        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            HeaderValue::from_static("http://localhost:12345/login?next=%2F"),
        );
        rewrite_location(&mut headers, "/mount/ui/12345/page");
        assert_eq!(headers[LOCATION], "/mount/ui/12345/page");
    }

    #[test]
    fn test_rewrite_location_absent() {
        let mut headers = HeaderMap::new();
        rewrite_location(&mut headers, "/mount/ui/12345/");
        assert!(headers.get(LOCATION).is_none());
    }

    #[test]
    fn test_scope_cookie() {
        assert_eq!(
            scope_cookie("session=abc", "/mount/ui/12345"),
            "session=abc; Path=/mount/ui/12345"
        );
        assert_eq!(
            scope_cookie("session=my-session", "/connect-jupyterlab/ui/12345"),
            "session=my-session; Path=/connect-jupyterlab/ui/12345"
        );
    }

    #[test]
    fn test_scope_cookie_replaces_existing_path() {
        assert_eq!(
            scope_cookie("token=x; path=/; HttpOnly;Max-Age=60", "/m/ui/1"),
            "token=x; HttpOnly; Max-Age=60; Path=/m/ui/1"
        );
    }

    #[test]
    fn test_cookie_scope_path_matches_mount_and_port() {
        assert_eq!(cookie_scope_path("/mount", 12345), "/mount/ui/12345");
        assert_eq!(
            cookie_scope_path("/user/alice/connect-jupyterlab", 8080),
            "/user/alice/connect-jupyterlab/ui/8080"
        );
    }

    #[test]
    fn test_rewrite_response_headers_handles_every_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2; Path=/"));
        headers.insert("connection", HeaderValue::from_static("close"));

        rewrite_response_headers(&mut headers, "/mount/ui/12345/index.html", "/mount/ui/12345");

        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(
            cookies,
            vec!["a=1; Path=/mount/ui/12345", "b=2; Path=/mount/ui/12345"]
        );
        assert!(headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_proxy_rejects_unknown_port() {
        let forwarder = FakeForwarder::new(StatusCode::OK, vec![]);
        let seen = forwarder.seen.clone();
        let handler = handler(&[12345], forwarder);

        let response = handler
            .proxy(
                44444,
                "index.html",
                request(Method::GET, "/connect-jupyterlab/ui/44444/index.html"),
            )
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_forwards_to_agent() {
        let forwarder = FakeForwarder::new(StatusCode::OK, vec![("content-type", "text/html")]);
        let seen = forwarder.seen.clone();
        let handler = handler(&[12345], forwarder);

        let response = handler
            .proxy(
                12345,
                "static/app.js",
                request(Method::POST, "/connect-jupyterlab/ui/12345/static/app.js?v=2"),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/html");
        assert_eq!(body_string(response).await, "agent says hi");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(
            seen[0].uri.to_string(),
            "http://localhost:12345/static/app.js?v=2"
        );
        assert_eq!(seen[0].headers[HOST], "localhost:12345");
        assert_eq!(seen[0].headers["cookie"], "session=abc");
        assert!(seen[0].headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_proxy_rewrites_redirect_and_cookie() {
        let forwarder = FakeForwarder::new(
            StatusCode::FOUND,
            vec![("location", "/"), ("set-cookie", "session=my-session")],
        );
        let handler = handler(&[12345], forwarder);

        let response = handler
            .proxy(
                12345,
                "",
                request(Method::GET, "/connect-jupyterlab/ui/12345/?token=abc123"),
            )
            .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/connect-jupyterlab/ui/12345/");
        assert_eq!(
            response.headers()[SET_COOKIE],
            "session=my-session; Path=/connect-jupyterlab/ui/12345"
        );
    }

    #[tokio::test]
    async fn test_http_forwarder_reports_connection_failure() {
        // Bind and drop a listener to get a port nothing is listening on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let allowed = Arc::new(PortAllowList::new());
        allowed.insert(port);
        let handler = ProxyHandler::new(allowed, HttpForwarder::new(), "/connect-jupyterlab");

        let uri = format!("/connect-jupyterlab/ui/{}/", port);
        let response = handler.proxy(port, "", request(Method::GET, &uri)).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
