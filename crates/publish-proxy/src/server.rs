//! HTTP server for the publish and proxy endpoints.
//!
//! Endpoints, all under the mount point:
//! - `POST /publish`: launch or reuse the agent for a notebook
//! - `ANY /ui/{port}/{path}`: reverse proxy to an allow-listed agent
//! - `GET /health`: 200 OK
//!
//! The server runs on the caller's tokio runtime, one task per connection.
//! Agents are owned by [`AppState`] and are killed when it is dropped.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::agent::PortAllowList;
use crate::config::ProxyConfig;
use crate::launcher::AgentLauncher;
use crate::proxy::{HttpForwarder, ProxyHandler};
use crate::publish::{self, RequestOrigin};
use crate::{full_body, BoxError, ProxyBody};

/// Largest publish request body accepted. The JSON carries a few paths and
/// names, so anything near this is not a real request.
const MAX_PUBLISH_BODY: usize = 64 * 1024;

/// Shared state for every request: the launcher (which owns the agent
/// registry) and the proxy, both reading one port allow-list.
pub struct AppState {
    mount_path: String,
    launcher: AgentLauncher,
    proxy: ProxyHandler<HttpForwarder>,
}

impl AppState {
    pub fn new(config: &ProxyConfig) -> Self {
        let mount_path = config.mount_path();
        let allowed_ports = Arc::new(PortAllowList::new());
        Self {
            launcher: AgentLauncher::new(config, allowed_ports.clone()),
            proxy: ProxyHandler::new(allowed_ports, HttpForwarder::new(), mount_path.clone()),
            mount_path,
        }
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn launcher(&self) -> &AgentLauncher {
        &self.launcher
    }
}

/// Start the HTTP server on `addr`.
///
/// Returns the bound address (useful with port 0). The accept loop runs as
/// a spawned task on the current tokio runtime.
pub async fn start_server(state: Arc<AppState>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!(
        "[publish-proxy] Listening on http://{}{}",
        local_addr, state.mount_path
    );

    tokio::spawn(accept_connections(listener, state));

    Ok(local_addr)
}

async fn accept_connections(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("[publish-proxy] Connection from {}", peer);
                tokio::spawn(serve_connection(stream, state.clone()));
            }
            Err(e) => error!("[publish-proxy] Accept error: {}", e),
        }
    }
}

/// Serve HTTP/1 requests on one connection until the client goes away.
async fn serve_connection(stream: TcpStream, state: Arc<AppState>) {
    let service = service_fn(move |req| handle_request(req, state.clone()));
    let served = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await;
    match served {
        Ok(()) => {}
        Err(e) if e.is_incomplete_message() || e.is_canceled() => {
            debug!("[publish-proxy] Connection closed early: {}", e);
        }
        Err(e) => error!("[publish-proxy] Connection error: {}", e),
    }
}

/// Route a single HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let path = req.uri().path().to_string();

    let Some(route) = path.strip_prefix(state.mount_path.as_str()) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
    };

    let response = if route == "/publish" {
        if req.method() == Method::POST {
            handle_publish(req, &state).await
        } else {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
    } else if route == "/health" {
        text_response(StatusCode::OK, "OK")
    } else if let Some((port, sub_path)) = route.strip_prefix("/ui/").and_then(split_ui_route) {
        match port.parse::<u16>() {
            Ok(port) => {
                let req = req.map(|body| body.map_err(BoxError::from).boxed());
                state.proxy.proxy(port, sub_path, req).await
            }
            Err(_) => {
                warn!("[proxy] Rejected request for out-of-range port {}", port);
                text_response(StatusCode::BAD_REQUEST, "Invalid proxy path")
            }
        }
    } else {
        text_response(StatusCode::NOT_FOUND, "Not Found")
    };

    Ok(response)
}

async fn handle_publish(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let origin = RequestOrigin::from_headers(req.headers());
    let body = match read_body(req.into_body(), MAX_PUBLISH_BODY).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    match publish::publish(&state.launcher, &state.mount_path, &origin, &body).await {
        Ok(reply) => match serde_json::to_vec(&reply) {
            Ok(json) => json_response(StatusCode::OK, json),
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        Err(e) => {
            error!("[publish] {:?}", e);
            text_response(e.status(), &e.to_string())
        }
    }
}

/// Collect a request body of at most `limit` bytes. Failures come back as
/// the response to send: 413 when over the limit, 400 otherwise.
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Response<ProxyBody>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!("[publish] Request body exceeds {} bytes", limit);
            Err(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Publish request too large",
            ))
        }
        Err(e) => {
            warn!("[publish] Failed to read request body: {}", e);
            Err(text_response(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
            ))
        }
    }
}

/// Split `{port}/{sub_path}` (the part after `/ui/`). The port must be all
/// digits; a bare `{port}` proxies to the agent's root.
fn split_ui_route(rest: &str) -> Option<(&str, &str)> {
    let (port, sub_path) = rest.split_once('/').unwrap_or((rest, ""));
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((port, sub_path))
}

/// Build a simple text response.
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .expect("response builder should not fail")
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("response builder should not fail")
}
