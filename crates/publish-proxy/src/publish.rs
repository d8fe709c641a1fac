//! The publish endpoint: start an agent for a notebook and hand back the
//! proxied URL of its UI.

use std::path::{Component, Path, PathBuf};

use hyper::header::{HeaderMap, HOST};
use hyper::StatusCode;
use log::info;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::url_path_join;
use crate::launcher::{parse_agent_port, AgentLauncher, LaunchError, PublishParams};

/// Body of `POST {mount}/publish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub notebook_path: String,
    pub python_path: String,
    pub python_version: String,
    pub theme: String,
}

/// Successful reply to a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub url: String,
}

/// Error type for publish requests.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Invalid publish request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("Could not resolve notebook path {path:?}: {source}")]
    NotebookPath {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Could not build proxy URL for agent at {agent_url}: {reason}")]
    ProxyUrl { agent_url: String, reason: String },
}

impl PublishError {
    pub fn status(&self) -> StatusCode {
        match self {
            PublishError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Scheme and host the browser used to reach us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub scheme: String,
    pub host: String,
}

impl RequestOrigin {
    /// Read the externally visible origin, preferring `X-Forwarded-*`
    /// headers set by a fronting proxy.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            scheme: header("x-forwarded-proto").unwrap_or_else(|| "http".to_string()),
            host: header("x-forwarded-host")
                .or_else(|| header(HOST.as_str()))
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }
}

/// Handle a publish request body.
pub async fn publish(
    launcher: &AgentLauncher,
    mount_path: &str,
    origin: &RequestOrigin,
    body: &[u8],
) -> Result<PublishResponse, PublishError> {
    info!("[publish] Launching publishing UI");
    let request: PublishRequest = serde_json::from_slice(body)?;

    let notebook_path =
        resolve_notebook_path(&request.notebook_path).map_err(|source| PublishError::NotebookPath {
            path: request.notebook_path.clone(),
            source,
        })?;
    let params = PublishParams {
        python_path: request.python_path,
        python_version: request.python_version,
        theme: request.theme,
    };

    let agent_url = launcher.launch(&notebook_path, &params).await?;

    let url = external_url(&agent_url, origin, mount_path)?;
    info!("[publish] Publishing UI url: {}", url);
    Ok(PublishResponse { url })
}

/// Map an agent URL onto the proxy: same query and fragment, but the
/// caller's scheme and host and the path `{mount}/ui/{port}/`.
pub fn external_url(
    agent_url: &str,
    origin: &RequestOrigin,
    mount_path: &str,
) -> Result<String, PublishError> {
    let invalid = |reason: String| PublishError::ProxyUrl {
        agent_url: agent_url.to_string(),
        reason,
    };

    let agent = Url::parse(agent_url).map_err(|e| invalid(e.to_string()))?;
    let port = parse_agent_port(agent_url).ok_or_else(|| invalid("no port".to_string()))?;

    let proxy_path = url_path_join(&[mount_path, "ui", &port.to_string(), "/"]);
    let mut url = Url::parse(&format!("{}://{}{}", origin.scheme, origin.host, proxy_path))
        .map_err(|e| invalid(e.to_string()))?;
    url.set_query(agent.query());
    url.set_fragment(agent.fragment());

    Ok(url.to_string())
}

/// Absolute, lexically normalised form of `path` relative to the working
/// directory. Symlinks are not resolved and the file need not exist.
pub fn resolve_notebook_path(path: &str) -> std::io::Result<PathBuf> {
    let path = Path::new(path);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
