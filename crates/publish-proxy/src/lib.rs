//! publish-proxy - Launches publishing agents for notebooks and proxies their UI.
//!
//! Publishing a notebook starts a helper process (the agent) that serves a
//! publishing UI on a private localhost port. This crate starts one agent per
//! notebook, remembers it for as long as it runs, and exposes its UI to the
//! editor front end under a same-origin mount point:
//!
//! - `POST {mount}/publish` launches (or reuses) the agent and returns the
//!   proxied URL of its UI.
//! - `{mount}/ui/{port}/...` is reverse-proxied to the agent on `port`, but
//!   only if that port was reported by an agent launched here.
//!
//! The mount point is `{base_url}/connect-jupyterlab`.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;

pub mod agent;
pub mod config;
pub mod launcher;
pub mod proxy;
pub mod publish;
pub mod server;

pub use config::ProxyConfig;
pub use launcher::{AgentLauncher, LaunchError, PublishParams};
pub use server::{start_server, AppState};

// ============================================================================
// Types
// ============================================================================

/// Boxed error carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for every response this crate produces, proxied or local.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Wrap an in-memory payload as a [`ProxyBody`].
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}
