//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Helper executable launched for each published notebook.
pub const DEFAULT_EXECUTABLE: &str = "connect-client";

/// Path segment the front end expects under the host's base URL.
pub const MOUNT_SEGMENT: &str = "connect-jupyterlab";

/// Configuration for the publish proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the HTTP server listens on.
    pub bind_addr: SocketAddr,
    /// Base URL of the hosting editor; the mount point lives beneath it.
    pub base_url: String,
    /// Helper executable name or path.
    pub executable: PathBuf,
    /// Publishing target passed to the helper with `-n`.
    pub target: String,
    /// How long a helper may take to report its URL.
    pub launch_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8765)),
            base_url: "/".to_string(),
            executable: PathBuf::from(DEFAULT_EXECUTABLE),
            target: "dogfood".to_string(),
            launch_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// URL path prefix for every route served by this crate,
    /// e.g. `/connect-jupyterlab` or `/user/me/connect-jupyterlab`.
    pub fn mount_path(&self) -> String {
        url_path_join(&[&self.base_url, MOUNT_SEGMENT])
    }
}

/// Join URL path pieces with exactly one `/` between them.
///
/// The result always starts with `/`. A trailing `/` is kept only when the
/// last piece ends with one.
pub fn url_path_join(pieces: &[&str]) -> String {
    let mut joined = String::from("/");
    for piece in pieces {
        let trimmed = piece.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(trimmed);
    }
    if pieces.last().is_some_and(|p| p.ends_with('/')) && !joined.ends_with('/') {
        joined.push('/');
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_path_join() {
        assert_eq!(url_path_join(&["/", "connect-jupyterlab"]), "/connect-jupyterlab");
        assert_eq!(url_path_join(&["/base/", "/ui", "123", "/"]), "/base/ui/123/");
        assert_eq!(url_path_join(&["", "publish"]), "/publish");
        assert_eq!(url_path_join(&["/"]), "/");
        assert_eq!(url_path_join(&[]), "/");
    }

    #[test]
    fn test_mount_path() {
        let config = ProxyConfig::default();
        assert_eq!(config.mount_path(), "/connect-jupyterlab");

        let nested = ProxyConfig {
            base_url: "/user/alice/".into(),
            ..Default::default()
        };
        assert_eq!(nested.mount_path(), "/user/alice/connect-jupyterlab");
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.executable, PathBuf::from("connect-client"));
        assert_eq!(config.target, "dogfood");
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.launch_timeout, Duration::from_secs(30));
    }
}
