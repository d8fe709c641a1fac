//! Launching publishing agents.
//!
//! Each notebook being published gets one helper process. The helper prints
//! its connection URL (host, port and access token) as the first line of
//! stdout and then serves its UI on that port. The launcher records the agent
//! in the registry, allows its port for proxying, and hands the same URL back
//! for as long as the helper keeps running.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};

use crate::agent::{Agent, AgentRegistry, AgentSlot, PortAllowList};
use crate::config::ProxyConfig;

/// Suffixes stripped from the notebook file name to build the UI title.
const TITLE_SUFFIXES: [&str; 2] = [".ipynb", ".py"];

/// Error type for agent launches.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{executable} not found on PATH")]
    ExecutableNotFound { executable: String },

    #[error("Failed to start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("The launched process did not provide an output stream")]
    NoOutputStream,

    #[error("The launched process did not report its URL within {0:?}")]
    Timeout(Duration),

    #[error("Failed to read output of the launched process: {0}")]
    ReadOutput(#[source] std::io::Error),

    #[error("The launched process did not bind to a port (first line: {line:?})")]
    NoUrl { line: String },
}

/// Publishing parameters forwarded to the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishParams {
    pub python_path: String,
    pub python_version: String,
    pub theme: String,
}

/// Starts and tracks one agent per notebook.
pub struct AgentLauncher {
    executable: PathBuf,
    target: String,
    launch_timeout: Duration,
    /// Only held to look up a slot; launches lock the slot itself.
    registry: Mutex<AgentRegistry>,
    allowed_ports: Arc<PortAllowList>,
}

impl AgentLauncher {
    pub fn new(config: &ProxyConfig, allowed_ports: Arc<PortAllowList>) -> Self {
        Self {
            executable: config.executable.clone(),
            target: config.target.clone(),
            launch_timeout: config.launch_timeout,
            registry: Mutex::new(AgentRegistry::new()),
            allowed_ports,
        }
    }

    /// Ports allowed so far, shared with the proxy.
    pub fn allowed_ports(&self) -> &Arc<PortAllowList> {
        &self.allowed_ports
    }

    /// Number of registered agents, running or exited.
    pub async fn agent_count(&self) -> usize {
        let slots = self.registry().slots();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    fn registry(&self) -> MutexGuard<'_, AgentRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, resource_key: &Path) -> AgentSlot {
        self.registry().slot(resource_key)
    }

    /// Return the URL of the agent serving `resource_key`, starting one if
    /// none is running.
    pub async fn launch(
        &self,
        resource_key: &Path,
        params: &PublishParams,
    ) -> Result<String, LaunchError> {
        let slot = self.slot(resource_key);
        let mut current = slot.lock().await;

        if let Some(agent) = current.as_mut() {
            match agent.exit_status() {
                None => {
                    info!(
                        "[launcher] Found existing agent for {:?} at {}",
                        resource_key,
                        agent.url()
                    );
                    return Ok(agent.url().to_string());
                }
                Some(status) => {
                    info!(
                        "[launcher] Previous agent for {:?} exited ({}); starting a new one",
                        resource_key, status
                    );
                }
            }
        }
        current.take();

        let args = self.helper_args(resource_key, params);
        info!(
            "[launcher] Starting: {} {}",
            self.executable.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut process = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // From here on, returning early drops `process`, which kills it.
        let stdout = process.stdout.take().ok_or(LaunchError::NoOutputStream)?;
        let mut lines = BufReader::new(stdout).lines();

        let first_line = tokio::time::timeout(self.launch_timeout, lines.next_line())
            .await
            .map_err(|_| LaunchError::Timeout(self.launch_timeout))?
            .map_err(LaunchError::ReadOutput)?
            .unwrap_or_default();

        let url = first_line.trim().to_string();
        let port =
            parse_agent_port(&url).ok_or_else(|| LaunchError::NoUrl { line: url.clone() })?;

        tokio::spawn(drain_output(port, lines));

        self.allowed_ports.insert(port);
        info!(
            "[launcher] Agent for {:?} (pid {:?}) listening at {}",
            resource_key,
            process.id(),
            url
        );
        *current = Some(Agent::new(process, url.clone(), port));

        Ok(url)
    }

    fn helper_args(&self, resource_key: &Path, params: &PublishParams) -> Vec<OsString> {
        vec![
            "publish-ui".into(),
            resource_key.as_os_str().to_owned(),
            "--python".into(),
            params.python_path.clone().into(),
            "--python-version".into(),
            params.python_version.clone().into(),
            "--theme".into(),
            params.theme.clone().into(),
            "--title".into(),
            notebook_title(resource_key).into(),
            "-n".into(),
            self.target.clone().into(),
        ]
    }

    fn spawn_error(&self, e: std::io::Error) -> LaunchError {
        let executable = self.executable.display().to_string();
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::ExecutableNotFound { executable }
        } else {
            LaunchError::Spawn {
                executable,
                source: e,
            }
        }
    }
}

/// Human-readable title for a notebook: its file name without the notebook
/// or script extension.
pub fn notebook_title(path: &Path) -> String {
    let mut title = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    for suffix in TITLE_SUFFIXES {
        if let Some(stripped) = title.strip_suffix(suffix) {
            title = stripped.to_string();
        }
    }
    title
}

/// Extract the explicit port from an agent URL.
///
/// `Url::port` hides a port equal to the scheme default, so `:80` on an
/// `http` URL is recovered from the authority as written.
pub fn parse_agent_port(url: &str) -> Option<u16> {
    let parsed = url::Url::parse(url).ok()?;
    if let Some(port) = parsed.port() {
        return Some(port);
    }
    let default = parsed.port_or_known_default()?;
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let (_, written) = authority.rsplit_once(':')?;
    (written.parse::<u16>().ok()? == default).then_some(default)
}

/// Keep reading the helper's stdout so it never blocks on a full pipe.
async fn drain_output(port: u16, mut lines: Lines<BufReader<ChildStdout>>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[agent:{}] {}", port, line),
            Ok(None) => break,
            Err(e) => {
                debug!("[agent:{}] Output closed: {}", port, e);
                break;
            }
        }
    }
}
