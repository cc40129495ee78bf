//! Configuration from TOML or environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::multiplexer::StatusPolicy;
use crate::session::BusyPolicy;

/// Default host address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port number
pub const DEFAULT_PORT: u16 = 6777;

/// Maximum number of WebSocket connections
pub const MAX_WS_CONNECTIONS: usize = 100;

/// WebSocket heartbeat interval in seconds
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Maximum inbound WebSocket message size (constraint documents are small)
pub const MAX_WS_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Placeholder in engine arguments replaced by the server's start-up directory
pub const ROOT_PLACEHOLDER: &str = "{root}";

/// Default SPARQL endpoint handed to the engine
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080/sparql";

/// Default result artifact written by the engine
pub const DEFAULT_ARTIFACT: &str = "report.log";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP/WebSocket listener
    pub server: ServerConfig,

    /// External validation engine
    pub engine: EngineConfig,

    /// Job workspaces
    pub storage: StorageConfig,

    /// Per-connection behaviour
    pub session: SessionConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Allowed CORS origins (`"*"` allows any)
    pub cors_origins: Vec<String>,

    /// Maximum WebSocket connections
    pub max_ws_connections: usize,

    /// WebSocket heartbeat interval in seconds
    pub ws_heartbeat_interval_secs: u64,

    /// Maximum inbound message size in bytes
    pub max_message_size: usize,

    /// Log level for tracing
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: vec!["*".to_string()],
            max_ws_connections: MAX_WS_CONNECTIONS,
            ws_heartbeat_interval_secs: WS_HEARTBEAT_INTERVAL_SECS,
            max_message_size: MAX_WS_MESSAGE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address for the server
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("Invalid address: {}", e))
    }

    /// Get the WebSocket URL
    ///
    /// # Returns
    ///
    /// Formatted WebSocket URL (e.g., "ws://127.0.0.1:6777/ws")
    #[must_use]
    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// External engine invocation
///
/// The engine is called as `program args... <staged input> <endpoints>...` with the
/// job workspace as its working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable (looked up on `PATH` when not absolute)
    pub program: String,

    /// Fixed leading arguments; `{root}` expands to the start-up directory
    pub args: Vec<String>,

    /// Query service URLs appended after the staged input path
    pub endpoints: Vec<String>,

    /// Result files harvested from the job workspace, in emission order
    pub artifacts: Vec<String>,

    /// How exit signals map to a terminal status
    pub status_policy: StatusPolicy,

    /// Kill the engine after this many seconds
    pub job_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec![
                "--enable-preview".to_string(),
                "-cp".to_string(),
                "{root}/build/jars/:{root}/build/jars/*".to_string(),
                "ifis.App".to_string(),
            ],
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            artifacts: vec![DEFAULT_ARTIFACT.to_string()],
            status_policy: StatusPolicy::default(),
            job_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Build the argument vector for one job
    ///
    /// # Arguments
    ///
    /// * `root` - Directory substituted for `{root}`
    /// * `input` - Path of the staged constraint document
    #[must_use]
    pub fn launch_args(&self, root: &Path, input: &Path) -> Vec<String> {
        let root = root.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(ROOT_PLACEHOLDER, &root))
            .chain(std::iter::once(input.to_string_lossy().to_string()))
            .chain(self.endpoints.iter().cloned())
            .collect()
    }
}

/// Job workspace storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which every job gets its own subdirectory
    pub work_dir: PathBuf,

    /// Keep job directories after artifacts are harvested
    pub retain_job_dirs: bool,

    /// Job directories older than this are removed at start-up
    pub stale_job_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./tmp/jobs"),
            retain_job_dirs: false,
            stale_job_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Per-connection behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// What to do with a submission while a job is running
    pub busy_policy: BusyPolicy,

    /// Kill the running engine when the client disconnects
    pub cancel_on_disconnect: bool,

    /// Outbound message buffer per connection
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::default(),
            cancel_on_disconnect: true,
            outbound_buffer: 256,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns the default configuration when the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables:
    /// - `LEVALIDEUR_HOST` - Server host
    /// - `LEVALIDEUR_PORT` - Server port
    /// - `LEVALIDEUR_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
    /// - `LEVALIDEUR_WORK_DIR` - Job workspace root
    /// - `LEVALIDEUR_ENDPOINT` - Replaces the engine endpoint list with one URL
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Ok(host) = std::env::var("LEVALIDEUR_HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("LEVALIDEUR_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(log_level) = std::env::var("LEVALIDEUR_LOG_LEVEL") {
            self.server.log_level = log_level;
        }

        if let Ok(work_dir) = std::env::var("LEVALIDEUR_WORK_DIR") {
            self.storage.work_dir = PathBuf::from(work_dir);
        }

        if let Ok(endpoint) = std::env::var("LEVALIDEUR_ENDPOINT") {
            self.engine.endpoints = vec![endpoint];
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }

        if self.server.max_ws_connections == 0 {
            return Err("Max WebSocket connections must be greater than zero".to_string());
        }

        if self.server.ws_heartbeat_interval_secs == 0 {
            return Err("Heartbeat interval must be greater than zero".to_string());
        }

        match self.server.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.server.log_level
                ));
            }
        }

        if self.engine.program.trim().is_empty() {
            return Err("Engine program cannot be empty".to_string());
        }

        for name in &self.engine.artifacts {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(format!("Artifact must be a bare file name: {:?}", name));
            }
        }

        if self.engine.job_timeout_secs == Some(0) {
            return Err("Job timeout must be greater than zero".to_string());
        }

        if self.session.outbound_buffer == 0 {
            return Err("Outbound buffer must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, 6777);
        assert_eq!(config.engine.program, "java");
        assert_eq!(config.engine.endpoints, vec![DEFAULT_ENDPOINT.to_string()]);
        assert_eq!(config.engine.artifacts, vec!["report.log".to_string()]);
        assert!(config.session.cancel_on_disconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_launch_args_order() {
        let engine = EngineConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "{root}/run.sh".to_string()],
            endpoints: vec!["http://a/sparql".to_string(), "http://b/sparql".to_string()],
            ..EngineConfig::default()
        };

        let args = engine.launch_args(Path::new("/srv/app"), Path::new("/jobs/j1/constraint.ttl"));
        assert_eq!(
            args,
            vec![
                "-c",
                "/srv/app/run.sh",
                "/jobs/j1/constraint.ttl",
                "http://a/sparql",
                "http://b/sparql",
            ]
        );
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = Config::load(dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("levalideur.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9000

[engine]
program = "/opt/engine/run"
args = []
artifacts = ["report.log", "targets_valid.log"]
status_policy = "strict"
job_timeout_secs = 120

[session]
busy_policy = "replace"
"#,
        )
        .expect("write");

        let config = Config::load(&path).expect("load");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.engine.program, "/opt/engine/run");
        assert_eq!(config.engine.artifacts.len(), 2);
        assert_eq!(config.engine.status_policy, StatusPolicy::Strict);
        assert_eq!(config.engine.job_timeout_secs, Some(120));
        assert_eq!(config.session.busy_policy, BusyPolicy::Replace);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[server\nport = ").expect("write");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_artifact_paths() {
        let mut config = Config::default();
        config.engine.artifacts = vec!["../etc/passwd".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.server.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.engine.job_timeout_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_websocket_url() {
        let config = ServerConfig {
            host: "localhost".to_string(),
            port: 3000,
            ..Default::default()
        };
        assert_eq!(config.websocket_url(), "ws://localhost:3000/ws");
        assert!(ServerConfig::default().socket_addr().is_ok());
    }
}
