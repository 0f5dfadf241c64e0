//! Server configuration: TOML file + CLI overrides.

use crate::session::{SpawnConfig, DEFAULT_BUFFER_CAPACITY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabgate_core::{GatewayError, GatewayResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub assistant: AssistantSection,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub transcript: TranscriptSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Seconds an idle, detached tab binding is kept.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_frame_bytes: default_max_frame_bytes(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// `[assistant]` section: how the assistant binary is launched.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub default_working_directory: Option<String>,
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            allowed_tools: Vec::new(),
            default_working_directory: None,
        }
    }
}

/// `[buffer]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferSection {
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
        }
    }
}

/// `[transcript]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptSection {
    #[serde(default = "default_transcript_dir")]
    pub dir: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TranscriptSection {
    fn default() -> Self {
        Self {
            dir: default_transcript_dir(),
            enabled: true,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_program() -> String {
    "claude".to_string()
}
fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}
fn default_transcript_dir() -> String {
    "~/.tabgate/transcripts".to_string()
}
fn default_true() -> bool {
    true
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub program: Option<String>,
    pub working_directory: Option<String>,
    pub idle_timeout: Option<u64>,
    pub buffer_capacity: Option<usize>,
    pub transcript_dir: Option<String>,
    pub no_transcript: bool,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
    pub idle_timeout: Duration,
    pub spawn: SpawnConfig,
    pub default_working_directory: PathBuf,
    pub buffer_capacity: usize,
    /// `None` when transcripts are disabled.
    pub transcript_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, cli))
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> Self {
        let default_working_directory = cli
            .working_directory
            .or(file.assistant.default_working_directory)
            .map(|d| expand_tilde_str(&d))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let transcript_dir = if cli.no_transcript || !file.transcript.enabled {
            None
        } else {
            let dir = cli.transcript_dir.unwrap_or(file.transcript.dir);
            Some(expand_tilde_str(&dir))
        };

        Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            max_frame_bytes: file.server.max_frame_bytes,
            idle_timeout: Duration::from_secs(cli.idle_timeout.unwrap_or(file.server.idle_timeout)),
            spawn: SpawnConfig {
                program: cli.program.unwrap_or(file.assistant.program),
                base_args: file.assistant.args,
                allowed_tools: file.assistant.allowed_tools,
            },
            default_working_directory,
            buffer_capacity: cli.buffer_capacity.unwrap_or(file.buffer.capacity),
            transcript_dir,
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str(content).map_err(|e| GatewayError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
