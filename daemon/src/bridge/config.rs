// Environment configuration for the bridge daemon
// Handles the listen address, credentials, runner pacing and the PID file location

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::runner::DEFAULT_STEP_DELAY;
use super::validation::validate_number;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3210;

/// Upper bound for `AGENT_BRIDGE_STEP_DELAY_MS` (one minute)
const MAX_STEP_DELAY_MS: f64 = 60_000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Configuration for the daemon
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind (loopback by default)
    pub host: String,
    pub port: u16,
    /// Shared secret non-extension callers must present as a bearer token
    pub shared_secret: Option<String>,
    /// Only this browser extension id is trusted, when set
    pub allowed_extension_id: Option<String>,
    /// Pause per simulated runner step
    pub step_delay: Duration,
    /// Directory for runtime files (PID)
    pub runtime_dir: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
    /// Reported by `GET /health`
    pub version: String,
    pub git_branch: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset so `AGENT_BRIDGE_SECRET=` disables the secret
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match var("AGENT_BRIDGE_PORT") {
            Some(raw) => parse_number("AGENT_BRIDGE_PORT", &raw, 1.0, u16::MAX as f64)? as u16,
            None => DEFAULT_PORT,
        };

        let step_delay = match var("AGENT_BRIDGE_STEP_DELAY_MS") {
            Some(raw) => Duration::from_millis(parse_number(
                "AGENT_BRIDGE_STEP_DELAY_MS",
                &raw,
                0.0,
                MAX_STEP_DELAY_MS,
            )? as u64),
            None => DEFAULT_STEP_DELAY,
        };

        // AGENT_BRIDGE_DIR overrides the runtime directory
        let runtime_dir = var("AGENT_BRIDGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_runtime_dir(var("XDG_RUNTIME_DIR")));

        let git_branch = var("AGENT_BRIDGE_GIT_BRANCH")
            .or_else(detect_git_branch)
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            host: var("AGENT_BRIDGE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            shared_secret: var("AGENT_BRIDGE_SECRET"),
            allowed_extension_id: var("AGENT_BRIDGE_EXTENSION_ID"),
            step_delay,
            pid_file: runtime_dir.join("daemon.pid"),
            runtime_dir,
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_branch,
        })
    }

    /// Get the default runtime directory (PID file)
    fn default_runtime_dir(xdg_runtime_dir: Option<String>) -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            // Linux: prefer XDG_RUNTIME_DIR if set, else fall back to the home dir
            if let Some(runtime_dir) = xdg_runtime_dir {
                return PathBuf::from(runtime_dir).join("agent-bridge");
            }
        }

        #[cfg(not(target_os = "linux"))]
        let _ = xdg_runtime_dir;

        // All platforms: ~/.agent-bridge/ (or /tmp/agent-bridge if home unavailable)
        dirs::home_dir()
            .map(|h| h.join(".agent-bridge"))
            .unwrap_or_else(|| PathBuf::from("/tmp/agent-bridge"))
    }

    /// `host:port` to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ensure the runtime directory exists with owner-only permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    /// Check if a process with the stored PID is still running
    #[cfg(unix)]
    pub fn is_daemon_running(&self) -> bool {
        match self.read_pid() {
            // Signal 0 only checks that the process exists
            Some(pid) if pid != std::process::id() => unsafe { libc::kill(pid as i32, 0) == 0 },
            _ => false,
        }
    }

    // TODO(windows): Check the stored PID with OpenProcess
    #[cfg(not(unix))]
    pub fn is_daemon_running(&self) -> bool {
        false
    }
}

fn parse_number(var: &'static str, raw: &str, min: f64, max: f64) -> Result<f64, ConfigError> {
    let value = Value::String(raw.to_string());
    let n = validate_number(Some(&value), var, min, max).map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })?;
    if n.fract() != 0.0 {
        return Err(ConfigError::Invalid {
            var,
            reason: format!("{} must be a whole number", var),
        });
    }
    Ok(n)
}

/// Current branch of the working directory's git checkout, if any
fn detect_git_branch() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty()).then_some(branch)
}
