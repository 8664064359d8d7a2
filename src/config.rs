//! Execution configuration.
//!
//! The engine treats this as a resolved, read-only value object: discovery
//! and layering live with the caller, only a thin file loader is provided.

use std::path::PathBuf;

use eyre::Context;
use serde::{Deserialize, Serialize};

use crate::backend::{ProtocolConfig, SubprocessConfig};
use crate::engine::RateLimitPolicy;

/// Resolved configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-call timeout in milliseconds (0 disables the bound)
    pub call_timeout_ms: u64,

    /// Optional run-level timeout, checked at iteration boundaries
    pub run_timeout_ms: Option<u64>,

    /// Reaction to detected rate limits
    pub rate_limit_policy: RateLimitPolicy,

    /// Default wait when a rate limit carries no reset hint, in milliseconds
    pub rate_limit_backoff_ms: u64,

    /// Substring of result content that marks the task complete
    pub completion_marker: Option<String>,

    /// Subprocess backend settings
    pub subprocess: SubprocessConfig,

    /// Protocol backend settings
    pub protocol: ProtocolConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 300_000, // 5 minutes
            run_timeout_ms: None,
            rate_limit_policy: RateLimitPolicy::default(),
            rate_limit_backoff_ms: 60_000,
            completion_marker: None,
            subprocess: SubprocessConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ExecutionConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> eyre::Result<()> {
        if self.subprocess.program.is_empty() {
            eyre::bail!("subprocess.program cannot be empty");
        }
        if self.protocol.endpoint.is_empty() {
            eyre::bail!("protocol.endpoint cannot be empty");
        }
        if let Some(run_timeout) = self.run_timeout_ms
            && run_timeout == 0
        {
            eyre::bail!("run_timeout_ms must be > 0 when set");
        }
        Ok(())
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &PathBuf) -> eyre::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve configuration from the standard search paths.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. `.agentloop.yml` in the current directory
    /// 3. `~/.config/agentloop/agentloop.yml`
    /// 4. Default values
    pub fn load(explicit_path: Option<&PathBuf>) -> eyre::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        let project = PathBuf::from(".agentloop.yml");
        if project.exists() {
            return Self::from_file(&project);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("agentloop").join("agentloop.yml");
            if user.exists() {
                return Self::from_file(&user);
            }
        }

        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.call_timeout_ms, 300_000);
        assert!(config.run_timeout_ms.is_none());
        assert_eq!(config.rate_limit_policy, RateLimitPolicy::Wait);
        assert!(config.completion_marker.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_program() {
        let config = ExecutionConfig {
            subprocess: SubprocessConfig {
                program: String::new(),
                ..SubprocessConfig::default()
            },
            ..ExecutionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_run_timeout() {
        let config = ExecutionConfig {
            run_timeout_ms: Some(0),
            ..ExecutionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agentloop.yml");
        std::fs::write(
            &path,
            r#"
call_timeout_ms: 120000
rate_limit_policy: raise
completion_marker: "ALL TESTS PASS"
subprocess:
  program: claude
  args: ["-p"]
"#,
        )
        .unwrap();

        let config = ExecutionConfig::from_file(&path).unwrap();
        assert_eq!(config.call_timeout_ms, 120_000);
        assert_eq!(config.rate_limit_policy, RateLimitPolicy::Raise);
        assert_eq!(config.completion_marker.as_deref(), Some("ALL TESTS PASS"));
        assert_eq!(config.subprocess.args, vec!["-p".to_string()]);
        // untouched sections keep defaults
        assert_eq!(config.protocol.retries, 2);
    }

    #[test]
    fn test_from_file_missing_path() {
        let path = PathBuf::from("/nonexistent/agentloop.yml");
        assert!(ExecutionConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_load_with_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.yml");
        std::fs::write(&path, "call_timeout_ms: 1000\n").unwrap();

        let config = ExecutionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.call_timeout_ms, 1_000);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = ExecutionConfig {
            run_timeout_ms: Some(900_000),
            ..ExecutionConfig::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: ExecutionConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored.run_timeout_ms, Some(900_000));
        assert_eq!(restored.call_timeout_ms, config.call_timeout_ms);
    }
}
