//! Project configuration (`.speckit/speckit-flow.yaml`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{FlowError, Result};
use crate::paths;

pub const MAX_SESSIONS: usize = 10;

/// Orchestration settings: which agent to drive and how many parallel
/// sessions to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_num_sessions")]
    pub num_sessions: usize,
}

fn default_agent_type() -> String {
    "copilot".to_string()
}

fn default_num_sessions() -> usize {
    3
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            agent_type: default_agent_type(),
            num_sessions: default_num_sessions(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent_type.trim().is_empty() {
            return Err(FlowError::ConfigInvalid {
                field: "agent_type".to_string(),
                message: "must be a non-empty string".to_string(),
            });
        }
        if self.num_sessions < 1 || self.num_sessions > MAX_SESSIONS {
            return Err(FlowError::ConfigInvalid {
                field: "num_sessions".to_string(),
                message: format!("must be between 1 and {MAX_SESSIONS}"),
            });
        }
        Ok(())
    }

    /// Load and validate the config file for a repository.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = paths::config_file(repo_root);
        if !path.exists() {
            return Err(FlowError::FileNotFound { path });
        }
        let content = fs::read_to_string(&path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| FlowError::ConfigInvalid {
            field: "document".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file, falling back to defaults when absent.
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        match Self::load(repo_root) {
            Ok(config) => Ok(config),
            Err(FlowError::FileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, repo_root: &Path) -> Result<()> {
        self.validate()?;
        let path = paths::config_file(repo_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.agent_type, "copilot");
        assert_eq!(config.num_sessions, 3);
        config.validate().unwrap();
    }

    #[test]
    fn session_bounds() {
        let mut config = FlowConfig::default();
        config.num_sessions = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            FlowError::ConfigInvalid { field, .. } if field == "num_sessions"
        ));

        config.num_sessions = MAX_SESSIONS + 1;
        assert!(config.validate().is_err());

        config.num_sessions = MAX_SESSIONS;
        config.validate().unwrap();
    }

    #[test]
    fn empty_agent_rejected() {
        let config = FlowConfig {
            agent_type: "  ".to_string(),
            num_sessions: 2,
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            FlowError::ConfigInvalid { field, .. } if field == "agent_type"
        ));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let config = FlowConfig {
            agent_type: "copilot".to_string(),
            num_sessions: 5,
        };
        config.save(dir.path()).unwrap();
        assert_eq!(FlowConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FlowConfig::load(dir.path()).unwrap_err(),
            FlowError::FileNotFound { .. }
        ));
        assert_eq!(
            FlowConfig::load_or_default(dir.path()).unwrap(),
            FlowConfig::default()
        );
    }

    #[test]
    fn partial_document_uses_field_defaults() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(paths::speckit_dir(dir.path())).unwrap();
        fs::write(paths::config_file(dir.path()), "num_sessions: 2\n").unwrap();

        let config = FlowConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent_type, "copilot");
        assert_eq!(config.num_sessions, 2);
    }
}
