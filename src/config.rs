//! Orchestrator configuration: the typed record produced from
//! `.kittify/agents.yaml`, plus default-configuration synthesis from
//! installed-agent detection.
//!
//! The on-disk YAML is mapped to [`AgentsFile`] once at load time; every
//! downstream module reads fields off the typed record rather than doing
//! dynamic key lookups against raw YAML.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_AGENT_PRIORITY: &[&str] = &[
    "claude-code",
    "codex",
    "copilot",
    "gemini",
    "qwen",
    "opencode",
    "kilocode",
    "augment",
    "cursor",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Implementation,
    Review,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Implementation => "implementation",
            Role::Review => "review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Fail,
    SameAgent,
    #[default]
    NextInList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> u32 {
    1
}
fn default_timeout_seconds() -> u64 {
    600
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            roles: vec![Role::Implementation, Role::Review],
            priority: 0,
            max_concurrent: default_max_concurrent(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// `single_agent_mode` accepts either a bare boolean or a record with an
/// explicit target agent; both forms normalize to this shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SingleAgentMode {
    pub enabled: bool,
    pub agent: Option<String>,
}

impl<'de> Deserialize<'de> for SingleAgentMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Record {
                #[serde(default)]
                enabled: bool,
                #[serde(default)]
                agent: Option<String>,
            },
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(enabled) => SingleAgentMode {
                enabled,
                agent: None,
            },
            Raw::Record { enabled, agent } => SingleAgentMode { enabled, agent },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub defaults: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub agents: HashMap<String, AgentEntry>,
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default)]
    pub max_retries: i64,
    #[serde(default)]
    pub single_agent_mode: SingleAgentMode,
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: i64,
    #[serde(default = "default_global_timeout")]
    pub global_timeout: u64,
}

fn default_version() -> String {
    "1".to_string()
}
fn default_global_concurrency() -> i64 {
    4
}
fn default_global_timeout() -> u64 {
    3600 * 6
}

/// The validated, load-once configuration consumed by every other component.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub file: AgentsFile,
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<(Self, Vec<String>), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let file: AgentsFile =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config = OrchestratorConfig { file };
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    /// Synthesize a default configuration from the subset of
    /// [`DEFAULT_AGENT_PRIORITY`] that was found installed on PATH.
    pub fn synthesize(installed: &[String]) -> Result<(Self, Vec<String>), ConfigError> {
        if installed.is_empty() {
            return Err(ConfigError::NoAgentsInstalled);
        }
        let mut agents = HashMap::new();
        let mut order = Vec::new();
        for (priority, id) in DEFAULT_AGENT_PRIORITY.iter().enumerate() {
            if installed.iter().any(|i| i == id) {
                agents.insert(
                    id.to_string(),
                    AgentEntry {
                        enabled: true,
                        roles: vec![Role::Implementation, Role::Review],
                        priority: priority as u32,
                        max_concurrent: default_max_concurrent(),
                        timeout_seconds: default_timeout_seconds(),
                    },
                );
                order.push(id.to_string());
            }
        }
        let mut defaults = HashMap::new();
        defaults.insert("implementation".to_string(), order.clone());
        defaults.insert("review".to_string(), order);

        let file = AgentsFile {
            version: default_version(),
            defaults,
            agents,
            fallback_strategy: FallbackStrategy::default(),
            max_retries: 2,
            single_agent_mode: SingleAgentMode::default(),
            global_concurrency: default_global_concurrency(),
            global_timeout: default_global_timeout(),
        };
        let config = OrchestratorConfig { file };
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    /// Validates the loaded record, returning recoverable warnings and
    /// erroring on the rules that must hold for the run to start at all.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        for (role, ids) in &self.file.defaults {
            for id in ids {
                if !self.file.agents.contains_key(id) {
                    return Err(ConfigError::UnknownDefaultAgent {
                        role: role.clone(),
                        agent_id: id.clone(),
                    });
                }
            }
        }

        if self.file.single_agent_mode.enabled {
            match &self.file.single_agent_mode.agent {
                Some(agent_id) => {
                    let ok = self
                        .file
                        .agents
                        .get(agent_id)
                        .map(|a| a.enabled)
                        .unwrap_or(false);
                    if !ok {
                        return Err(ConfigError::InvalidSingleAgent {
                            agent_id: agent_id.clone(),
                        });
                    }
                }
                None => {
                    return Err(ConfigError::InvalidSingleAgent {
                        agent_id: "<unspecified>".to_string(),
                    });
                }
            }
        }

        if self.file.max_retries < 0 {
            return Err(ConfigError::InvalidMaxRetries {
                value: self.file.max_retries,
            });
        }

        if self.file.global_concurrency < 1 {
            return Err(ConfigError::InvalidGlobalConcurrency {
                value: self.file.global_concurrency,
            });
        }

        for (id, entry) in &self.file.agents {
            if entry.enabled && entry.max_concurrent == 0 {
                warnings.push(format!(
                    "agent '{id}' is enabled but max_concurrent is 0, so it can never run"
                ));
            }
        }

        Ok(warnings)
    }

    /// The ordered preference list for a role: the `defaults` entry if
    /// present, otherwise every enabled agent declaring the role, sorted by
    /// ascending priority.
    pub fn preference_list(&self, role: Role) -> Vec<String> {
        if let Some(ids) = self.file.defaults.get(role.as_str()) {
            return ids.clone();
        }
        let mut candidates: Vec<(&String, &AgentEntry)> = self
            .file
            .agents
            .iter()
            .filter(|(_, a)| a.enabled && a.roles.contains(&role))
            .collect();
        candidates.sort_by_key(|(_, a)| a.priority);
        candidates.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.file.agents.get(agent_id)
    }

    pub fn max_retries(&self) -> u32 {
        self.file.max_retries.max(0) as u32
    }

    pub fn global_concurrency(&self) -> usize {
        self.file.global_concurrency.max(1) as usize
    }

    /// A short digest of the effective config, stored in `OrchestrationRun`
    /// for advisory drift detection between pause and resume.
    pub fn config_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let serialized = serde_json::to_vec(&self.file).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
version: "1"
defaults:
  implementation: [claude-code, codex]
  review: [codex, claude-code]
agents:
  claude-code:
    enabled: true
    roles: [implementation, review]
    priority: 0
    max_concurrent: 2
    timeout_seconds: 600
  codex:
    enabled: true
    roles: [implementation, review]
    priority: 1
    max_concurrent: 1
    timeout_seconds: 300
fallback_strategy: next_in_list
max_retries: 2
single_agent_mode: false
global_concurrency: 3
global_timeout: 7200
"#
    }

    #[test]
    fn loads_and_validates_well_formed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();
        let (config, warnings) = OrchestratorConfig::load(&path).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.global_concurrency(), 3);
        assert_eq!(config.max_retries(), 2);
        assert_eq!(
            config.preference_list(Role::Implementation),
            vec!["claude-code".to_string(), "codex".to_string()]
        );
    }

    #[test]
    fn rejects_unknown_default_agent() {
        let yaml = r#"
defaults:
  implementation: [ghost]
agents: {}
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, yaml).unwrap();
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultAgent { .. }));
    }

    #[test]
    fn rejects_negative_max_retries() {
        let yaml = "max_retries: -1\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, yaml).unwrap();
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMaxRetries { .. }));
    }

    #[test]
    fn rejects_zero_global_concurrency() {
        let yaml = "global_concurrency: 0\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, yaml).unwrap();
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGlobalConcurrency { .. }));
    }

    #[test]
    fn single_agent_mode_accepts_bare_bool() {
        let yaml = "single_agent_mode: true\nagents: {}\n";
        let parsed: AgentsFile = serde_yaml::from_str(yaml).unwrap();
        assert!(parsed.single_agent_mode.enabled);
        assert_eq!(parsed.single_agent_mode.agent, None);
    }

    #[test]
    fn single_agent_mode_record_requires_valid_agent() {
        let yaml = r#"
single_agent_mode:
  enabled: true
  agent: claude-code
agents:
  claude-code:
    enabled: true
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, yaml).unwrap();
        let (config, _) = OrchestratorConfig::load(&path).unwrap();
        assert!(config.file.single_agent_mode.enabled);
    }

    #[test]
    fn synthesize_uses_fixed_priority_among_installed() {
        let installed = vec!["cursor".to_string(), "claude-code".to_string()];
        let (config, _) = OrchestratorConfig::synthesize(&installed).unwrap();
        assert_eq!(
            config.preference_list(Role::Implementation),
            vec!["claude-code".to_string(), "cursor".to_string()]
        );
    }

    #[test]
    fn synthesize_with_no_installed_agents_errors() {
        let err = OrchestratorConfig::synthesize(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::NoAgentsInstalled));
    }

    #[test]
    fn config_hash_is_stable_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();
        let (c1, _) = OrchestratorConfig::load(&path).unwrap();
        let (c2, _) = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(c1.config_hash(), c2.config_hash());
    }
}
