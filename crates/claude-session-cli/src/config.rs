use anyhow::Context;
use claude_session::{
    PermissionConfig, QueryOptions, ScenarioRegistry, ToolPolicy, DEFAULT_SCENARIO,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

pub const DEFAULT_CONFIG_FILE: &str = ".claude-session.yaml";

/// `.claude-session.yaml`. Every field is optional; a missing file is the
/// default configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit Claude CLI locations, checked in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub executable_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_timeout_secs: Option<u64>,
    pub permission: PermissionSection,
    pub scripted: ScriptedSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSection {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub interrupt_on_deny: bool,
    pub default: DefaultAction,
}

/// What happens to tools on neither list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    Allow,
    #[default]
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub patterns: Vec<PatternEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub pattern: String,
    pub scenario: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&data).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_yaml::to_string(self)?;
        atomic_write(path, data.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            model: self.model.clone(),
            max_turns: self.max_turns,
            executable_paths: self.executable_paths.clone(),
            ..Default::default()
        }
    }

    pub fn permission_config(&self, override_secs: Option<u64>) -> PermissionConfig {
        match override_secs.or(self.permission_timeout_secs) {
            Some(secs) => PermissionConfig {
                timeout: Duration::from_secs(secs),
            },
            None => PermissionConfig::default(),
        }
    }

    pub fn policy(&self) -> ToolPolicy {
        ToolPolicy {
            allow: self.permission.allow.clone(),
            deny: self.permission.deny.clone(),
            default_allow: self.permission.default == DefaultAction::Allow,
            interrupt_on_deny: self.permission.interrupt_on_deny,
        }
    }

    /// Built-in scenarios with this config's default and routing applied.
    pub fn registry(&self) -> anyhow::Result<ScenarioRegistry> {
        let registry = ScenarioRegistry::new();
        if let Some(id) = &self.scripted.default {
            registry
                .set_default(id)
                .context("invalid scripted.default in config")?;
        }
        for entry in &self.scripted.patterns {
            registry
                .map_pattern(&entry.pattern, &entry.scenario)
                .context("invalid scripted.patterns entry in config")?;
        }
        Ok(registry)
    }

    /// Copy the registry's default and routing back into the config.
    pub fn store_registry(&mut self, registry: &ScenarioRegistry) {
        let default = registry.default_scenario();
        self.scripted.default = (default != DEFAULT_SCENARIO).then_some(default);
        self.scripted.patterns = registry
            .mappings()
            .into_iter()
            .map(|(pattern, scenario)| PatternEntry { pattern, scenario })
            .collect();
    }
}

/// Write via a tempfile in the same directory so a crash never leaves a
/// half-written config.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
