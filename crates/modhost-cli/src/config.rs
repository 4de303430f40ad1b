use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use warden::{InstanceId, InstanceSettings, LogSettings, ModuleType, SupervisorConfig, TargetState};

// ── Host config (~/.config/modhost/config.toml) ─────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostConfig {
	#[serde(default)]
	pub supervisor: HostSupervisorConfig,
	#[serde(default)]
	pub logs: LogsConfig,
	#[serde(default)]
	pub instances: BTreeMap<String, InstanceConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostSupervisorConfig {
	pub modules_dir: Option<PathBuf>,
	pub runtimes_dir: Option<PathBuf>,
	#[serde(flatten)]
	pub tuning: SupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
	pub dir: Option<PathBuf>,
	#[serde(default = "default_max_size")]
	pub max_size_bytes: u64,
	#[serde(default = "default_max_age_days")]
	pub max_age_days: u32,
	#[serde(default = "default_max_files")]
	pub max_files: u32,
	#[serde(default = "default_ring_lines")]
	pub ring_lines: usize,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self {
			dir: None,
			max_size_bytes: default_max_size(),
			max_age_days: default_max_age_days(),
			max_files: default_max_files(),
			ring_lines: default_ring_lines(),
		}
	}
}

fn default_max_size() -> u64 { 10 * 1024 * 1024 }
fn default_max_age_days() -> u32 { 7 }
fn default_max_files() -> u32 { 5 }
fn default_ring_lines() -> usize { 500 }
fn default_true() -> bool { true }

/// One `[instances.<id>]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstanceConfig {
	pub module_type: ModuleType,
	pub module_id: String,
	pub version: Option<String>,
	pub label: Option<String>,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default)]
	pub config: toml::Table,
	pub secrets: Option<toml::Table>,
}

impl InstanceConfig {
	pub fn target(&self, id: &str) -> Option<TargetState> {
		if !self.enabled {
			return None;
		}
		let label = self.label.clone().unwrap_or_else(|| id.to_string());
		Some(TargetState::new(self.module_type, &self.module_id, self.version.as_deref(), label))
	}

	pub fn settings(&self) -> InstanceSettings {
		InstanceSettings {
			config: table_to_json(&self.config),
			secrets: match self.module_type {
				ModuleType::Connection => self.secrets.as_ref().map(table_to_json),
				ModuleType::Surface => None,
			},
		}
	}
}

fn table_to_json(table: &toml::Table) -> serde_json::Value {
	serde_json::to_value(table).unwrap_or(serde_json::Value::Null)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		source: toml::de::Error,
	},
}

impl HostConfig {
	/// Reads `path`. A missing file is an empty config.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			return Ok(Self::default());
		}
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::parse(&content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(content)
	}

	pub fn modules_dir(&self) -> PathBuf {
		self.supervisor
			.modules_dir
			.clone()
			.unwrap_or_else(|| data_dir().join("modules"))
	}

	pub fn runtimes_dir(&self) -> PathBuf {
		self.supervisor
			.runtimes_dir
			.clone()
			.unwrap_or_else(|| data_dir().join("runtimes"))
	}

	pub fn log_dir(&self) -> PathBuf {
		self.logs.dir.clone().unwrap_or_else(|| state_dir().join("logs"))
	}

	pub fn log_settings(&self) -> LogSettings {
		LogSettings {
			dir: Some(self.log_dir()),
			max_file_size: self.logs.max_size_bytes,
			ring_lines: self.logs.ring_lines,
		}
	}
}

/// What changed for one instance between two configs.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceChange {
	pub id: InstanceId,
	pub target: Option<TargetState>,
	pub settings: Option<InstanceSettings>,
	/// Settings changed under a running target: the child must be restarted to
	/// see them.
	pub restart: bool,
}

/// Instances whose target or settings differ between `old` and `new`,
/// including ones that were removed.
pub fn diff(old: &HostConfig, new: &HostConfig) -> Vec<InstanceChange> {
	let mut changes = Vec::new();
	for (id, instance) in &new.instances {
		let previous = old.instances.get(id);
		if previous == Some(instance) {
			continue;
		}
		let target = instance.target(id);
		let settings = instance.settings();
		let restart = target.is_some()
			&& previous.is_some_and(|p| p.target(id) == target && p.settings() != settings);
		changes.push(InstanceChange {
			id: InstanceId::from(id.as_str()),
			target,
			settings: Some(settings),
			restart,
		});
	}
	for id in old.instances.keys() {
		if !new.instances.contains_key(id) {
			changes.push(InstanceChange {
				id: InstanceId::from(id.as_str()),
				target: None,
				settings: None,
				restart: false,
			});
		}
	}
	changes
}

// ── Paths ───────────────────────────────────────────────────────────────────

const APP_NAME: &str = "modhost";

pub fn config_dir() -> PathBuf {
	xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

pub fn data_dir() -> PathBuf {
	xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

pub fn state_dir() -> PathBuf {
	xdg_dir("XDG_STATE_HOME", &[".local", "state"])
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
	if let Ok(dir) = std::env::var(var) {
		return PathBuf::from(dir).join(APP_NAME);
	}
	match std::env::var("HOME") {
		Ok(home) => fallback
			.iter()
			.fold(PathBuf::from(home), |path, part| path.join(part))
			.join(APP_NAME),
		Err(_) => PathBuf::from("/tmp").join(APP_NAME),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::time::Duration;

	const SAMPLE: &str = r#"
[supervisor]
modules_dir = "/opt/modhost/modules"
max_concurrent_starts = 2
handshake_timeout_secs = 0

[logs]
max_files = 3

[instances.rack-a]
module_type = "connection"
module_id = "acme.switch"
version = "1.2.0"
label = "Rack A"
config = { host = "10.0.0.5", port = 9000 }
secrets = { password = "hunter2" }

[instances.deck]
module_type = "surface"
module_id = "acme.deck"
enabled = false
secrets = { ignored = true }
"#;

	#[test]
	fn parses_sections_with_defaults() {
		let config = HostConfig::parse(SAMPLE).unwrap();
		assert_eq!(config.modules_dir(), PathBuf::from("/opt/modhost/modules"));
		assert_eq!(config.supervisor.tuning.start_concurrency(), 2);
		assert_eq!(config.supervisor.tuning.handshake_timeout(), None);
		assert_eq!(config.supervisor.tuning.kill_timeout(), Duration::from_secs(5));
		assert_eq!(config.logs.max_files, 3);
		assert_eq!(config.logs.max_age_days, 7);
		assert_eq!(config.instances.len(), 2);
	}

	#[test]
	fn instance_target_and_settings() {
		let config = HostConfig::parse(SAMPLE).unwrap();
		let rack = &config.instances["rack-a"];
		let target = rack.target("rack-a").unwrap();
		assert_eq!(target.label, "Rack A");
		assert_eq!(target.version.as_deref(), Some("1.2.0"));

		let settings = rack.settings();
		assert_eq!(settings.config, json!({ "host": "10.0.0.5", "port": 9000 }));
		assert_eq!(settings.secrets, Some(json!({ "password": "hunter2" })));

		let deck = &config.instances["deck"];
		assert_eq!(deck.target("deck"), None);
		assert_eq!(deck.settings().secrets, None);
	}

	#[test]
	fn label_defaults_to_instance_id() {
		let config = HostConfig::parse(
			"[instances.panel]\nmodule_type = \"surface\"\nmodule_id = \"acme.deck\"\n",
		)
		.unwrap();
		let target = config.instances["panel"].target("panel").unwrap();
		assert_eq!(target.label, "panel");
		assert_eq!(target.version, None);
	}

	#[test]
	fn diff_reports_changes_and_removals() {
		let old = HostConfig::parse(SAMPLE).unwrap();
		let mut new = old.clone();
		new.instances.remove("deck");
		if let Some(rack) = new.instances.get_mut("rack-a") {
			rack.config.insert("port".into(), toml::Value::Integer(9001));
		}

		let changes = diff(&old, &new);
		assert_eq!(changes.len(), 2);
		assert_eq!(changes[0].id.as_str(), "rack-a");
		assert!(changes[0].restart);
		assert_eq!(changes[1].id.as_str(), "deck");
		assert_eq!(changes[1].target, None);
		assert_eq!(changes[1].settings, None);

		assert!(diff(&old, &old).is_empty());
	}

	#[test]
	fn version_change_is_not_a_forced_restart() {
		let old = HostConfig::parse(SAMPLE).unwrap();
		let mut new = old.clone();
		if let Some(rack) = new.instances.get_mut("rack-a") {
			rack.version = Some("1.3.0".into());
		}
		let changes = diff(&old, &new);
		assert_eq!(changes.len(), 1);
		assert!(!changes[0].restart);
		assert_eq!(changes[0].target.as_ref().and_then(|t| t.version.as_deref()), Some("1.3.0"));
	}

	#[test]
	fn missing_file_is_empty_config() {
		let config = HostConfig::load(Path::new("/nonexistent/modhost/config.toml")).unwrap();
		assert!(config.instances.is_empty());
	}
}
