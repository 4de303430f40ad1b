use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a configured connection or surface slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for InstanceId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for InstanceId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
	Connection,
	Surface,
}

impl ModuleType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ModuleType::Connection => "connection",
			ModuleType::Surface => "surface",
		}
	}

	/// Directory under the modules root holding modules of this type.
	pub fn dir_name(&self) -> &'static str {
		match self {
			ModuleType::Connection => "connections",
			ModuleType::Surface => "surfaces",
		}
	}
}

impl fmt::Display for ModuleType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What should be running for an instance. `None` in place of a target means
/// the instance should not be running at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
	pub label: String,
	pub module_type: ModuleType,
	pub module_id: String,
	/// `None` selects the newest installed version.
	pub version: Option<String>,
}

impl TargetState {
	pub fn new(
		module_type: ModuleType,
		module_id: impl Into<String>,
		version: Option<&str>,
		label: impl Into<String>,
	) -> Self {
		Self {
			label: label.into(),
			module_type,
			module_id: module_id.into(),
			version: version.map(str::to_string),
		}
	}
}

/// Single-use secret handed to one spawn attempt. The child must echo it in
/// its registration call.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn matches(&self, candidate: &str) -> bool {
		self.0 == candidate
	}
}

impl fmt::Debug for AuthToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("AuthToken(..)")
	}
}
