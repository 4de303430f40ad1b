use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::InstanceId;

const HISTORY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
	Good,
	Warning,
	Error,
	Disabled,
}

/// Statuses the supervisor itself reports while moving an instance through
/// its lifecycle. Modules may report their own once they are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
	Starting,
	Initializing,
	Crashed,
	Stopped,
	Disabled,
	UnknownModule,
	UnknownModuleVersion,
}

impl LifecycleStatus {
	pub fn level(&self) -> StatusLevel {
		match self {
			LifecycleStatus::Starting | LifecycleStatus::Initializing => StatusLevel::Warning,
			LifecycleStatus::Crashed
			| LifecycleStatus::Stopped
			| LifecycleStatus::UnknownModule
			| LifecycleStatus::UnknownModuleVersion => StatusLevel::Error,
			LifecycleStatus::Disabled => StatusLevel::Disabled,
		}
	}

	pub fn message(&self) -> &'static str {
		match self {
			LifecycleStatus::Starting => "Starting",
			LifecycleStatus::Initializing => "Initializing",
			LifecycleStatus::Crashed => "Crashed",
			LifecycleStatus::Stopped => "Stopped",
			LifecycleStatus::Disabled => "Disabled",
			LifecycleStatus::UnknownModule => "Unknown module",
			LifecycleStatus::UnknownModuleVersion => "Unknown module version",
		}
	}
}

pub trait StatusReporter: Send + Sync {
	fn set_status(&self, id: &InstanceId, level: StatusLevel, message: Option<&str>);

	fn report(&self, id: &InstanceId, status: LifecycleStatus) {
		self.set_status(id, status.level(), Some(status.message()));
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
	pub level: StatusLevel,
	pub message: Option<String>,
}

/// In-memory status reporter: latest status per instance, a short history,
/// and a broadcast feed of every update.
pub struct StatusBoard {
	history: RwLock<HashMap<InstanceId, VecDeque<StatusReport>>>,
	sender: broadcast::Sender<(InstanceId, StatusReport)>,
}

impl Default for StatusBoard {
	fn default() -> Self {
		Self::new()
	}
}

impl StatusBoard {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			history: RwLock::new(HashMap::new()),
			sender,
		}
	}

	pub fn current(&self, id: &InstanceId) -> Option<StatusReport> {
		let history = self.history.read().unwrap_or_else(|p| p.into_inner());
		history.get(id).and_then(|h| h.back().cloned())
	}

	/// Messages reported for an instance, oldest first.
	pub fn messages(&self, id: &InstanceId) -> Vec<String> {
		let history = self.history.read().unwrap_or_else(|p| p.into_inner());
		history
			.get(id)
			.map(|h| h.iter().filter_map(|r| r.message.clone()).collect())
			.unwrap_or_default()
	}

	pub fn all(&self) -> HashMap<InstanceId, StatusReport> {
		let history = self.history.read().unwrap_or_else(|p| p.into_inner());
		history
			.iter()
			.filter_map(|(id, h)| h.back().map(|r| (id.clone(), r.clone())))
			.collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<(InstanceId, StatusReport)> {
		self.sender.subscribe()
	}
}

impl StatusReporter for StatusBoard {
	fn set_status(&self, id: &InstanceId, level: StatusLevel, message: Option<&str>) {
		let report = StatusReport {
			level,
			message: message.map(str::to_string),
		};
		{
			let mut history = self.history.write().unwrap_or_else(|p| p.into_inner());
			let entries = history.entry(id.clone()).or_default();
			if entries.len() >= HISTORY_LEN {
				entries.pop_front();
			}
			entries.push_back(report.clone());
		}
		let _ = self.sender.send((id.clone(), report));
	}
}
