use crate::status::LifecycleStatus;
use crate::types::ModuleType;

/// Reasons a reconciliation pass could not start a process.
///
/// Everything except [`StartError::Spawn`] is a configuration problem: the
/// instance stays stopped until its target state changes again. A spawn
/// failure is treated like a crash and retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
	#[error("unknown {module_type} module {module_id:?}")]
	UnknownModule {
		module_type: ModuleType,
		module_id: String,
	},
	#[error("module {module_id:?} has no version {version:?}")]
	UnknownModuleVersion {
		module_id: String,
		version: Option<String>,
	},
	#[error("module {module_id:?} uses an unsupported api")]
	UnsupportedApi { module_id: String },
	#[error("module {module_id:?} needs api {api}, which this host does not provide")]
	IncompatibleApi { module_id: String, api: String },
	#[error("runtime {0:?} is not available")]
	RuntimeNotFound(String),
	#[error("entrypoint {0:?} does not exist")]
	MissingEntrypoint(String),
	#[error(transparent)]
	Spawn(#[from] crate::monitor::MonitorError),
}

impl StartError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, StartError::Spawn(_))
	}

	/// User-visible status for a configuration error.
	pub fn status(&self) -> LifecycleStatus {
		match self {
			StartError::UnknownModule { .. } => LifecycleStatus::UnknownModule,
			StartError::Spawn(_) => LifecycleStatus::Crashed,
			_ => LifecycleStatus::UnknownModuleVersion,
		}
	}
}
