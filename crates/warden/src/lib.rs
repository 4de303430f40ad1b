//! # warden
//!
//! Supervisor for plugin child processes.
//!
//! Each configured instance (a device connection or a control surface) runs
//! one third-party module in its own OS process. The [`Supervisor`] keeps the
//! running set in line with the desired state: it resolves module and runtime,
//! spawns the child, authenticates it through a registration handshake, sends
//! it its configuration and restarts it with backoff when it crashes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden::{
//!     BundledRuntimes, DirectoryRegistry, InstanceId, InstanceLogs, InstanceSettings, LogSettings,
//!     ModuleType, NoopCleanup, OsLauncher, StaticSettings, StatusBoard, Supervisor,
//!     SupervisorConfig, SupervisorDeps, TargetState,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let supervisor = Supervisor::new(
//!     SupervisorConfig::default(),
//!     SupervisorDeps {
//!         registry: Arc::new(DirectoryRegistry::new("/opt/modhost/modules")),
//!         runtimes: Arc::new(BundledRuntimes::new("/opt/modhost/runtimes")),
//!         status: Arc::new(StatusBoard::new()),
//!         debug_log: Arc::new(InstanceLogs::new(LogSettings::default())),
//!         settings: Arc::new(StaticSettings::with_fallback(InstanceSettings::default())),
//!         cleanup: Arc::new(NoopCleanup),
//!         launcher: Arc::new(OsLauncher),
//!     },
//! );
//!
//! let id = InstanceId::from("rack-a");
//! let target = TargetState::new(ModuleType::Connection, "acme.switch", Some("1.2.0"), "Rack A");
//! supervisor.set_desired_state(&id, Some(target), false).await;
//!
//! // later
//! supervisor.stop_all().await;
//! # }
//! ```

pub mod api;
pub mod backoff;
pub mod config;
mod entry;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod limiter;
pub mod logs;
pub mod monitor;
pub mod output;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod supervisor;
pub mod types;

pub use api::ApiVersion;
pub use config::SupervisorConfig;
pub use error::StartError;
pub use handler::{ChildHandler, HandlerError, HandlerKind, InstanceSettings};
pub use handshake::{AttemptFailure, RejectReason};
pub use limiter::StartLimiter;
pub use monitor::{ChildExit, LaunchedChild, Launcher, MonitorError, OsLauncher, ProcessControl, SpawnCommand, SpawnMonitor};
pub use output::{DebugLog, InstanceLogs, LogLevel, LogLine, LogSettings, LogSource};
pub use registry::{DirectoryRegistry, Manifest, ModuleInfo, ModuleRegistry, RegistryError};
pub use runtime::{BundledRuntimes, RuntimeLocator};
pub use status::{LifecycleStatus, StatusBoard, StatusLevel, StatusReport, StatusReporter};
pub use supervisor::{
	InstanceCleanup, InstanceConfigSource, InstanceSnapshot, NoopCleanup, StaticSettings, Supervisor, SupervisorDeps,
};
pub use types::{AuthToken, InstanceId, ModuleType, TargetState};
