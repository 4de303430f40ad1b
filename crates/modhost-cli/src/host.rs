use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use owo_colors::OwoColorize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use warden::{
	BundledRuntimes, DirectoryRegistry, InstanceLogs, InstanceSnapshot, ModuleType, NoopCleanup, OsLauncher,
	StaticSettings, StatusBoard, StatusLevel, StatusReport, Supervisor, SupervisorDeps,
};

use crate::config::{self, HostConfig};

const LOG_EXPIRY_INTERVAL: Duration = Duration::from_secs(3600);

/// A supervisor wired to the on-disk registry, plus the config last applied
/// to it.
pub struct Host {
	pub supervisor: Supervisor,
	pub status: Arc<StatusBoard>,
	settings: Arc<StaticSettings>,
	applied: HostConfig,
}

impl Host {
	/// Builds the supervisor from `config`'s supervisor and log sections. No
	/// instance runs until [`Host::apply`] is called.
	pub fn new(config: &HostConfig) -> Self {
		let status = Arc::new(StatusBoard::new());
		let settings = Arc::new(StaticSettings::new());
		let supervisor = Supervisor::new(
			config.supervisor.tuning.clone(),
			SupervisorDeps {
				registry: Arc::new(DirectoryRegistry::new(config.modules_dir())),
				runtimes: Arc::new(BundledRuntimes::new(config.runtimes_dir())),
				status: status.clone(),
				debug_log: Arc::new(InstanceLogs::new(config.log_settings())),
				settings: settings.clone(),
				cleanup: Arc::new(NoopCleanup),
				launcher: Arc::new(OsLauncher),
			},
		);
		let applied = HostConfig {
			instances: Default::default(),
			..config.clone()
		};
		Self {
			supervisor,
			status,
			settings,
			applied,
		}
	}

	/// Pushes every instance that differs from the last applied config to the
	/// supervisor.
	pub async fn apply(&mut self, config: HostConfig) {
		let changes = config::diff(&self.applied, &config);
		for change in changes {
			match change.settings {
				Some(settings) => self.settings.insert(change.id.clone(), settings),
				None => self.settings.remove(&change.id),
			}
			tracing::info!(
				instance = %change.id,
				enabled = change.target.is_some(),
				restart = change.restart,
				"applying instance"
			);
			self.supervisor
				.set_desired_state(&change.id, change.target, change.restart)
				.await;
		}

		if config.supervisor.modules_dir != self.applied.supervisor.modules_dir
			|| config.supervisor.runtimes_dir != self.applied.supervisor.runtimes_dir
		{
			tracing::warn!("module and runtime directories are only read at startup");
		}
		self.applied.instances = config.instances;
	}

	pub async fn print_status(&self) {
		let snapshots = self.supervisor.snapshot().await;
		if snapshots.is_empty() {
			println!("{}", "no instances".dimmed());
			return;
		}
		let width = snapshots.iter().map(|s| s.id.as_str().len()).max().unwrap_or(0);
		for snapshot in &snapshots {
			print_instance_line(snapshot, self.status.current(&snapshot.id), width);
		}
	}
}

fn print_instance_line(snapshot: &InstanceSnapshot, status: Option<StatusReport>, width: usize) {
	let level = status.as_ref().map(|s| s.level);
	let circle = match level {
		Some(StatusLevel::Good) => "●".green().to_string(),
		Some(StatusLevel::Warning) => "●".yellow().to_string(),
		Some(StatusLevel::Error) => "●".red().to_string(),
		Some(StatusLevel::Disabled) | None => "○".dimmed().to_string(),
	};
	let module = snapshot
		.target
		.as_ref()
		.map(|t| format!("{}@{}", t.module_id, t.version.as_deref().unwrap_or("latest")))
		.unwrap_or_else(|| "-".to_string());
	let pid = snapshot.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
	let restarts = match snapshot.restart_count {
		0 => String::new(),
		n => format!(" retry {}", n).yellow().to_string(),
	};
	let message = status.and_then(|s| s.message).unwrap_or_default();
	println!(
		"{} {:<width$} {:<24} {:<8} {}{}",
		circle,
		snapshot.id.as_str(),
		module,
		pid,
		message,
		restarts,
		width = width
	);
}

/// Runs the host in the foreground until Ctrl-C or SIGTERM.
///
/// SIGHUP re-reads `config_path` and applies the difference; SIGUSR1 prints
/// the instance table to stdout.
pub async fn run(config_path: &Path, config: HostConfig) -> std::io::Result<()> {
	let log_dir = config.log_dir();
	let (max_age_days, max_files) = (config.logs.max_age_days, config.logs.max_files);
	warden::logs::expire_logs(&log_dir, max_age_days, max_files);
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(LOG_EXPIRY_INTERVAL).await;
			warden::logs::expire_logs(&log_dir, max_age_days, max_files);
		}
	});

	let mut host = Host::new(&config);
	tracing::info!(
		modules = %config.modules_dir().display(),
		runtimes = %config.runtimes_dir().display(),
		start_slots = host.supervisor.start_capacity(),
		"host started (pid {})",
		std::process::id()
	);

	let mut updates = host.status.subscribe();
	tokio::spawn(async move {
		loop {
			match updates.recv().await {
				Ok((id, report)) => {
					let message = report.message.unwrap_or_default();
					match report.level {
						StatusLevel::Error => tracing::warn!(instance = %id, "{}", message),
						_ => tracing::info!(instance = %id, "{}", message),
					}
				}
				Err(RecvError::Lagged(n)) => tracing::debug!("status log skipped {} updates", n),
				Err(RecvError::Closed) => break,
			}
		}
	});

	host.apply(config).await;

	let mut hangup = signal(SignalKind::hangup())?;
	let mut usr1 = signal(SignalKind::user_defined1())?;
	let mut terminate = signal(SignalKind::terminate())?;
	loop {
		tokio::select! {
			_ = hangup.recv() => match HostConfig::load(config_path) {
				Ok(config) => {
					tracing::info!("reloading {}", config_path.display());
					host.apply(config).await;
				}
				Err(e) => tracing::error!("reload failed: {}", e),
			},
			_ = usr1.recv() => host.print_status().await,
			_ = terminate.recv() => break,
			_ = tokio::signal::ctrl_c() => break,
		}
	}

	tracing::info!("shutting down");
	host.supervisor.stop_all().await;
	let left = host.supervisor.live_processes();
	if left > 0 {
		tracing::warn!("{} module process(es) still running after stop timeout", left);
	}
	Ok(())
}

/// Prints every installed module and its versions, newest first.
pub async fn list_modules(config: &HostConfig) {
	let registry = DirectoryRegistry::new(config.modules_dir());
	for module_type in [ModuleType::Connection, ModuleType::Surface] {
		println!("{}", module_type.dir_name().cyan().bold());
		let modules = registry.list_modules(module_type).await;
		if modules.is_empty() {
			println!("  {}", "none".dimmed());
		}
		for (module_id, versions) in modules {
			println!("  {} {}", module_id.bold(), versions.join(", ").dimmed());
		}
	}
}
