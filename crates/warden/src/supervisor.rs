use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tether::{
	Inbound, IncomingCall, IpcChannel, INSTANCE_ID_ENV, MODULE_MANIFEST_ENV, MODULE_TYPE_ENV, REGISTER_CALL,
	VERIFICATION_TOKEN_ENV,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::api::ApiVersion;
use crate::backoff::restart_delay;
use crate::config::SupervisorConfig;
use crate::entry::{InstanceEntry, LiveProcess};
use crate::error::StartError;
use crate::handler::{ChildHandler, HandlerKind, InstanceSettings};
use crate::handshake::{
	parse_register, validate_register, AttemptFailure, HandshakeEvent, HandshakeState, RegisterCheck, RejectReason,
};
use crate::limiter::StartLimiter;
use crate::monitor::{ChildExit, LaunchedChild, Launcher, SpawnCommand, SpawnMonitor};
use crate::output::{DebugLog, LogLevel, LogSource};
use crate::registry::{ApiKind, ModuleRegistry};
use crate::runtime::RuntimeLocator;
use crate::status::{LifecycleStatus, StatusReporter};
use crate::types::{AuthToken, InstanceId, ModuleType, TargetState};

/// Where `init` configuration comes from. Returning `None` rejects the
/// registration and the attempt is retried with backoff.
pub trait InstanceConfigSource: Send + Sync {
	fn settings(&self, id: &InstanceId, target: &TargetState) -> Option<InstanceSettings>;
}

/// Settings held in memory, optionally with a fallback for unknown ids.
#[derive(Default)]
pub struct StaticSettings {
	settings: std::sync::RwLock<HashMap<InstanceId, InstanceSettings>>,
	fallback: Option<InstanceSettings>,
}

impl StaticSettings {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_fallback(fallback: InstanceSettings) -> Self {
		Self {
			settings: Default::default(),
			fallback: Some(fallback),
		}
	}

	pub fn insert(&self, id: InstanceId, settings: InstanceSettings) {
		let mut map = self.settings.write().unwrap_or_else(|p| p.into_inner());
		map.insert(id, settings);
	}

	pub fn remove(&self, id: &InstanceId) {
		let mut map = self.settings.write().unwrap_or_else(|p| p.into_inner());
		map.remove(id);
	}
}

impl InstanceConfigSource for StaticSettings {
	fn settings(&self, id: &InstanceId, _target: &TargetState) -> Option<InstanceSettings> {
		let map = self.settings.read().unwrap_or_else(|p| p.into_inner());
		map.get(id).cloned().or_else(|| self.fallback.clone())
	}
}

/// State other subsystems keep on behalf of a running instance, dropped
/// whenever its process goes away.
pub trait InstanceCleanup: Send + Sync {
	fn forget_definitions(&self, _id: &InstanceId) {}
	fn forget_variables(&self, _id: &InstanceId) {}
	fn clear_entity_state(&self, _id: &InstanceId) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCleanup;

impl InstanceCleanup for NoopCleanup {}

/// Collaborators the supervisor drives.
pub struct SupervisorDeps {
	pub registry: Arc<dyn ModuleRegistry>,
	pub runtimes: Arc<dyn RuntimeLocator>,
	pub status: Arc<dyn StatusReporter>,
	pub debug_log: Arc<dyn DebugLog>,
	pub settings: Arc<dyn InstanceConfigSource>,
	pub cleanup: Arc<dyn InstanceCleanup>,
	pub launcher: Arc<dyn Launcher>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
	pub id: InstanceId,
	pub module_type: Option<ModuleType>,
	pub label: Option<String>,
	pub target: Option<TargetState>,
	pub restart_count: u32,
	pub ready: bool,
	pub pid: Option<u32>,
	pub restart_pending: bool,
}

/// Keeps one child process per instance in line with its desired state.
///
/// Every instance has a mailbox worker that runs reconciliation jobs one at a
/// time. A job either stops the instance (null target) or replaces whatever
/// is running with a fresh attempt and waits for its registration handshake.
/// Spawning is throttled by a global [`StartLimiter`]. Crashes and failed
/// handshakes go through a single force-restart path with backoff.
#[derive(Clone)]
pub struct Supervisor {
	inner: Arc<Inner>,
}

struct Inner {
	config: SupervisorConfig,
	deps: SupervisorDeps,
	limiter: StartLimiter,
	instances: RwLock<HashMap<InstanceId, Arc<InstanceEntry>>>,
	/// Number of processes started and not yet fully stopped.
	live: watch::Sender<usize>,
	/// Number of entries in `instances`.
	tracked: watch::Sender<usize>,
	inspect_ports: Mutex<HashMap<InstanceId, u16>>,
	this: Weak<Inner>,
}

type Startup = oneshot::Receiver<Result<(), AttemptFailure>>;

impl Supervisor {
	pub fn new(config: SupervisorConfig, deps: SupervisorDeps) -> Self {
		let limiter = StartLimiter::new(config.start_concurrency());
		let (live, _) = watch::channel(0);
		let (tracked, _) = watch::channel(0);
		let inner = Arc::new_cyclic(|this| Inner {
			config,
			deps,
			limiter,
			instances: RwLock::new(HashMap::new()),
			live,
			tracked,
			inspect_ports: Mutex::new(HashMap::new()),
			this: this.clone(),
		});
		Self { inner }
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.inner.config
	}

	pub fn start_capacity(&self) -> usize {
		self.inner.limiter.capacity()
	}

	/// Records what should run for `id` and queues a reconciliation job.
	///
	/// A no-op when the target is unchanged and `force_restart` is false. An
	/// unknown instance with a `None` target is ignored; an unknown instance
	/// with a target always starts.
	pub async fn set_desired_state(&self, id: &InstanceId, target: Option<TargetState>, force_restart: bool) {
		self.inner.set_desired_state(id, target, force_restart).await;
	}

	pub async fn stop(&self, id: &InstanceId) {
		self.inner.set_desired_state(id, None, false).await;
	}

	/// The handler for a ready instance. `allow_initialising` also returns
	/// handlers that registered but haven't finished `init`.
	pub async fn get_ready_handle(&self, id: &InstanceId, allow_initialising: bool) -> Option<Arc<ChildHandler>> {
		let entry = self.inner.entry(id).await?;
		let state = entry.lock();
		if !state.is_ready && !(allow_initialising && state.is_initialising) {
			return None;
		}
		state.live.as_ref().map(|live| Arc::clone(&live.handler))
	}

	/// Clears every target and waits until every instance has run its final
	/// stop and no process is left, or until the configured deadline passes.
	///
	/// A job that was already starting a child when the targets were cleared
	/// finishes first; the stop queued behind it then tears that child down.
	pub async fn stop_all(&self) {
		let ids: Vec<InstanceId> = self.inner.instances.read().await.keys().cloned().collect();
		tracing::info!("stopping {} instances", ids.len());
		for id in &ids {
			self.inner.set_desired_state(id, None, false).await;
		}

		let mut tracked = self.inner.tracked.subscribe();
		let mut live = self.inner.live.subscribe();
		let drained = async {
			let removed = tracked.wait_for(|n| *n == 0).await.is_ok();
			let stopped = live.wait_for(|n| *n == 0).await.is_ok();
			removed && stopped
		};
		let deadline = self.inner.config.stop_all_timeout();
		let finished = matches!(tokio::time::timeout(deadline, drained).await, Ok(true));
		if finished {
			tracing::info!("all instances stopped");
		} else {
			let instances = *tracked.borrow();
			let processes = *live.borrow();
			tracing::warn!(instances, processes, "gave up waiting for instances to stop");
		}
	}

	pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
		let instances = self.inner.instances.read().await;
		let mut out: Vec<InstanceSnapshot> = instances
			.values()
			.map(|entry| {
				let state = entry.lock();
				InstanceSnapshot {
					id: entry.id.clone(),
					module_type: state
						.target
						.as_ref()
						.map(|t| t.module_type)
						.or(state.module_type),
					label: state.current_label.clone(),
					target: state.target.clone(),
					restart_count: state.restart_count,
					ready: state.is_ready,
					pid: state.live.as_ref().and_then(|live| live.monitor.pid()),
					restart_pending: state.crash_timer.is_some(),
				}
			})
			.collect();
		out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
		out
	}

	pub async fn restart_count(&self, id: &InstanceId) -> Option<u32> {
		let entry = self.inner.entry(id).await?;
		let count = entry.lock().restart_count;
		Some(count)
	}

	/// Number of processes currently alive, including ones still handshaking.
	pub fn live_processes(&self) -> usize {
		*self.inner.live.borrow()
	}

	pub async fn resubscribe_feedbacks(&self) {
		let mut calls = JoinSet::new();
		for (id, handler) in self.inner.ready_connections().await {
			calls.spawn(async move { (id, handler.resubscribe_feedbacks().await) });
		}
		while let Some(joined) = calls.join_next().await {
			if let Ok((id, Err(e))) = joined {
				tracing::warn!(instance = %id, "resubscribe feedbacks failed: {}", e);
			}
		}
	}

	pub async fn broadcast_variables_changed(&self, names: &[String]) {
		for (id, handler) in self.inner.ready_connections().await {
			if let Err(e) = handler.variables_changed(names) {
				tracing::warn!(instance = %id, "variables changed failed: {}", e);
			}
		}
	}

	pub async fn entity_update(&self, id: &InstanceId, entity: Value) -> bool {
		let Some(handler) = self.get_ready_handle(id, false).await else {
			return false;
		};
		match handler.entity_update(entity).await {
			Ok(()) => true,
			Err(e) => {
				tracing::warn!(instance = %id, "entity update failed: {}", e);
				false
			}
		}
	}

	pub async fn entity_delete(&self, id: &InstanceId, entity_id: &str) -> bool {
		let Some(handler) = self.get_ready_handle(id, false).await else {
			return false;
		};
		match handler.entity_delete(entity_id).await {
			Ok(()) => true,
			Err(e) => {
				tracing::warn!(instance = %id, "entity delete failed: {}", e);
				false
			}
		}
	}

	pub async fn entity_learn_options(&self, id: &InstanceId, entity: Value) -> Option<Value> {
		let handler = self.get_ready_handle(id, false).await?;
		match handler.entity_learn_options(entity).await {
			Ok(options) => Some(options),
			Err(e) => {
				tracing::warn!(instance = %id, "learn options failed: {}", e);
				None
			}
		}
	}
}

impl Inner {
	async fn entry(&self, id: &InstanceId) -> Option<Arc<InstanceEntry>> {
		self.instances.read().await.get(id).cloned()
	}

	async fn ready_connections(&self) -> Vec<(InstanceId, Arc<ChildHandler>)> {
		let instances = self.instances.read().await;
		instances
			.values()
			.filter_map(|entry| {
				let state = entry.lock();
				let live = state.live.as_ref().filter(|_| state.is_ready)?;
				(live.handler.kind().module_type() == ModuleType::Connection)
					.then(|| (entry.id.clone(), Arc::clone(&live.handler)))
			})
			.collect()
	}

	fn append(&self, id: &InstanceId, level: LogLevel, text: &str) {
		self.deps
			.debug_log
			.append_line(id, SystemTime::now(), LogSource::Supervisor, level, text);
	}

	async fn set_desired_state(&self, id: &InstanceId, target: Option<TargetState>, force_restart: bool) {
		let mut force = force_restart;
		let mut instances = self.instances.write().await;
		let entry = match instances.get(id) {
			Some(entry) => Arc::clone(entry),
			None => {
				if target.is_none() {
					return;
				}
				let (entry, mailbox) = InstanceEntry::new(id.clone());
				self.spawn_worker(&entry, mailbox);
				instances.insert(id.clone(), Arc::clone(&entry));
				self.tracked.send_replace(instances.len());
				force = true;
				entry
			}
		};

		{
			let mut state = entry.lock();
			if !force && state.target == target {
				return;
			}
			state.target = target.clone();
		}

		if let Some(target) = &target {
			self.deps.status.report(id, LifecycleStatus::Starting);
			tracing::debug!(instance = %id, module = %target.module_id, "target changed");
		}
		entry.schedule();
	}

	fn spawn_worker(&self, entry: &Arc<InstanceEntry>, mut mailbox: mpsc::UnboundedReceiver<()>) {
		let inner = self.this.clone();
		let entry = Arc::downgrade(entry);
		tokio::spawn(async move {
			while mailbox.recv().await.is_some() {
				let (Some(inner), Some(entry)) = (inner.upgrade(), entry.upgrade()) else {
					break;
				};
				entry.begin_job();
				inner.reconcile(&entry).await;
			}
		});
	}

	async fn reconcile(&self, entry: &Arc<InstanceEntry>) {
		let target = entry.lock().target.clone();
		let Some(target) = target else {
			self.stop_instance(entry, true).await;
			return;
		};

		let Some(_permit) = self.limiter.acquire().await else {
			return;
		};
		if entry.lock().target.is_none() {
			// Cleared while waiting for a slot; the queued stop takes over.
			return;
		}
		self.stop_instance(entry, false).await;

		let (attempt, startup) = match self.start_attempt(entry, &target).await {
			Ok(started) => started,
			Err(e) if e.is_retryable() => return,
			Err(e) => {
				tracing::warn!(instance = %entry.id, "{}", e);
				self.append(&entry.id, LogLevel::Error, &e.to_string());
				self.deps.status.report(&entry.id, e.status());
				return;
			}
		};
		if entry.lock().target.is_none() {
			return;
		}

		let outcome = match self.config.handshake_timeout() {
			Some(limit) => tokio::time::timeout(limit, startup).await.ok(),
			None => Some(startup.await),
		};
		match outcome {
			Some(Ok(Ok(()))) => tracing::info!(instance = %entry.id, attempt, "ready"),
			Some(Ok(Err(failure))) => tracing::debug!(instance = %entry.id, attempt, "attempt ended: {}", failure),
			Some(Err(_)) => tracing::debug!(instance = %entry.id, attempt, "attempt superseded"),
			None => {
				self.force_restart(entry, attempt, AttemptFailure::TimedOut)
					.await
			}
		}
	}

	/// Resolves everything the attempt needs, spawns the child and hands it to
	/// a driver task. The returned receiver completes when the attempt is
	/// ready or has failed.
	async fn start_attempt(
		&self,
		entry: &Arc<InstanceEntry>,
		target: &TargetState,
	) -> Result<(u64, Startup), StartError> {
		let id = &entry.id;
		let registry = &self.deps.registry;
		let runtimes = &self.deps.runtimes;

		let info = match registry
			.resolve_version(target.module_type, &target.module_id, target.version.as_deref())
			.await
		{
			Some(info) => info,
			None if registry.has_module(target.module_type, &target.module_id).await => {
				return Err(StartError::UnknownModuleVersion {
					module_id: target.module_id.clone(),
					version: target.version.clone(),
				})
			}
			None => {
				return Err(StartError::UnknownModule {
					module_type: target.module_type,
					module_id: target.module_id.clone(),
				})
			}
		};

		let runtime = &info.manifest.runtime;
		if runtime.api != ApiKind::NodejsIpc {
			return Err(StartError::UnsupportedApi {
				module_id: target.module_id.clone(),
			});
		}
		let incompatible = || StartError::IncompatibleApi {
			module_id: target.module_id.clone(),
			api: runtime.api_version.clone(),
		};
		let api: ApiVersion = runtime.api_version.parse().map_err(|_| incompatible())?;
		let kind = HandlerKind::select(target.module_type, &api)
			.filter(|kind| api.is_compatible_with(&kind.host_api()))
			.ok_or_else(incompatible)?;

		let binary = runtimes
			.resolve_runtime_binary(&runtime.runtime_type)
			.await
			.ok_or_else(|| StartError::RuntimeNotFound(runtime.runtime_type.clone()))?;
		let entrypoint = runtimes
			.resolve_entrypoint(&info)
			.await
			.ok_or_else(|| StartError::MissingEntrypoint(runtime.entrypoint.clone()))?;

		let inspect_port = if info.is_packaged { None } else { self.inspect_port(id) };
		let mut args = runtimes.build_permission_args(&info.manifest, &api, &info.base_path, inspect_port.is_some());
		if let Some(port) = inspect_port {
			args.push(format!("--inspect=127.0.0.1:{}", port));
		}
		args.push(entrypoint.display().to_string());

		let token = AuthToken::generate();
		let command = SpawnCommand {
			program: binary,
			args,
			cwd: info.base_path.clone(),
			env: vec![
				(VERIFICATION_TOKEN_ENV.to_string(), token.as_str().to_string()),
				(MODULE_MANIFEST_ENV.to_string(), info.manifest_path.display().to_string()),
				(INSTANCE_ID_ENV.to_string(), id.to_string()),
				(MODULE_TYPE_ENV.to_string(), target.module_type.as_str().to_string()),
			],
		};

		let (startup_tx, startup_rx) = oneshot::channel();
		let attempt = {
			let mut state = entry.lock();
			state.attempt += 1;
			state.token = Some(token);
			state.module_type = Some(target.module_type);
			state.current_label = Some(target.label.clone());
			state.startup = Some(startup_tx);
			state.attempt
		};
		self.append(
			id,
			LogLevel::Info,
			&format!(
				"Starting {} v{} ({} api {})",
				info.manifest.id,
				info.manifest.version,
				kind.as_str(),
				api
			),
		);

		let LaunchedChild {
			monitor,
			stdin,
			stdout,
			stderr,
		} = match self.deps.launcher.launch(&command, self.config.kill_timeout()) {
			Ok(child) => child,
			Err(e) => {
				self.force_restart(entry, attempt, AttemptFailure::SpawnFailed(e.to_string()))
					.await;
				return Err(e.into());
			}
		};

		let monitor = Arc::new(monitor);
		let (channel, inbound) = IpcChannel::open(stdout, stdin, self.config.ipc_call_timeout());
		let handler = Arc::new(ChildHandler::new(kind, id.clone(), channel));
		entry.lock().live = Some(LiveProcess {
			monitor: Arc::clone(&monitor),
			handler: Arc::clone(&handler),
		});
		self.live.send_modify(|n| *n += 1);
		tracing::info!(instance = %id, pid = ?monitor.pid(), attempt, "spawned {}", info.manifest.id);

		if let Some(stderr) = stderr {
			tokio::spawn(pump_stderr(id.clone(), stderr, Arc::clone(&self.deps.debug_log)));
		}
		tokio::spawn(drive_attempt(
			self.this.clone(),
			Arc::clone(entry),
			attempt,
			monitor,
			handler,
			inbound,
		));

		Ok((attempt, startup_rx))
	}

	/// Stable inspector port per instance, handed out from the configured base.
	fn inspect_port(&self, id: &InstanceId) -> Option<u16> {
		let base = self.config.debug_inspect_port?;
		let mut ports = self.inspect_ports.lock().unwrap_or_else(|p| p.into_inner());
		if let Some(port) = ports.get(id) {
			return Some(*port);
		}
		let port = base.checked_add(u16::try_from(ports.len()).ok()?)?;
		ports.insert(id.clone(), port);
		Some(port)
	}

	async fn on_register(
		&self,
		entry: &Arc<InstanceEntry>,
		attempt: u64,
		handler: &ChildHandler,
		call: IncomingCall,
		state: HandshakeState,
	) -> HandshakeState {
		let id = &entry.id;
		let state = state.on(HandshakeEvent::RegisterReceived);
		if state.is_terminal() {
			return self
				.reject(entry, attempt, call, RejectReason::DuplicateRegister, state)
				.await;
		}

		let checked = {
			let guard = entry.lock();
			if guard.is_current(attempt) {
				let check = RegisterCheck {
					instance: id,
					token: guard.token.as_ref(),
					host_api: handler.kind().host_api(),
				};
				let verdict = parse_register(call.payload.clone()).and_then(|msg| validate_register(&msg, &check));
				Some((verdict, guard.target.clone()))
			} else {
				None
			}
		};
		let Some((verdict, target)) = checked else {
			call.reply_err("stale attempt");
			return state.on(HandshakeEvent::Stop);
		};

		let accepted = verdict.and_then(|api| {
			let target = target.as_ref().ok_or(RejectReason::MissingConfig)?;
			let settings = self
				.deps
				.settings
				.settings(id, target)
				.ok_or(RejectReason::MissingConfig)?;
			Ok((api, target.label.clone(), settings))
		});
		let (api, label, settings) = match accepted {
			Ok(accepted) => accepted,
			Err(reason) => return self.reject(entry, attempt, call, reason, state).await,
		};

		{
			let mut guard = entry.lock();
			if !guard.is_current(attempt) {
				drop(guard);
				call.reply_err("stale attempt");
				return state.on(HandshakeEvent::Stop);
			}
			guard.is_initialising = true;
		}
		call.reply_ok(Value::Null);
		let state = state.on(HandshakeEvent::Accepted);
		self.deps.status.report(id, LifecycleStatus::Initializing);
		self.append(id, LogLevel::Info, &format!("Registered with api {}", api));

		match handler.init(&label, &settings).await {
			Ok(()) => {
				let startup = {
					let mut guard = entry.lock();
					if !guard.is_current(attempt) {
						return state.on(HandshakeEvent::Stop);
					}
					guard.restart_count = 0;
					guard.recently_crashed = false;
					guard.cancel_crash_timer();
					guard.is_initialising = false;
					guard.is_ready = true;
					guard.startup.take()
				};
				if let Err(e) = handler.ready().await {
					tracing::warn!(instance = %id, "ready hook failed: {}", e);
				}
				if let Some(startup) = startup {
					let _ = startup.send(Ok(()));
				}
				self.append(id, LogLevel::Info, "Ready");
				state.on(HandshakeEvent::InitSucceeded)
			}
			Err(e) => {
				let message = e.to_string();
				let state = state.on(HandshakeEvent::InitFailed(message.clone()));
				self.force_restart(entry, attempt, AttemptFailure::InitFailed(message))
					.await;
				state
			}
		}
	}

	async fn reject(
		&self,
		entry: &Arc<InstanceEntry>,
		attempt: u64,
		call: IncomingCall,
		reason: RejectReason,
		state: HandshakeState,
	) -> HandshakeState {
		call.reply_err(reason.to_string());
		let state = state.on(HandshakeEvent::Rejected(reason));
		self.force_restart(entry, attempt, AttemptFailure::Rejected(reason))
			.await;
		state
	}

	/// Tears down a failed attempt and schedules a retry with backoff. Does
	/// nothing if `attempt` is no longer the instance's current attempt.
	async fn force_restart(&self, entry: &Arc<InstanceEntry>, attempt: u64, failure: AttemptFailure) {
		let id = &entry.id;
		let (live, startup, restarts) = {
			let mut state = entry.lock();
			if !state.is_current(attempt) {
				return;
			}
			let (live, startup) = state.detach();
			state.restart_count += 1;
			state.recently_crashed = true;
			if state.crash_timer.is_none() && state.target.is_some() {
				let delay = restart_delay(state.restart_count);
				state.crash_timer = Some(self.schedule_restart(id.clone(), delay));
			}
			(live, startup, state.restart_count)
		};

		tracing::warn!(instance = %id, restarts, "{}", failure);
		self.append(id, LogLevel::Error, &failure.to_string());
		self.deps.status.report(id, LifecycleStatus::Crashed);

		if let Some(startup) = startup {
			let _ = startup.send(Err(failure));
		}
		if let Some(live) = live {
			self.teardown(live).await;
			self.forget(id);
		}
	}

	fn schedule_restart(&self, id: InstanceId, delay: Duration) -> JoinHandle<()> {
		let inner = self.this.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let Some(inner) = inner.upgrade() else {
				return;
			};
			let Some(entry) = inner.entry(&id).await else {
				return;
			};
			let target = {
				let mut state = entry.lock();
				state.crash_timer = None;
				state.target.clone()
			};
			tracing::debug!(instance = %id, "restarting after {:?}", delay);
			inner.set_desired_state(&id, target, true).await;
		})
	}

	/// Stops whatever is running for the instance. With `allow_delete` this is
	/// the final stop: the terminal status is reported and the entry goes
	/// away if nothing else is queued for it.
	async fn stop_instance(&self, entry: &Arc<InstanceEntry>, allow_delete: bool) {
		let id = &entry.id;
		let (live, crashed) = {
			let mut state = entry.lock();
			state.cancel_crash_timer();
			let (live, _startup) = state.detach();
			(live, state.recently_crashed)
		};

		if let Some(live) = live {
			if live.monitor.exit_status().is_none() {
				if let Err(e) = live.handler.destroy().await {
					tracing::debug!(instance = %id, "destroy failed: {}", e);
				}
			}
			self.teardown(live).await;
			self.forget(id);
		}

		if allow_delete {
			let status = if crashed {
				LifecycleStatus::Stopped
			} else {
				LifecycleStatus::Disabled
			};
			self.append(id, LogLevel::Info, status.message());
			self.deps.status.report(id, status);
			self.remove_if_idle(entry).await;
		}
	}

	async fn teardown(&self, live: LiveProcess) {
		live.handler.cleanup();
		if let Some(exit) = live.monitor.stop().await {
			tracing::debug!(instance = %live.handler.instance(), "stopped ({})", exit);
		}
		self.live.send_modify(|n| *n = n.saturating_sub(1));
	}

	fn forget(&self, id: &InstanceId) {
		let cleanup = &self.deps.cleanup;
		cleanup.forget_definitions(id);
		cleanup.forget_variables(id);
		cleanup.clear_entity_state(id);
	}

	async fn remove_if_idle(&self, entry: &Arc<InstanceEntry>) {
		let mut instances = self.instances.write().await;
		let idle = !entry.has_pending_job() && entry.lock().target.is_none();
		let same = instances
			.get(&entry.id)
			.is_some_and(|current| Arc::ptr_eq(current, entry));
		if idle && same {
			instances.remove(&entry.id);
			self.tracked.send_replace(instances.len());
			tracing::debug!(instance = %entry.id, "removed");
		}
	}
}

/// Listens to one attempt's child until it exits or the attempt is replaced.
async fn drive_attempt(
	inner: Weak<Inner>,
	entry: Arc<InstanceEntry>,
	attempt: u64,
	monitor: Arc<SpawnMonitor>,
	handler: Arc<ChildHandler>,
	mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
	let mut state = HandshakeState::Spawning.on(HandshakeEvent::Spawned);
	let mut exit = monitor.subscribe_exit();
	let mut inbound_open = true;

	loop {
		tokio::select! {
			msg = inbound.recv(), if inbound_open => {
				let Some(inner) = inner.upgrade() else {
					return;
				};
				match msg {
					None => inbound_open = false,
					Some(Inbound::Output(line)) => {
						inner
							.deps
							.debug_log
							.append_line(&entry.id, SystemTime::now(), LogSource::Console, LogLevel::Info, &line);
					}
					Some(Inbound::Call(call)) if call.name == REGISTER_CALL => {
						state = inner.on_register(&entry, attempt, &handler, call, state).await;
						if state.is_terminal() {
							return;
						}
					}
					Some(Inbound::Call(call)) if state.is_registered() => {
						handler.handle_call(call, inner.deps.debug_log.as_ref(), inner.deps.status.as_ref());
					}
					Some(Inbound::Call(call)) => {
						tracing::debug!(instance = %entry.id, "call {} before registering", call.name);
						call.reply_err("not registered");
					}
				}
			}
			result = async { exit.wait_for(Option::is_some).await.ok().and_then(|r| *r) } => {
				let status = result.unwrap_or(ChildExit {
					code: None,
					signal: None,
				});
				state = state.on(HandshakeEvent::Exited(status));
				tracing::debug!(instance = %entry.id, attempt, "child exited ({}), now {:?}", status, state);
				if monitor.is_stopping() {
					return;
				}
				if let Some(inner) = inner.upgrade() {
					inner.force_restart(&entry, attempt, AttemptFailure::Exited(status)).await;
				}
				return;
			}
		}
	}
}

async fn pump_stderr(id: InstanceId, stderr: Box<dyn AsyncRead + Send + Unpin>, log: Arc<dyn DebugLog>) {
	let mut lines = BufReader::new(stderr).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		log.append_line(&id, SystemTime::now(), LogSource::Stderr, LogLevel::Warn, &line);
	}
}
