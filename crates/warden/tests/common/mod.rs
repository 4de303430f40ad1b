#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether::{Frame, INSTANCE_ID_ENV, MODULE_TYPE_ENV, VERIFICATION_TOKEN_ENV};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use warden::registry::{ApiKind, Permissions, RuntimeManifest};
use warden::{
	ChildExit, ChildHandler, InstanceCleanup, InstanceId, InstanceLogs, InstanceSettings, LaunchedChild, Launcher,
	LogSettings, Manifest, ModuleInfo, ModuleRegistry, ModuleType, MonitorError, ProcessControl, RuntimeLocator,
	SpawnCommand, SpawnMonitor, StaticSettings, StatusBoard, Supervisor, SupervisorConfig, SupervisorDeps,
	TargetState,
};

// --- Scripted children ---

/// What a fake child does once launched.
#[derive(Debug, Clone)]
pub enum Behavior {
	/// Exits with code 1 without saying anything.
	Exit,
	/// Keeps its pipes open and never registers.
	Hang,
	/// Registers, then answers every call successfully.
	Serve,
	/// Like `Serve`, but waits before registering.
	ServeAfter(Duration),
	/// Registers with a token it made up.
	Forged,
	/// Registers, then fails `init`.
	FailInit,
	/// Sends `register` twice, then serves.
	RegisterTwice,
	/// Serves, but fails `resubscribe-feedbacks`.
	FailFeedbacks,
}

#[derive(Debug, Clone)]
pub struct Launch {
	pub at: Instant,
	pub command: SpawnCommand,
}

#[derive(Debug, Clone)]
pub struct ChildCall {
	pub instance: String,
	pub name: String,
	pub payload: Value,
}

#[derive(Default)]
struct Alive {
	per_instance: HashMap<String, usize>,
	max_per_instance: usize,
}

pub struct FakeLauncher {
	script: Mutex<VecDeque<Behavior>>,
	fallback: Behavior,
	launches: Mutex<Vec<Launch>>,
	calls: Arc<Mutex<Vec<ChildCall>>>,
	alive: Arc<Mutex<Alive>>,
}

impl FakeLauncher {
	pub fn new(fallback: Behavior) -> Self {
		Self {
			script: Mutex::new(VecDeque::new()),
			fallback,
			launches: Mutex::new(Vec::new()),
			calls: Arc::new(Mutex::new(Vec::new())),
			alive: Arc::new(Mutex::new(Alive::default())),
		}
	}

	/// Behaviours used by the next launches, in order, before the fallback.
	pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
		self.script.lock().unwrap().extend(behaviors);
	}

	pub fn launches(&self) -> Vec<Launch> {
		self.launches.lock().unwrap().clone()
	}

	pub fn launch_count(&self) -> usize {
		self.launches.lock().unwrap().len()
	}

	pub fn calls(&self, name: &str) -> Vec<ChildCall> {
		self.calls
			.lock()
			.unwrap()
			.iter()
			.filter(|c| c.name == name)
			.cloned()
			.collect()
	}

	/// Highest number of children simultaneously alive for any one instance.
	pub fn max_alive_per_instance(&self) -> usize {
		self.alive.lock().unwrap().max_per_instance
	}
}

impl Launcher for FakeLauncher {
	fn launch(&self, command: &SpawnCommand, kill_timeout: Duration) -> Result<LaunchedChild, MonitorError> {
		let behavior = self
			.script
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or_else(|| self.fallback.clone());
		self.launches.lock().unwrap().push(Launch {
			at: Instant::now(),
			command: command.clone(),
		});

		let instance = command.env_var(INSTANCE_ID_ENV).unwrap_or_default().to_string();
		let token = command.env_var(VERIFICATION_TOKEN_ENV).unwrap_or_default().to_string();
		let api = match command.env_var(MODULE_TYPE_ENV) {
			Some("surface") => "1.0.0",
			_ => "2.0.0",
		};
		{
			let mut alive = self.alive.lock().unwrap();
			let count = alive.per_instance.entry(instance.clone()).or_default();
			*count += 1;
			let count = *count;
			alive.max_per_instance = alive.max_per_instance.max(count);
		}

		let (host_stdin, child_stdin) = tokio::io::duplex(64 * 1024);
		let (child_stdout, host_stdout) = tokio::io::duplex(64 * 1024);
		let (exit_tx, exit_rx) = watch::channel(None);
		let exit = Arc::new(ExitSignal {
			tx: exit_tx,
			instance: instance.clone(),
			alive: Arc::clone(&self.alive),
		});

		let calls = Arc::clone(&self.calls);
		let child_exit = Arc::clone(&exit);
		let task = tokio::spawn(async move {
			let code = run_child(behavior, api, instance, token, child_stdin, child_stdout, calls).await;
			child_exit.set(ChildExit::code(code));
		});

		let control = FakeControl {
			exit,
			task: task.abort_handle(),
		};
		Ok(LaunchedChild {
			monitor: SpawnMonitor::new(None, exit_rx, Box::new(control), kill_timeout),
			stdin: Box::new(host_stdin),
			stdout: Box::new(host_stdout),
			stderr: None,
		})
	}
}

struct ExitSignal {
	tx: watch::Sender<Option<ChildExit>>,
	instance: String,
	alive: Arc<Mutex<Alive>>,
}

impl ExitSignal {
	fn set(&self, exit: ChildExit) {
		let first = self.tx.send_if_modified(|current| {
			if current.is_some() {
				return false;
			}
			*current = Some(exit);
			true
		});
		if first {
			let mut alive = self.alive.lock().unwrap();
			if let Some(count) = alive.per_instance.get_mut(&self.instance) {
				*count = count.saturating_sub(1);
			}
		}
	}
}

struct FakeControl {
	exit: Arc<ExitSignal>,
	task: AbortHandle,
}

impl ProcessControl for FakeControl {
	fn terminate(&self) {
		self.task.abort();
		self.exit.set(ChildExit::signaled(15));
	}

	fn kill(&self) {
		self.task.abort();
		self.exit.set(ChildExit::signaled(9));
	}
}

async fn run_child(
	behavior: Behavior,
	api: &'static str,
	instance: String,
	token: String,
	stdin: DuplexStream,
	mut stdout: DuplexStream,
	calls: Arc<Mutex<Vec<ChildCall>>>,
) -> i32 {
	match behavior {
		Behavior::Exit => return 1,
		Behavior::Hang => {
			let _pipes = (stdin, stdout);
			std::future::pending::<()>().await;
			return 0;
		}
		Behavior::ServeAfter(delay) => tokio::time::sleep(delay).await,
		_ => {}
	}

	let token = match behavior {
		Behavior::Forged => "forged".to_string(),
		_ => token,
	};
	let register = Frame::call(
		"register",
		json!({
			"apiVersion": api,
			"instanceId": instance,
			"verificationToken": token,
		}),
		1,
	);
	if write_frame(&mut stdout, &register).await.is_err() {
		return 1;
	}
	if matches!(behavior, Behavior::RegisterTwice) && write_frame(&mut stdout, &register).await.is_err() {
		return 1;
	}

	let mut lines = BufReader::new(stdin).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		let Some(frame) = Frame::decode(&line) else {
			continue;
		};
		let (name, payload, callback_id) = match frame {
			Frame::Response {
				callback_id: 1,
				success,
				..
			} => {
				let name = if success { "registered" } else { "register-rejected" };
				record(&calls, &instance, name, Value::Null);
				continue;
			}
			Frame::Response { .. } => continue,
			Frame::Call {
				name,
				payload,
				callback_id,
			} => (name, payload, callback_id),
		};
		record(&calls, &instance, &name, payload);

		if let Some(callback_id) = callback_id {
			let fail = match name.as_str() {
				"init" => matches!(behavior, Behavior::FailInit),
				"resubscribe-feedbacks" => matches!(behavior, Behavior::FailFeedbacks),
				_ => false,
			};
			let reply = Frame::Response {
				callback_id,
				success: !fail,
				payload: match name.as_str() {
					"entity-learn-options" => json!(["one", "two"]),
					_ if fail => json!(format!("{} exploded", name)),
					_ => Value::Null,
				},
			};
			if write_frame(&mut stdout, &reply).await.is_err() {
				return 1;
			}
		}
		if name == "destroy" {
			return 0;
		}
	}
	0
}

async fn write_frame(out: &mut DuplexStream, frame: &Frame) -> std::io::Result<()> {
	let data = frame.encode().map_err(std::io::Error::other)?;
	out.write_all(&data).await
}

fn record(calls: &Mutex<Vec<ChildCall>>, instance: &str, name: &str, payload: Value) {
	calls.lock().unwrap().push(ChildCall {
		instance: instance.to_string(),
		name: name.to_string(),
		payload,
	});
}

// --- Collaborators ---

/// Registry serving `acme.switch` 1.2.0 and 1.3.0 (connections) and
/// `acme.deck` 1.0.0 (surface). Resolution can be gated or slowed down.
pub struct FakeRegistry {
	modules: HashMap<(ModuleType, String), Vec<(String, String)>>,
	gate: Option<Arc<Semaphore>>,
	delay: Duration,
	pub resolves: AtomicUsize,
	in_flight: AtomicUsize,
	pub max_in_flight: AtomicUsize,
}

impl FakeRegistry {
	pub fn new() -> Self {
		let mut modules = HashMap::new();
		modules.insert(
			(ModuleType::Connection, "acme.switch".to_string()),
			vec![
				("1.2.0".to_string(), "2.0.0".to_string()),
				("1.3.0".to_string(), "2.0.0".to_string()),
			],
		);
		modules.insert(
			(ModuleType::Surface, "acme.deck".to_string()),
			vec![("1.0.0".to_string(), "1.0.0".to_string())],
		);
		Self {
			modules,
			gate: None,
			delay: Duration::ZERO,
			resolves: AtomicUsize::new(0),
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
		}
	}

	pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
		self.gate = Some(gate);
		self
	}

	pub fn slowed(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}
}

#[async_trait]
impl ModuleRegistry for FakeRegistry {
	async fn resolve_version(&self, module_type: ModuleType, module_id: &str, version: Option<&str>) -> Option<ModuleInfo> {
		self.resolves.fetch_add(1, Ordering::SeqCst);
		let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(now, Ordering::SeqCst);

		if let Some(gate) = &self.gate {
			if let Ok(permit) = gate.acquire().await {
				permit.forget();
			}
		}
		if !self.delay.is_zero() {
			tokio::time::sleep(self.delay).await;
		}
		self.in_flight.fetch_sub(1, Ordering::SeqCst);

		let versions = self.modules.get(&(module_type, module_id.to_string()))?;
		let (version, api) = match version {
			Some(v) => versions.iter().find(|(candidate, _)| candidate == v)?,
			None => versions.last()?,
		};
		let base_path = PathBuf::from("/modules").join(module_id).join(version);
		Some(ModuleInfo {
			manifest: Manifest {
				id: module_id.to_string(),
				name: module_id.to_string(),
				version: version.clone(),
				runtime: RuntimeManifest {
					runtime_type: "node22".to_string(),
					api: ApiKind::NodejsIpc,
					api_version: api.clone(),
					entrypoint: "main.js".to_string(),
					permissions: Permissions::default(),
				},
			},
			manifest_path: base_path.join("manifest.json"),
			base_path,
			is_packaged: true,
		})
	}

	async fn has_module(&self, module_type: ModuleType, module_id: &str) -> bool {
		self.modules.contains_key(&(module_type, module_id.to_string()))
	}
}

pub struct FakeRuntimes;

#[async_trait]
impl RuntimeLocator for FakeRuntimes {
	async fn resolve_runtime_binary(&self, runtime_type: &str) -> Option<PathBuf> {
		Some(Path::new("/runtimes").join(runtime_type).join("bin/node"))
	}

	async fn resolve_entrypoint(&self, info: &ModuleInfo) -> Option<PathBuf> {
		Some(info.base_path.join(&info.manifest.runtime.entrypoint))
	}
}

#[derive(Default)]
pub struct RecordingCleanup {
	pub forgotten: Mutex<Vec<String>>,
}

impl InstanceCleanup for RecordingCleanup {
	fn forget_definitions(&self, id: &InstanceId) {
		self.forgotten.lock().unwrap().push(format!("definitions:{}", id));
	}

	fn forget_variables(&self, id: &InstanceId) {
		self.forgotten.lock().unwrap().push(format!("variables:{}", id));
	}
}

// --- Harness ---

pub struct Harness {
	pub supervisor: Supervisor,
	pub launcher: Arc<FakeLauncher>,
	pub registry: Arc<FakeRegistry>,
	pub status: Arc<StatusBoard>,
	pub logs: Arc<InstanceLogs>,
	pub cleanup: Arc<RecordingCleanup>,
}

pub fn harness(config: SupervisorConfig, registry: FakeRegistry, fallback: Behavior) -> Harness {
	let settings = StaticSettings::with_fallback(InstanceSettings {
		config: json!({ "host": "10.0.0.5" }),
		secrets: None,
	});
	harness_with_settings(config, registry, fallback, settings)
}

pub fn harness_with_settings(
	config: SupervisorConfig,
	registry: FakeRegistry,
	fallback: Behavior,
	settings: StaticSettings,
) -> Harness {
	let launcher = Arc::new(FakeLauncher::new(fallback));
	let registry = Arc::new(registry);
	let status = Arc::new(StatusBoard::new());
	let logs = Arc::new(InstanceLogs::new(LogSettings::default()));
	let cleanup = Arc::new(RecordingCleanup::default());

	let supervisor = Supervisor::new(
		config,
		SupervisorDeps {
			registry: registry.clone(),
			runtimes: Arc::new(FakeRuntimes),
			status: status.clone(),
			debug_log: logs.clone(),
			settings: Arc::new(settings),
			cleanup: cleanup.clone(),
			launcher: launcher.clone(),
		},
	);

	Harness {
		supervisor,
		launcher,
		registry,
		status,
		logs,
		cleanup,
	}
}

pub fn default_harness(fallback: Behavior) -> Harness {
	harness(SupervisorConfig::default(), FakeRegistry::new(), fallback)
}

pub fn switch(version: &str, label: &str) -> TargetState {
	TargetState::new(ModuleType::Connection, "acme.switch", Some(version), label)
}

/// Polls `check` every 10ms of (usually paused) time, giving up after a minute.
pub async fn eventually<F>(mut check: F) -> bool
where
	F: FnMut() -> bool,
{
	for _ in 0..6000 {
		if check() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	false
}

pub async fn wait_ready(supervisor: &Supervisor, id: &InstanceId) -> Arc<ChildHandler> {
	for _ in 0..6000 {
		if let Some(handler) = supervisor.get_ready_handle(id, false).await {
			return handler;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("{} never became ready", id);
}

pub async fn wait_removed(supervisor: &Supervisor, id: &InstanceId) {
	for _ in 0..6000 {
		if supervisor.snapshot().await.iter().all(|s| &s.id != id) {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("{} was never removed", id);
}
