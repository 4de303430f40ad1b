use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::watch;

/// Fully resolved invocation of a module runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnCommand {
	pub program: PathBuf,
	pub args: Vec<String>,
	pub cwd: PathBuf,
	pub env: Vec<(String, String)>,
}

impl SpawnCommand {
	pub fn env_var(&self, key: &str) -> Option<&str> {
		self.env
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl ChildExit {
	pub fn code(code: i32) -> Self {
		Self {
			code: Some(code),
			signal: None,
		}
	}

	pub fn signaled(signal: i32) -> Self {
		Self {
			code: None,
			signal: Some(signal),
		}
	}

	fn from_status(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;
		Self {
			code: status.code(),
			signal: status.signal(),
		}
	}
}

impl fmt::Display for ChildExit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match (self.code, self.signal) {
			(Some(code), _) => write!(f, "exit {}", code),
			(None, Some(sig)) => write!(f, "signal {}", sig),
			(None, None) => write!(f, "unknown exit"),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
	#[error("spawn failed: {0}")]
	Spawn(#[from] std::io::Error),
	#[error("child is missing its {0} pipe")]
	MissingPipe(&'static str),
}

/// How a monitor asks its process to go away.
pub trait ProcessControl: Send + Sync {
	fn terminate(&self);
	fn kill(&self);
}

/// Watches one child process. There is no automatic respawn: when the child
/// exits the monitor just reports it and the supervisor decides what's next.
pub struct SpawnMonitor {
	pid: Option<u32>,
	exit: watch::Receiver<Option<ChildExit>>,
	control: Box<dyn ProcessControl>,
	kill_timeout: Duration,
	stopping: AtomicBool,
}

impl SpawnMonitor {
	pub fn new(
		pid: Option<u32>,
		exit: watch::Receiver<Option<ChildExit>>,
		control: Box<dyn ProcessControl>,
		kill_timeout: Duration,
	) -> Self {
		Self {
			pid,
			exit,
			control,
			kill_timeout,
			stopping: AtomicBool::new(false),
		}
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	pub fn exit_status(&self) -> Option<ChildExit> {
		*self.exit.borrow()
	}

	/// True once [`SpawnMonitor::stop`] has been called, so exit listeners can
	/// tell a requested stop from a crash.
	pub fn is_stopping(&self) -> bool {
		self.stopping.load(Ordering::SeqCst)
	}

	pub fn subscribe_exit(&self) -> watch::Receiver<Option<ChildExit>> {
		self.exit.clone()
	}

	pub async fn wait(&self) -> Option<ChildExit> {
		let mut rx = self.exit.clone();
		let exit = match rx.wait_for(|e| e.is_some()).await {
			Ok(exit) => *exit,
			Err(_) => None,
		};
		exit
	}

	/// Terminates the child, escalating to a kill after the kill timeout, and
	/// waits for it to exit. Safe to call more than once.
	pub async fn stop(&self) -> Option<ChildExit> {
		self.stopping.store(true, Ordering::SeqCst);
		if let Some(exit) = self.exit_status() {
			return Some(exit);
		}
		self.control.terminate();
		match tokio::time::timeout(self.kill_timeout, self.wait()).await {
			Ok(exit) => exit,
			Err(_) => {
				tracing::warn!(pid = ?self.pid, "child ignored SIGTERM, killing");
				self.control.kill();
				self.wait().await
			}
		}
	}
}

/// A freshly started child: its monitor and the pipes the supervisor talks
/// over. `stderr` is optional since not every launcher captures it.
pub struct LaunchedChild {
	pub monitor: SpawnMonitor,
	pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
	pub stdout: Box<dyn AsyncRead + Send + Unpin>,
	pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

/// Process creation seam.
pub trait Launcher: Send + Sync {
	fn launch(&self, command: &SpawnCommand, kill_timeout: Duration) -> Result<LaunchedChild, MonitorError>;
}

/// Spawns real OS processes, each in its own process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
	fn launch(&self, command: &SpawnCommand, kill_timeout: Duration) -> Result<LaunchedChild, MonitorError> {
		let mut cmd = Command::new(&command.program);
		cmd.args(&command.args)
			.current_dir(&command.cwd)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.process_group(0);
		for (key, val) in &command.env {
			cmd.env(key, val);
		}

		let mut child = cmd.spawn()?;
		let pid = child.id();
		let stdin = child.stdin.take().ok_or(MonitorError::MissingPipe("stdin"))?;
		let stdout = child.stdout.take().ok_or(MonitorError::MissingPipe("stdout"))?;
		let stderr = child.stderr.take();

		let (exit_tx, exit_rx) = watch::channel(None);
		tokio::spawn(async move {
			let exit = match child.wait().await {
				Ok(status) => ChildExit::from_status(status),
				Err(e) => {
					tracing::warn!("wait on child failed: {}", e);
					ChildExit {
						code: None,
						signal: None,
					}
				}
			};
			let _ = exit_tx.send(Some(exit));
		});

		Ok(LaunchedChild {
			monitor: SpawnMonitor::new(pid, exit_rx, Box::new(ProcessGroup { pid }), kill_timeout),
			stdin: Box::new(stdin),
			stdout: Box::new(stdout),
			stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
		})
	}
}

struct ProcessGroup {
	pid: Option<u32>,
}

impl ProcessGroup {
	fn signal(&self, signal: nix::sys::signal::Signal) {
		use nix::sys::signal::killpg;
		use nix::unistd::Pid;
		if let Some(pid) = self.pid {
			let _ = killpg(Pid::from_raw(pid as i32), signal);
		}
	}
}

impl ProcessControl for ProcessGroup {
	fn terminate(&self) {
		self.signal(nix::sys::signal::Signal::SIGTERM);
	}

	fn kill(&self) {
		self.signal(nix::sys::signal::Signal::SIGKILL);
	}
}
