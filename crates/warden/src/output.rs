use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::logs;
use crate::types::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
	/// Lifecycle lines written by the supervisor itself.
	Supervisor,
	/// Non-protocol stdout from the child.
	Console,
	Stderr,
	/// `log-message` calls made by a ready module.
	Module,
}

impl LogSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			LogSource::Supervisor => "supervisor",
			LogSource::Console => "console",
			LogSource::Stderr => "stderr",
			LogSource::Module => "module",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
	Debug,
	Info,
	Warn,
	Error,
}

impl LogLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			LogLevel::Debug => "debug",
			LogLevel::Info => "info",
			LogLevel::Warn => "warn",
			LogLevel::Error => "error",
		}
	}

	pub fn parse(level: &str) -> Self {
		match level.to_ascii_lowercase().as_str() {
			"debug" | "trace" => LogLevel::Debug,
			"warn" | "warning" => LogLevel::Warn,
			"error" => LogLevel::Error,
			_ => LogLevel::Info,
		}
	}
}

/// Per-instance human-readable log stream (lifecycle transitions and child
/// output), separate from the host's own tracing output.
pub trait DebugLog: Send + Sync {
	fn append_line(
		&self,
		id: &InstanceId,
		timestamp: SystemTime,
		source: LogSource,
		level: LogLevel,
		text: &str,
	);
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
	pub timestamp: String,
	pub source: LogSource,
	pub level: LogLevel,
	pub text: String,
}

impl LogLine {
	pub fn render(&self) -> String {
		format!(
			"{} [{}] {}: {}",
			self.timestamp,
			self.source.as_str(),
			self.level.as_str(),
			self.text
		)
	}
}

#[derive(Debug, Clone)]
pub struct LogSettings {
	/// Where per-instance files go. `None` keeps logs in memory only.
	pub dir: Option<PathBuf>,
	pub max_file_size: u64,
	pub ring_lines: usize,
}

impl Default for LogSettings {
	fn default() -> Self {
		Self {
			dir: None,
			max_file_size: 10 * 1024 * 1024,
			ring_lines: 500,
		}
	}
}

/// [`DebugLog`] that keeps the last lines of every instance in memory, fans
/// them out to subscribers and appends them to a rotating file per instance.
pub struct InstanceLogs {
	settings: LogSettings,
	instances: Mutex<HashMap<InstanceId, InstanceLog>>,
	sender: broadcast::Sender<(InstanceId, LogLine)>,
}

struct InstanceLog {
	ring: VecDeque<LogLine>,
	writer: Option<LogWriter>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	dir: PathBuf,
	bytes_written: u64,
	max_size: u64,
}

impl InstanceLogs {
	pub fn new(settings: LogSettings) -> Self {
		let (sender, _) = broadcast::channel(1024);
		Self {
			settings,
			instances: Mutex::new(HashMap::new()),
			sender,
		}
	}

	/// Recent lines for one instance, oldest first.
	pub fn snapshot(&self, id: &InstanceId) -> Vec<LogLine> {
		let instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
		instances
			.get(id)
			.map(|log| log.ring.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<(InstanceId, LogLine)> {
		self.sender.subscribe()
	}

	/// Drops the in-memory buffer and closes the file for an instance.
	pub fn forget(&self, id: &InstanceId) {
		let mut instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
		instances.remove(id);
	}

	fn open_instance(&self, id: &InstanceId) -> InstanceLog {
		let writer = self.settings.dir.as_ref().map(|dir| {
			LogWriter::open(logs::instance_log_dir(dir, id.as_str()), self.settings.max_file_size)
		});
		InstanceLog {
			ring: VecDeque::with_capacity(self.settings.ring_lines.min(1024)),
			writer,
		}
	}
}

impl DebugLog for InstanceLogs {
	fn append_line(
		&self,
		id: &InstanceId,
		timestamp: SystemTime,
		source: LogSource,
		level: LogLevel,
		text: &str,
	) {
		let line = LogLine {
			timestamp: logs::format_timestamp(timestamp),
			source,
			level,
			text: text.to_string(),
		};

		{
			let mut instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
			if !instances.contains_key(id) {
				let log = self.open_instance(id);
				instances.insert(id.clone(), log);
			}
			if let Some(log) = instances.get_mut(id) {
				if self.settings.ring_lines > 0 {
					if log.ring.len() >= self.settings.ring_lines {
						log.ring.pop_front();
					}
					log.ring.push_back(line.clone());
				}
				if let Some(writer) = log.writer.as_mut() {
					writer.write_line(&line.render(), timestamp);
				}
			}
		}

		let _ = self.sender.send((id.clone(), line));
	}
}

impl LogWriter {
	fn open(dir: PathBuf, max_size: u64) -> Self {
		let _ = fs::create_dir_all(&dir);
		let path = dir.join(logs::active_log_name(SystemTime::now()));
		let file = OpenOptions::new().create(true).append(true).open(&path).ok();
		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);
		Self {
			file,
			path,
			dir,
			bytes_written,
			max_size,
		}
	}

	fn write_line(&mut self, line: &str, now: SystemTime) {
		let Some(file) = self.file.as_mut() else {
			return;
		};
		if writeln!(file, "{}", line).is_err() {
			return;
		}
		self.bytes_written += line.len() as u64 + 1;
		if self.max_size > 0 && self.bytes_written >= self.max_size {
			self.rotate(now);
		}
	}

	fn rotate(&mut self, now: SystemTime) {
		drop(self.file.take());
		let rotated = self.dir.join(logs::rotated_log_name(&self.dir, now));
		let _ = fs::rename(&self.path, &rotated);

		self.path = self.dir.join(logs::active_log_name(now));
		self.file = OpenOptions::new().create(true).append(true).open(&self.path).ok();
		self.bytes_written = 0;
	}
}
