use serde::Deserialize;
use std::time::Duration;

use crate::limiter::StartLimiter;

/// Tunables for a [`Supervisor`](crate::Supervisor). Deserializes from the
/// `[supervisor]` table of the host config; every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
	/// Concurrent spawn slots. `0` picks one fewer than the CPU count.
	#[serde(default)]
	pub max_concurrent_starts: usize,
	/// How long a child may take to register. `0` waits forever.
	#[serde(default = "default_handshake_timeout")]
	pub handshake_timeout_secs: u64,
	/// Grace period between SIGTERM and SIGKILL.
	#[serde(default = "default_kill_timeout")]
	pub kill_timeout_ms: u64,
	#[serde(default = "default_stop_all_timeout")]
	pub stop_all_timeout_secs: u64,
	#[serde(default = "default_ipc_call_timeout")]
	pub ipc_call_timeout_ms: u64,
	/// First inspector port handed to unpackaged modules, if any.
	#[serde(default)]
	pub debug_inspect_port: Option<u16>,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			max_concurrent_starts: 0,
			handshake_timeout_secs: default_handshake_timeout(),
			kill_timeout_ms: default_kill_timeout(),
			stop_all_timeout_secs: default_stop_all_timeout(),
			ipc_call_timeout_ms: default_ipc_call_timeout(),
			debug_inspect_port: None,
		}
	}
}

fn default_handshake_timeout() -> u64 {
	30
}
fn default_kill_timeout() -> u64 {
	5000
}
fn default_stop_all_timeout() -> u64 {
	10
}
fn default_ipc_call_timeout() -> u64 {
	10_000
}

impl SupervisorConfig {
	pub fn start_concurrency(&self) -> usize {
		match self.max_concurrent_starts {
			0 => StartLimiter::default_capacity(),
			n => n,
		}
	}

	pub fn handshake_timeout(&self) -> Option<Duration> {
		match self.handshake_timeout_secs {
			0 => None,
			n => Some(Duration::from_secs(n)),
		}
	}

	pub fn kill_timeout(&self) -> Duration {
		Duration::from_millis(self.kill_timeout_ms)
	}

	pub fn stop_all_timeout(&self) -> Duration {
		Duration::from_secs(self.stop_all_timeout_secs)
	}

	pub fn ipc_call_timeout(&self) -> Duration {
		Duration::from_millis(self.ipc_call_timeout_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_table_uses_defaults() {
		let config: SupervisorConfig = serde_json::from_str("{}").unwrap();
		assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
		assert_eq!(config.kill_timeout(), Duration::from_secs(5));
		assert_eq!(config.stop_all_timeout(), Duration::from_secs(10));
		assert!(config.start_concurrency() >= 1);
		assert_eq!(config.debug_inspect_port, None);
	}

	#[test]
	fn zero_handshake_timeout_is_unbounded() {
		let config: SupervisorConfig =
			serde_json::from_str(r#"{"handshake_timeout_secs": 0, "max_concurrent_starts": 3}"#)
				.unwrap();
		assert_eq!(config.handshake_timeout(), None);
		assert_eq!(config.start_concurrency(), 3);
	}
}
