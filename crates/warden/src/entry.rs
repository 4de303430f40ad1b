use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::handler::ChildHandler;
use crate::handshake::AttemptFailure;
use crate::monitor::SpawnMonitor;
use crate::types::{AuthToken, InstanceId, ModuleType, TargetState};

/// The one process an instance may have running at a time.
#[derive(Clone)]
pub(crate) struct LiveProcess {
	pub monitor: Arc<SpawnMonitor>,
	pub handler: Arc<ChildHandler>,
}

pub(crate) type StartupSender = oneshot::Sender<Result<(), AttemptFailure>>;

#[derive(Default)]
pub(crate) struct EntryState {
	pub target: Option<TargetState>,
	pub module_type: Option<ModuleType>,
	pub current_label: Option<String>,
	pub restart_count: u32,
	/// Registration accepted, `init` still running.
	pub is_initialising: bool,
	pub is_ready: bool,
	pub recently_crashed: bool,
	pub live: Option<LiveProcess>,
	pub token: Option<AuthToken>,
	pub crash_timer: Option<JoinHandle<()>>,
	/// Bumped whenever an attempt starts or is torn down. Listeners from an
	/// older attempt compare against it and bail out.
	pub attempt: u64,
	pub startup: Option<StartupSender>,
}

impl EntryState {
	pub fn is_current(&self, attempt: u64) -> bool {
		self.attempt == attempt
	}

	/// Revokes the running attempt: no listener from it will act again.
	pub fn detach(&mut self) -> (Option<LiveProcess>, Option<StartupSender>) {
		self.attempt += 1;
		self.token = None;
		self.is_initialising = false;
		self.is_ready = false;
		(self.live.take(), self.startup.take())
	}

	pub fn cancel_crash_timer(&mut self) {
		if let Some(timer) = self.crash_timer.take() {
			timer.abort();
		}
	}
}

/// Bookkeeping for one logical instance.
///
/// Reconciliation jobs for an entry run one at a time on its mailbox worker.
/// `state` is only ever locked for short, non-async sections.
pub(crate) struct InstanceEntry {
	pub id: InstanceId,
	state: Mutex<EntryState>,
	pending: AtomicBool,
	mailbox: mpsc::UnboundedSender<()>,
}

impl InstanceEntry {
	pub fn new(id: InstanceId) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let entry = Arc::new(Self {
			id,
			state: Mutex::new(EntryState::default()),
			pending: AtomicBool::new(false),
			mailbox: tx,
		});
		(entry, rx)
	}

	pub fn lock(&self) -> MutexGuard<'_, EntryState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Queues a reconciliation job unless one is already waiting. Returns
	/// whether a job was queued.
	pub fn schedule(&self) -> bool {
		if self.pending.swap(true, Ordering::SeqCst) {
			return false;
		}
		if self.mailbox.send(()).is_err() {
			self.pending.store(false, Ordering::SeqCst);
			return false;
		}
		true
	}

	/// Called by the worker as a job starts. Changes made after this point
	/// queue a fresh job.
	pub fn begin_job(&self) {
		self.pending.store(false, Ordering::SeqCst);
	}

	pub fn has_pending_job(&self) -> bool {
		self.pending.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn schedule_coalesces_until_job_starts() {
		let (entry, mut rx) = InstanceEntry::new(InstanceId::from("rack-a"));
		assert!(entry.schedule());
		assert!(!entry.schedule());
		assert!(!entry.schedule());
		assert!(entry.has_pending_job());

		assert!(rx.recv().await.is_some());
		entry.begin_job();
		assert!(!entry.has_pending_job());
		assert!(entry.schedule());
		assert!(rx.try_recv().is_ok());
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn detach_revokes_attempt() {
		let (entry, _rx) = InstanceEntry::new(InstanceId::from("rack-a"));
		let mut state = entry.lock();
		state.attempt = 3;
		state.token = Some(AuthToken::generate());
		state.is_ready = true;
		let (live, startup) = state.detach();
		assert!(live.is_none() && startup.is_none());
		assert!(!state.is_current(3));
		assert!(state.token.is_none());
		assert!(!state.is_ready);
	}
}
