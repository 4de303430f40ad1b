use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded-concurrency gate shared by every instance. A reconciliation job
/// holds a permit from the moment it starts spawning until the child has
/// registered (or the attempt failed).
#[derive(Clone)]
pub struct StartLimiter {
	semaphore: Arc<Semaphore>,
	capacity: usize,
}

impl StartLimiter {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			semaphore: Arc::new(Semaphore::new(capacity)),
			capacity,
		}
	}

	/// One fewer than the logical CPU count, never less than one.
	pub fn default_capacity() -> usize {
		let cpus = std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1);
		cpus.saturating_sub(1).max(1)
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn available(&self) -> usize {
		self.semaphore.available_permits()
	}

	/// Waits for a free slot. Returns `None` only if the limiter was closed.
	pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
		Arc::clone(&self.semaphore).acquire_owned().await.ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capacity_is_at_least_one() {
		assert_eq!(StartLimiter::new(0).capacity(), 1);
		assert!(StartLimiter::default_capacity() >= 1);
	}

	#[tokio::test]
	async fn permits_are_returned_on_drop() {
		let limiter = StartLimiter::new(2);
		let a = limiter.acquire().await.unwrap();
		let _b = limiter.acquire().await.unwrap();
		assert_eq!(limiter.available(), 0);
		drop(a);
		assert_eq!(limiter.available(), 1);
	}
}
