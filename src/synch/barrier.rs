//! A sense-reversing spinning barrier for synchronizing all online CPUs.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// The barrier itself is shared by all participants. Every participant
/// additionally keeps a local sense flag that starts out as `false` and is
/// toggled on every episode, see [`Barrier::wait`].
pub struct Barrier {
	count: AtomicUsize,
	sense: AtomicBool,
}

impl Barrier {
	pub const fn new() -> Self {
		Self {
			count: AtomicUsize::new(0),
			sense: AtomicBool::new(false),
		}
	}

	/// Blocks until `participants` callers have arrived.
	///
	/// The last arriver resets the count and flips the global sense, which
	/// releases everybody else. Reusing the barrier for the next episode is
	/// safe immediately because late spinners wait for the *new* sense value
	/// and the count has already been reset by then.
	pub fn wait(&self, participants: usize, local_sense: &mut bool) {
		*local_sense = !*local_sense;

		if self.count.fetch_add(1, Ordering::SeqCst) + 1 == participants {
			self.count.store(0, Ordering::SeqCst);
			self.sense.store(*local_sense, Ordering::SeqCst);
		} else {
			while self.sense.load(Ordering::SeqCst) != *local_sense {
				spin_loop();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};
	use std::sync::Arc;
	use std::thread;

	use super::*;

	#[test]
	fn single_participant_never_blocks() {
		let barrier = Barrier::new();
		let mut sense = false;
		for _ in 0..10 {
			barrier.wait(1, &mut sense);
		}
	}

	#[test]
	fn phases_do_not_overlap() {
		const THREADS: usize = 4;
		const PHASE: u64 = 50_000;

		let barrier = Arc::new(Barrier::new());
		let counters: Arc<[AtomicU64; THREADS]> = Arc::new(Default::default());

		let handles: Vec<_> = (0..THREADS)
			.map(|cpu| {
				let barrier = Arc::clone(&barrier);
				let counters = Arc::clone(&counters);
				thread::spawn(move || {
					let mut sense = false;

					for _ in 0..PHASE {
						counters[cpu].fetch_add(1, Ordering::SeqCst);
					}
					barrier.wait(THREADS, &mut sense);

					// Everybody must have finished phase one by now.
					for counter in counters.iter() {
						assert!(counter.load(Ordering::SeqCst) >= PHASE);
					}
					barrier.wait(THREADS, &mut sense);

					for _ in 0..PHASE {
						counters[cpu].fetch_add(1, Ordering::SeqCst);
					}
					barrier.wait(THREADS, &mut sense);

					for counter in counters.iter() {
						assert_eq!(counter.load(Ordering::SeqCst), 2 * PHASE);
					}
				})
			})
			.collect();

		for handle in handles {
			handle.join().unwrap();
		}
	}

	#[test]
	fn barrier_is_reusable_across_many_episodes() {
		const THREADS: usize = 3;
		const EPISODES: usize = 1_000;

		let barrier = Arc::new(Barrier::new());
		let episodes_done = Arc::new(AtomicU64::new(0));

		let handles: Vec<_> = (0..THREADS)
			.map(|_| {
				let barrier = Arc::clone(&barrier);
				let episodes_done = Arc::clone(&episodes_done);
				thread::spawn(move || {
					let mut sense = false;
					for episode in 0..EPISODES {
						barrier.wait(THREADS, &mut sense);
						// All threads agree on the episode count in between.
						let done = episodes_done.load(Ordering::SeqCst);
						assert!(done >= episode as u64 * THREADS as u64);
						episodes_done.fetch_add(1, Ordering::SeqCst);
						barrier.wait(THREADS, &mut sense);
					}
				})
			})
			.collect();

		for handle in handles {
			handle.join().unwrap();
		}
		assert_eq!(
			episodes_done.load(Ordering::SeqCst),
			(THREADS * EPISODES) as u64
		);
	}
}
