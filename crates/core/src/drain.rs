use std::time::Duration;

pub use internal::{
	DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Watch as DrainWatcher,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a new pair for draining.
/// * DrainTrigger can be used to start a draining sequence and wait for it to complete.
/// * DrainWatcher should be held by anything that wants to participate in the draining. This can be
///   cloned, and a drain will not complete until all outstanding DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Resolves when the process is asked to terminate. The caller is expected
/// to fire its drain trigger once this returns.
#[cfg(unix)]
pub async fn wait_for_shutdown() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
	let mut int = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
	let name = tokio::select! {
		_ = term.recv() => "SIGTERM",
		_ = int.recv() => "SIGINT",
	};
	info!(signal = name, "shutdown requested, draining");
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!("failed to wait for shutdown signal: {e}");
		std::future::pending::<()>().await;
	}
	info!("shutdown requested, draining");
}

/// run_with_drain wraps a future with graceful shutdown/draining support.
/// The future is built from two arguments:
/// * drain: while holding onto this, the future is marked as active, which will block the server
///   from shutting down. Additionally, it can be watched (with drain.wait_for_drain()) to see when
///   to stop accepting new work.
/// * force_shutdown: when this is triggered, the future must forcefully shutdown any ongoing work.
///   This means the graceful drain exceeded the hard deadline.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(
				component,
				"drain started, waiting {:?} for any connections to complete", deadline
			);
			if tokio::time::timeout(
				deadline,
				sub_drain_signal.start_drain_and_wait(DrainMode::Graceful),
			)
			.await
			.is_err()
			{
				warn!(
					component,
					"drain duration expired with pending connections, forcefully shutting down"
				);
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());

		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);

		let signal = Signal {
			drained_rx,
			signal_tx,
		};
		let watch = Watch {
			drained_tx,
			signal_rx,
		};
		(signal, watch)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Send a drain command to all watchers.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watch for a drain command.
	///
	/// All `Watch` instances must be dropped for a `Signal::start_drain_and_wait` call to
	/// complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the runtime"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		/// Asynchronously signals all watchers to begin draining and waits for all
		/// handles to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));

			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Returns a `ReleaseShutdown` handle after the drain has been signaled. The
		/// handle must be dropped when the shutdown action has been completed to
		/// unblock graceful shutdown.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted it is_some"))
				// If the signal was dropped entirely, a graceful shutdown is not required.
				.unwrap_or(DrainMode::Immediate);

			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::DrainMode::Graceful;
	use crate::drain;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = drain::new();
		let completed = Arc::new(AtomicUsize::new(0));
		let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);

		for _ in 0..3 {
			let watcher = watcher.clone();
			let completed = completed.clone();
			let mut release_rx = release_tx.subscribe();
			tokio::spawn(async move {
				let signaled = watcher.wait_for_drain().await;
				let _ = release_rx.recv().await;
				completed.fetch_add(1, Ordering::SeqCst);
				drop(signaled);
			});
		}
		drop(watcher);

		assert_eq!(completed.load(Ordering::SeqCst), 0);
		let _ = release_tx.send(());

		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
				panic!("timeout")
			},
			_ = trigger.start_drain_and_wait(Graceful) => {
				assert_eq!(completed.load(Ordering::SeqCst), 3);
			}
		}
	}
}
