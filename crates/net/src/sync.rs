//! Small synchronization helpers shared by the engines

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

/// Bound on any single frame write, so teardown never hangs on a stuck peer
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves once shutdown is requested or the requesting side is gone
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
