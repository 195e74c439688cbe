//! Process-wide teardown guarantees for active deployments.
//!
//! Every deployment registers itself here on construction and deregisters on
//! stop. The registry holds weak references, so a deployment that is simply
//! dropped does not linger; the signal path upgrades a snapshot to strong
//! references only for the duration of cleanup. On the first registration a
//! SIGINT/SIGTERM listener is installed (once, idempotently): it stops every
//! registered deployment, restores the default disposition, and re-raises the
//! signal so the process actually terminates. Normal (non-signal) exits are
//! covered by each deployment's own `Drop`.

use crate::deployment::Deployment;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

fn registry() -> &'static Mutex<HashMap<u64, Weak<dyn Deployment>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<dyn Deployment>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Track a deployment for signal-driven teardown. Returns the handle to pass
/// to [`deregister`] on stop.
pub fn register(deployment: Arc<dyn Deployment>) -> u64 {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    map.insert(id, Arc::downgrade(&deployment));
    drop(map);
    install_signal_hook();
    id
}

pub fn deregister(id: u64) {
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    map.remove(&id);
}

/// Number of registered deployments that are still alive.
pub fn active_count() -> usize {
    let map = registry().lock().unwrap_or_else(|e| e.into_inner());
    map.values().filter(|weak| weak.strong_count() > 0).count()
}

/// Stop every registered deployment. The snapshot is taken under the lock;
/// the stops run without holding it, so a `stop()` that deregisters itself
/// cannot deadlock.
pub async fn stop_all() {
    let snapshot: Vec<Arc<dyn Deployment>> = {
        let map = registry().lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter_map(Weak::upgrade).collect()
    };
    for deployment in snapshot {
        if let Err(e) = deployment.stop().await {
            tracing::warn!(error = %e, "failed to stop deployment during shutdown");
        }
    }
}

/// Install the SIGINT/SIGTERM listener once. Outside a tokio runtime this is
/// a no-op and a later registration inside one will install it.
fn install_signal_hook() {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    handle.spawn(signal_listener());
}

async fn signal_listener() {
    use tokio::signal::unix::{SignalKind, signal as unix_signal};
    let interrupt = unix_signal(SignalKind::interrupt());
    let terminate = unix_signal(SignalKind::terminate());
    let (mut interrupt, mut terminate) = match (interrupt, terminate) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        _ => {
            tracing::warn!("failed to install signal handlers for deployment cleanup");
            return;
        }
    };

    let received = tokio::select! {
        _ = interrupt.recv() => nix::sys::signal::Signal::SIGINT,
        _ = terminate.recv() => nix::sys::signal::Signal::SIGTERM,
    };
    tracing::info!(signal = ?received, "stopping active deployments before exit");
    stop_all().await;

    // Teardown is done; hand the signal back with its default disposition so
    // the process terminates with the conventional status.
    unsafe {
        let _ = nix::sys::signal::signal(received, nix::sys::signal::SigHandler::SigDfl);
    }
    let _ = nix::sys::signal::raise(received);
}
