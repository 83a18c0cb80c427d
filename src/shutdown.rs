// warp_client/src/shutdown.rs
// Process-wide lifecycle manager: shutdown flag, live-session registry,
// signal-driven teardown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use tracing::{info, warn};

use crate::session::WarpSession;

/// Set once when the process begins tearing down. Checked defensively
/// before event dispatch so that no callback runs past this point.
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref LIVE_SESSIONS: Mutex<Vec<Weak<WarpSession>>> = Mutex::new(Vec::new());
}

/// Whether process shutdown has begun.
pub fn in_progress() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// Mark the process as shutting down. Returns true for the single caller
/// that flipped the flag; later calls are no-ops.
pub fn begin() -> bool {
    !SHUTTING_DOWN.swap(true, Ordering::SeqCst)
}

/// Track a live session so exit handling can disconnect it.
pub(crate) fn track(session: &Arc<WarpSession>) {
    if let Ok(mut sessions) = LIVE_SESSIONS.lock() {
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }
}

/// Disconnect every live session. Each session's own idempotence guard
/// makes this safe against disconnects already in flight.
pub async fn disconnect_all() {
    let sessions: Vec<Arc<WarpSession>> = {
        let Ok(mut tracked) = LIVE_SESSIONS.lock() else {
            return;
        };
        let live = tracked.iter().filter_map(Weak::upgrade).collect();
        tracked.clear();
        live
    };

    for session in sessions {
        session.disconnect().await;
    }
}

/// Install the process-level interrupt handlers (SIGINT, and SIGTERM on
/// unix). Installed at most once; the handler sets the shutdown flag and
/// disconnects every live session exactly once. Returns true for the single
/// caller that armed the handler, like `begin`.
pub fn install_handlers() -> bool {
    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }
    tokio::spawn(async {
        wait_for_signal().await;
        if begin() {
            info!("shutdown signal received, disconnecting live sessions");
            disconnect_all().await;
        }
    });
    true
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, falling back to SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
