// Polling-based shutdown signal handling (lock-free).

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

static RECEIVED_SIGNAL: LazyLock<AtomicUsize> = LazyLock::new(|| AtomicUsize::new(0));

/// Route SIGINT and SIGTERM into the daemon's shutdown path. Monitor
/// Processes run in their own sessions and never see these.
pub fn install_signal_handlers() -> anyhow::Result<()> {
    extern "C" fn handler(sig: i32) {
        RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
    }
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(handler),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
            anyhow::anyhow!(
                "Failed to register {sig} handler: {e}. Signal handling is required for daemon operation."
            )
        })?;
    }
    Ok(())
}

/// Non-blocking check; returns each delivered signal once.
fn check_signals() -> Option<Signal> {
    let val = RECEIVED_SIGNAL.swap(0, Ordering::AcqRel);
    if val == 0 {
        return None;
    }
    match Signal::try_from(val as i32) {
        Ok(sig) => Some(sig),
        Err(e) => {
            log::error!("BUG: Invalid signal number {val} from signal handler: {e}");
            None
        }
    }
}

/// Resolve once SIGINT or SIGTERM has been received.
pub async fn wait_for_shutdown() -> Signal {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if let Some(sig) = check_signals() {
            log::info!("received {sig}, shutting down");
            return sig;
        }
    }
}
