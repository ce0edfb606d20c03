//! Shutdown signals
//!
//! SIGINT and SIGTERM raise a process-wide flag the reactor checks once per
//! tick. SIGPIPE is ignored so a vanished peer surfaces as `EPIPE` on the
//! write instead of killing the process.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};

use pollserv_core::{ServerError, ServerResult};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Install the SIGINT/SIGTERM handler and ignore SIGPIPE. Idempotent.
pub fn install_handlers() -> ServerResult<()> {
    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    // No SA_RESTART: poll() must wake up with EINTR.
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let to_error = |e: nix::errno::Errno| ServerError::SignalInstall(e as i32);
    unsafe {
        sigaction(Signal::SIGINT, &action).map_err(to_error)?;
        sigaction(Signal::SIGTERM, &action).map_err(to_error)?;
        signal(Signal::SIGPIPE, SigHandler::SigIgn).map_err(to_error)?;
    }
    Ok(())
}

/// Whether a shutdown signal has arrived
#[inline]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}
