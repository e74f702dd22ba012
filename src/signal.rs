//! Signal plumbing: stats dump on SIGUSR2, fail-fast on SIGSEGV, and the
//! freeze-for-debugger hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use tracing::info;

use crate::config::Config;

static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);
static FREEZE_FLAG: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

/// Install handlers once per process. SIGUSR2 raises a flag the polling
/// worker turns into a state dump; SIGSEGV writes a fixed diagnostic,
/// optionally freezes for a debugger, and exits non-zero.
pub(crate) fn install() {
    INSTALL.call_once(|| {
        if Config::freeze_on_error() {
            FREEZE_FLAG.store(true, Ordering::SeqCst);
        }
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGUSR2, usr2_handler as libc::sighandler_t);
            libc::signal(libc::SIGSEGV, segv_handler as libc::sighandler_t);
        }
    });
}

#[cfg(unix)]
extern "C" fn usr2_handler(_sig: libc::c_int) {
    DUMP_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
extern "C" fn segv_handler(_sig: libc::c_int) {
    // Only async-signal-safe calls from here on.
    let msg = b"fatal: segmentation fault on a runtime core\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    }
    if FREEZE_FLAG.load(Ordering::Relaxed) {
        let note = b"freezing for debugger; clear the freeze flag to exit\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, note.as_ptr() as *const libc::c_void, note.len());
        }
        while FREEZE_FLAG.load(Ordering::Relaxed) {
            unsafe { libc::sleep(1) };
        }
    }
    unsafe { libc::_exit(2) };
}

/// Consume a pending dump request, if any. Polled by the polling worker.
pub(crate) fn take_dump_request() -> bool {
    DUMP_REQUESTED.swap(false, Ordering::Relaxed)
}

/// Pause at startup until a debugger clears the flag.
pub(crate) fn freeze_for_debugger() {
    FREEZE_FLAG.store(true, Ordering::SeqCst);
    info!(
        pid = std::process::id(),
        "freezing for debugger; clear the freeze flag to continue"
    );
    while FREEZE_FLAG.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_request_is_consumed() {
        DUMP_REQUESTED.store(true, Ordering::Relaxed);
        assert!(take_dump_request());
        assert!(!take_dump_request());
    }
}
