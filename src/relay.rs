use nix::{
    errno::Errno,
    libc::c_int,
    sys::signal::{
        SaFlags,
        SigAction,
        SigHandler,
        SigSet,
        Signal,
        kill,
        sigaction,
    },
    unistd::{
        Pid,
        write,
    },
};
use precisej_printable_errno::{
    ErrnoResult,
    PrintableErrno,
    printable_error,
};
use std::{
    convert::TryFrom,
    os::unix::prelude::RawFd,
    sync::atomic::{
        AtomicBool,
        AtomicI32,
        Ordering,
    },
};

use crate::{
    platforms::{
        self,
        ExitNotifier,
    },
    PROGRAM_NAME,
};


// A signal handler can't be handed a context pointer, so the little it needs lives in atomics.
// Nothing else is touched from handler context.
static DAEMON_PID: AtomicI32 = AtomicI32::new(0);
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);
static NOTIFY_ERRNO: AtomicI32 = AtomicI32::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Signals passed through to the daemon untouched.
const FORWARDED_SIGNALS: [Signal; 1] = [Signal::SIGINT];

/// Handles SIGCHLD by poking the exit notifier and forwards everything else to the daemon.
///
/// Async-signal-safe: one `write(2)` or one `kill(2)`, no allocation, no locks. The interrupted
/// code gets its `errno` back untouched.
extern "C" fn relay_signal(signum: c_int) {
    let saved = Errno::last() as i32;
    forward(signum);
    platforms::set_errno(saved);
}

fn forward(signum: c_int) {
    if signum == Signal::SIGCHLD as c_int {
        let fd = NOTIFY_FD.load(Ordering::SeqCst);
        if fd < 0 {
            return;
        }
        match write(fd, &[0]) {
            // A full pipe already holds a wake-up for the loop.
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(errno) => NOTIFY_ERRNO.store(errno as i32, Ordering::SeqCst),
        }
    } else {
        let pid = DAEMON_PID.load(Ordering::SeqCst);
        // Before the fork completes there is nobody to forward to, and kill(0) would hit
        // our whole process group.
        if pid <= 0 {
            return;
        }
        if let Ok(signal) = Signal::try_from(signum) {
            let _ = kill(Pid::from_raw(pid), signal);
        }
    }
}

/// Installed signal handlers plus the state they read.
///
/// Only one relay may exist per process; installing a second one fails until the first is
/// dropped. Dropping it detaches the handlers from the daemon and the notifier; the handlers
/// themselves stay installed and become no-ops.
pub struct SignalRelay {
    _slot: (),
}
impl SignalRelay {
    pub fn install(notifier: &ExitNotifier) -> Result<SignalRelay, PrintableErrno<String>> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(printable_error(PROGRAM_NAME, "signal relay is already installed".to_string()));
        }
        // From here on, an early return drops the relay and releases the slot again.
        let relay = SignalRelay {
            _slot: (),
        };
        arm_notifier(notifier.write_fd());
        let action = SigAction::new(SigHandler::Handler(relay_signal), SaFlags::empty(), SigSet::empty());
        for &signal in [Signal::SIGCHLD].iter().chain(FORWARDED_SIGNALS.iter()) {
            // SAFETY: relay_signal only performs async-signal-safe calls on atomics it owns.
            unsafe { sigaction(signal, &action) }
                .printable(PROGRAM_NAME, format!("unable to install handler for {}", signal.as_str()))?;
        }
        Ok(relay)
    }

    /// Start forwarding signals to the freshly forked daemon.
    pub fn track(&self, daemon: Pid) {
        DAEMON_PID.store(daemon.as_raw(), Ordering::SeqCst);
    }

    /// The error the handler ran into while notifying us, if any. Clears it.
    pub fn take_failure(&self) -> Option<Errno> {
        take_notify_failure()
    }
}
impl Drop for SignalRelay {
    fn drop(&mut self) {
        DAEMON_PID.store(0, Ordering::SeqCst);
        NOTIFY_FD.store(-1, Ordering::SeqCst);
        INSTALLED.store(false, Ordering::SeqCst);
    }
}

fn arm_notifier(fd: RawFd) {
    NOTIFY_ERRNO.store(0, Ordering::SeqCst);
    NOTIFY_FD.store(fd, Ordering::SeqCst);
}

fn take_notify_failure() -> Option<Errno> {
    match NOTIFY_ERRNO.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Some(Errno::from_i32(raw)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    // The relay state is process-wide, so everything touching it runs in one test.
    #[test]
    fn handler_notifies_and_records_failures() {
        let notifier = ExitNotifier::open().ok().expect("notifier");

        arm_notifier(notifier.write_fd());
        relay_signal(Signal::SIGCHLD as c_int);
        relay_signal(Signal::SIGCHLD as c_int);
        assert_eq!(notifier.drain().ok(), Some(2));
        assert_eq!(notifier.drain().ok(), Some(0));
        assert_eq!(take_notify_failure(), None);

        // Writing into the read end fails; the handler has to stash the errno for later.
        arm_notifier(notifier.read_fd());
        relay_signal(Signal::SIGCHLD as c_int);
        assert_eq!(take_notify_failure(), Some(Errno::EBADF));
        assert_eq!(take_notify_failure(), None);

        // Nothing to forward to yet: must be a no-op rather than kill(0, SIGINT).
        DAEMON_PID.store(0, Ordering::SeqCst);
        relay_signal(Signal::SIGINT as c_int);

        // A full pipe already carries a wake-up, so EAGAIN is swallowed.
        while write(notifier.write_fd(), &[0u8; 512]).is_ok() {}
        arm_notifier(notifier.write_fd());
        relay_signal(Signal::SIGCHLD as c_int);
        assert_eq!(take_notify_failure(), None);
        assert!(notifier.drain().ok().map_or(false, |drained| drained > 0));

        NOTIFY_FD.store(-1, Ordering::SeqCst);
        relay_signal(Signal::SIGCHLD as c_int);
        assert_eq!(take_notify_failure(), None);

        // Failed write and failed kill inside the handler leave the interrupted errno alone.
        arm_notifier(notifier.read_fd());
        platforms::set_errno(Errno::EINTR as i32);
        relay_signal(Signal::SIGCHLD as c_int);
        assert_eq!(Errno::last(), Errno::EINTR);
        assert_eq!(take_notify_failure(), Some(Errno::EBADF));

        // Far above any pid_max, so kill(2) fails with ESRCH.
        DAEMON_PID.store(i32::MAX, Ordering::SeqCst);
        platforms::set_errno(Errno::EAGAIN as i32);
        relay_signal(Signal::SIGINT as c_int);
        assert_eq!(Errno::last(), Errno::EAGAIN);
        DAEMON_PID.store(0, Ordering::SeqCst);
        NOTIFY_FD.store(-1, Ordering::SeqCst);

        // One relay per process.
        let relay = SignalRelay::install(&notifier).ok().expect("first relay");
        assert!(SignalRelay::install(&notifier).is_err());
        drop(relay);
        assert_eq!(NOTIFY_FD.load(Ordering::SeqCst), -1);
        let relay = SignalRelay::install(&notifier).ok().expect("relay after drop");
        drop(relay);
    }
}
