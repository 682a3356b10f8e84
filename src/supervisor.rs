use nix::{
    errno::Errno,
    libc::STDIN_FILENO,
    poll::{
        PollFd,
        PollFlags,
        poll,
    },
    sys::signal::Signal,
    unistd::read,
};
use precisej_printable_errno::{
    ErrnoResult,
    ExitError,
    PrintableResult,
    printable_error,
};
use std::{
    fmt,
    os::unix::prelude::RawFd,
};

use crate::{
    command::{
        self,
        CONTROL_BUFFER_SIZE,
        Flow,
        SignalSink,
    },
    platforms::{
        DaemonHandle,
        ExitNotifier,
        ReapStatus,
        identity::{
            self,
            Elevation,
        },
    },
    relay::SignalRelay,
    variant::LaunchPlan,
    PROGRAM_NAME,
};


/// Blocks in poll(2) until something happens.
const WAIT_FOREVER: i32 = -1;

/// Why the supervisor stopped. All of these are a successful exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The controller closed the channel; the daemon was killed.
    ChannelClosed,
    /// The controller sent a terminate command; the daemon was killed.
    TerminateRequested,
    /// The daemon went away by itself.
    DaemonExited(ReapStatus),
}
impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shutdown::ChannelClosed => write!(f, "control channel closed, daemon killed"),
            Shutdown::TerminateRequested => write!(f, "terminate requested, daemon killed"),
            Shutdown::DaemonExited(status) => write!(f, "{}, exiting", status),
        }
    }
}

/// Owns the daemon, the exit notifier and the signal relay for the lifetime of the process.
///
/// There is exactly one daemon per supervisor and it is never restarted: whatever happens to
/// the daemon happens to us too.
pub struct Supervisor {
    // Declared first so its Drop detaches the handlers before the pipe is closed.
    relay: SignalRelay,
    notifier: ExitNotifier,
    daemon: DaemonHandle,
    control: RawFd,
}
impl Supervisor {
    /// Elevates, arms the relay and forks the daemon, in that order. Nothing is forked unless
    /// every step before it succeeded.
    pub fn start(plan: &LaunchPlan) -> Result<Supervisor, ExitError<String>> {
        if let Elevation::Elevated(uid) = identity::force_root_identity().bail(1)? {
            printable_error(PROGRAM_NAME, format!("real, effective and saved uid set to {}", uid)).eprint();
        }
        let notifier = ExitNotifier::open().bail(2)?;
        let relay = SignalRelay::install(&notifier).bail(3)?;
        let daemon = DaemonHandle::spawn(plan).bail(5)?;
        relay.track(daemon.pid());

        printable_error(
            PROGRAM_NAME,
            format!("started {} ({}) as pid {}", plan.daemon().selector(), plan.path().to_string_lossy(), daemon.pid()),
        ).eprint();

        Ok(Supervisor {
            relay,
            notifier,
            daemon,
            control: STDIN_FILENO,
        })
    }

    /// The event loop. Returns once the daemon is gone or the controller asked for it to be.
    pub fn run(&mut self) -> Result<Shutdown, ExitError<String>> {
        loop {
            let mut fds = [
                PollFd::new(self.control, PollFlags::POLLIN),
                PollFd::new(self.notifier.read_fd(), PollFlags::POLLIN),
            ];
            let polled = poll(&mut fds, WAIT_FOREVER);
            self.check_relay()?;
            match polled {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    self.daemon.deliver(Signal::SIGKILL);
                    return Err(errno).printable(PROGRAM_NAME, "poll failed".to_string()).bail(8);
                }
            }

            let control = fds[0].revents().unwrap_or_else(PollFlags::empty);
            if control.contains(PollFlags::POLLNVAL) {
                command::hang_up(&self.daemon);
                return Ok(Shutdown::ChannelClosed);
            }
            if control.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                if let Some(shutdown) = self.service_control()? {
                    return Ok(shutdown);
                }
            }

            let notified = fds[1].revents().unwrap_or_else(PollFlags::empty);
            if notified.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                if let Some(shutdown) = self.service_notifier()? {
                    return Ok(shutdown);
                }
            }
        }
    }

    /// Surface a failure the signal handler could only write down.
    fn check_relay(&self) -> Result<(), ExitError<String>> {
        match self.relay.take_failure() {
            Some(errno) => {
                self.daemon.deliver(Signal::SIGKILL);
                Err(errno)
                    .printable(PROGRAM_NAME, "unable to write to the daemon exit notification pipe".to_string())
                    .bail(9)
            }
            None => Ok(()),
        }
    }

    fn service_control(&mut self) -> Result<Option<Shutdown>, ExitError<String>> {
        let mut buffer = [0u8; CONTROL_BUFFER_SIZE];
        let amount = match read(self.control, &mut buffer) {
            Ok(amount) => amount,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(None),
            Err(errno) => {
                // Same as end of input: the controller is gone.
                printable_error(PROGRAM_NAME, format!("unable to read control channel: {}", errno)).eprint();
                0
            }
        };
        if amount == 0 {
            command::hang_up(&self.daemon);
            return Ok(Some(Shutdown::ChannelClosed));
        }

        match command::dispatch(&self.daemon, &buffer[..amount]).bail(7)? {
            Flow::Continue => Ok(None),
            Flow::Terminate => Ok(Some(Shutdown::TerminateRequested)),
        }
    }

    /// Readability is only a hint: SIGCHLD also fires for stops and continues, and several
    /// notifications may describe one exit. Only a collected exit status ends the loop.
    fn service_notifier(&mut self) -> Result<Option<Shutdown>, ExitError<String>> {
        if let Err(e) = self.notifier.drain() {
            self.daemon.deliver(Signal::SIGKILL);
            return Err(e).bail(10);
        }
        match self.daemon.try_reap() {
            Ok(status) if status.is_final() => Ok(Some(Shutdown::DaemonExited(status))),
            Ok(_) => Ok(None),
            Err(e) => {
                self.daemon.deliver(Signal::SIGKILL);
                Err(e).bail(11)
            }
        }
    }
}
