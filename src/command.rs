use nix::sys::signal::Signal;
use precisej_printable_errno::{
    PrintableErrno,
    printable_error,
};
use std::convert::TryFrom;

use crate::PROGRAM_NAME;


/// Largest number of queued commands consumed by a single read of the control channel.
pub const CONTROL_BUFFER_SIZE: usize = 128;

/// One byte on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Renew = 1,
    Release = 2,
    Terminate = 3,
}
impl Command {
    /// The signal the daemon receives for this command.
    pub fn signal(self) -> Signal {
        match self {
            Command::Renew => Signal::SIGUSR1,
            Command::Release => Signal::SIGUSR2,
            Command::Terminate => Signal::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Renew => "renew",
            Command::Release => "release",
            Command::Terminate => "terminate",
        }
    }
}
impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(Command::Renew),
            2 => Ok(Command::Release),
            3 => Ok(Command::Terminate),
            other => Err(other),
        }
    }
}

/// Anything that can receive signals on behalf of the daemon.
pub trait SignalSink {
    /// Fire and forget: the daemon may already be gone.
    fn deliver(&self, signal: Signal);
}

/// What the supervisor should do after a batch of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

/// Applies every command in `batch` to `daemon`, in order.
///
/// A terminate command ends the batch early, discarding whatever was queued behind it. An
/// unknown byte kills the daemon before the error is returned, so we never leave a privileged
/// daemon running without anyone to control it.
pub fn dispatch<S: SignalSink>(daemon: &S, batch: &[u8]) -> Result<Flow, PrintableErrno<String>> {
    for &byte in batch {
        let command = match Command::try_from(byte) {
            Ok(command) => command,
            Err(unknown) => {
                daemon.deliver(Signal::SIGKILL);
                return Err(printable_error(PROGRAM_NAME, format!("unexpected command: {}", unknown)));
            }
        };

        printable_error(PROGRAM_NAME, format!("{} requested, sending {}", command.name(), command.signal().as_str()))
            .eprint();
        daemon.deliver(command.signal());
        if command == Command::Terminate {
            return Ok(Flow::Terminate);
        }
    }
    Ok(Flow::Continue)
}

/// The controller went away: nobody is left to manage the daemon.
pub fn hang_up<S: SignalSink>(daemon: &S) {
    daemon.deliver(Signal::SIGKILL);
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        delivered: RefCell<Vec<Signal>>,
    }
    impl SignalSink for Recorder {
        fn deliver(&self, signal: Signal) {
            self.delivered.borrow_mut().push(signal);
        }
    }
    impl Recorder {
        fn delivered(&self) -> Vec<Signal> {
            self.delivered.borrow().clone()
        }
    }

    #[test]
    fn decodes_only_known_bytes() {
        assert_eq!(Command::try_from(1u8), Ok(Command::Renew));
        assert_eq!(Command::try_from(2u8), Ok(Command::Release));
        assert_eq!(Command::try_from(3u8), Ok(Command::Terminate));
        assert_eq!(Command::try_from(0u8), Err(0));
        assert_eq!(Command::try_from(4u8), Err(4));
        assert_eq!(Command::try_from(0xffu8), Err(0xff));
    }

    #[test]
    fn one_signal_per_command_in_order() {
        let daemon = Recorder::default();
        let flow = dispatch(&daemon, &[1, 2, 2, 1]).ok();
        assert_eq!(flow, Some(Flow::Continue));
        assert_eq!(
            daemon.delivered(),
            [Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGUSR2, Signal::SIGUSR1]
        );
    }

    #[test]
    fn empty_batch_does_nothing() {
        let daemon = Recorder::default();
        assert_eq!(dispatch(&daemon, &[]).ok(), Some(Flow::Continue));
        assert!(daemon.delivered().is_empty());
    }

    #[test]
    fn terminate_discards_the_rest_of_the_batch() {
        let daemon = Recorder::default();
        let flow = dispatch(&daemon, &[1, 3, 2, 1]).ok();
        assert_eq!(flow, Some(Flow::Terminate));
        assert_eq!(daemon.delivered(), [Signal::SIGUSR1, Signal::SIGKILL]);
    }

    #[test]
    fn unknown_byte_kills_before_failing() {
        let daemon = Recorder::default();
        let result = dispatch(&daemon, &[2, 42, 1]);
        assert!(result.is_err());
        assert_eq!(daemon.delivered(), [Signal::SIGUSR2, Signal::SIGKILL]);
    }

    #[test]
    fn nul_byte_is_not_a_command() {
        let daemon = Recorder::default();
        assert!(dispatch(&daemon, &[0]).is_err());
        assert_eq!(daemon.delivered(), [Signal::SIGKILL]);
    }

    #[test]
    fn hang_up_kills() {
        let daemon = Recorder::default();
        hang_up(&daemon);
        assert_eq!(daemon.delivered(), [Signal::SIGKILL]);
    }

    #[test]
    fn full_buffer_of_renewals() {
        let daemon = Recorder::default();
        let batch = [1u8; CONTROL_BUFFER_SIZE];
        assert_eq!(dispatch(&daemon, &batch).ok(), Some(Flow::Continue));
        assert_eq!(daemon.delivered().len(), CONTROL_BUFFER_SIZE);
    }
}
