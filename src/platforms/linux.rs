use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc::{
        self,
        STDIN_FILENO,
    },
    sys::wait::{
        WaitPidFlag,
        WaitStatus,
        waitpid,
    },
    unistd::{
        ForkResult,
        Pid,
        ResUid,
        Uid,
        close,
        execv,
        fork,
        getresuid,
        pipe2,
        read,
        setresuid,
    },
};
use std::{
    ffi::{
        CStr,
        CString,
    },
    os::unix::prelude::RawFd,
};
use precisej_printable_errno::{
    ErrnoResult,
    ExitErrorResult,
    PrintableErrno,
    PrintableResult,
};

use crate::{
    platforms::{
        self,
        identity::CredentialSource,
    },
    variant::LaunchPlan,
    PROGRAM_NAME,
};


/// Credentials of the running process.
pub(crate) struct ProcessCredentials;
impl CredentialSource for ProcessCredentials {
    fn query(&self) -> nix::Result<ResUid> {
        getresuid()
    }

    fn assume(&self, uid: Uid) -> nix::Result<()> {
        setresuid(uid, uid, uid)
    }
}


pub(crate) fn set_errno(raw: i32) {
    // SAFETY: __errno_location always points at the calling thread's errno.
    unsafe { *libc::__errno_location() = raw };
}


pub(crate) struct OpaqueExitNotifier {
    read_end: RawFd,
    write_end: RawFd,
}
impl OpaqueExitNotifier {
    pub(crate) fn open() -> Result<OpaqueExitNotifier, PrintableErrno<String>> {
        // Non-blocking so the signal handler can never stall on a full pipe, close-on-exec so the
        // daemon never sees either end.
        let (read_end, write_end) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .printable(PROGRAM_NAME, "unable to create the daemon exit notification pipe".to_string())?;
        Ok(OpaqueExitNotifier {
            read_end,
            write_end,
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_end
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_end
    }

    pub(crate) fn drain(&self) -> Result<usize, PrintableErrno<String>> {
        let mut buffer = [0u8; 64];
        let mut drained = 0;
        loop {
            match read(self.read_end, &mut buffer) {
                Ok(0) => break Ok(drained),
                Ok(amount) => drained += amount,
                Err(Errno::EAGAIN) => break Ok(drained),
                Err(Errno::EINTR) => { /* retry */ }
                Err(errno) => {
                    break Err(errno).printable(PROGRAM_NAME, "unable to drain the daemon exit notification pipe".to_string())
                }
            }
        }
    }
}
impl Drop for OpaqueExitNotifier {
    fn drop(&mut self) {
        let _ = close(self.read_end);
        let _ = close(self.write_end);
    }
}


pub(crate) struct OpaqueDaemonHandle {
    pid: Pid,
}
impl OpaqueDaemonHandle {
    pub(crate) fn spawn(plan: &LaunchPlan) -> Result<OpaqueDaemonHandle, PrintableErrno<String>> {
        let argv: Vec<&CStr> = plan.argv().iter().map(CString::as_c_str).collect();

        let pid = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            #[allow(unreachable_code)]
            Ok(ForkResult::Child) => {
                // We are the child. Only async-signal-safe calls are allowed until execv, which is
                // why the argument vector and the error message were prepared by our parent.
                // Exiting here is observed by the supervisor as an ordinary daemon exit.
                if plan.detach_stdin() {
                    let _ = close(STDIN_FILENO);
                }
                let err = execv(plan.path(), &argv)
                    .printable(PROGRAM_NAME, plan.exec_error())
                    .bail(6);
                unsafe { err.unwrap_or_eprint_signal_safe_exit() };
                unreachable!()
            }
            Err(errno) => {
                // fork() failing should be a fatal error, so bubble up a printable error.
                return Err(errno).printable(PROGRAM_NAME, "unable to fork child for the daemon".to_string());
            }
        };

        Ok(OpaqueDaemonHandle {
            pid,
        })
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn try_reap(&mut self) -> Result<platforms::ReapStatus, PrintableErrno<String>> {
        let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            Err(Errno::ECHILD) => return Ok(platforms::ReapStatus::Gone),
            Err(Errno::EINTR) => return Ok(platforms::ReapStatus::Running),
            Err(e) => return Err(e).printable(PROGRAM_NAME, "unable to wait for the daemon".to_string()),
        };
        match status {
            WaitStatus::Exited(_, exit_code) => Ok(platforms::ReapStatus::Exited(exit_code)),
            WaitStatus::Signaled(_, sig, _) => Ok(platforms::ReapStatus::Killed(sig)),
            WaitStatus::StillAlive => Ok(platforms::ReapStatus::Running),

            // WaitStatus::Stopped(_, _)
            // WaitStatus::PtraceEvent(_, _, _)
            // WaitStatus::PtraceSyscall(_)
            // WaitStatus::Continued(_)
            //
            // What do they have in common?
            // The daemon is still around, SIGCHLD just told us about a state change.
            _ => Ok(platforms::ReapStatus::Running),
        }
    }
}
