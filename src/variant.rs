use const_format::concatcp;
use cstr::cstr;
use precisej_printable_errno::{
    PrintableErrno,
    printable_error,
};
use std::{
    ffi::{
        CStr,
        CString,
        OsStr,
        OsString,
    },
    os::unix::ffi::OsStrExt,
};

use crate::PROGRAM_NAME;


const DHCLIENT_ARG0: &'static str = "dhclient";
const UDHCPC_ARG0: &'static str = "udhcpc";
const DAEMON_DIR: &'static str = "/sbin/";
const DHCLIENT_ERROR: &'static str = concatcp!("unable to execute ", DHCLIENT_ARG0, " in ", DAEMON_DIR);
const UDHCPC_ERROR: &'static str = concatcp!("unable to execute ", UDHCPC_ARG0, " in ", DAEMON_DIR);

/// Debug builds may point the supervisor at any executable through this variable.
#[cfg(feature = "debug-daemon-override")]
pub const DAEMON_OVERRIDE_ENV: &'static str = "DHCP_WRAPPER_DAEMON";
#[cfg(feature = "debug-daemon-override")]
const DAEMON_OVERRIDE_ERROR: &'static str = concatcp!("unable to execute the daemon named by ", DAEMON_OVERRIDE_ENV);


/// A DHCP client daemon the supervisor knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemon {
    /// ISC dhclient, for both DHCPv4 and DHCPv6.
    Dhclient,
    /// Busybox udhcpc.
    Udhcpc,
}
impl Daemon {
    const ALL: [Daemon; 2] = [Daemon::Dhclient, Daemon::Udhcpc];

    /// Prefix of the first argument that selects this daemon.
    pub fn selector(self) -> &'static str {
        match self {
            Daemon::Dhclient => DHCLIENT_ARG0,
            Daemon::Udhcpc => UDHCPC_ARG0,
        }
    }

    /// Where the daemon binary is installed.
    pub fn path(self) -> &'static CStr {
        match self {
            Daemon::Dhclient => cstr!("/sbin/dhclient"),
            Daemon::Udhcpc => cstr!("/sbin/udhcpc"),
        }
    }

    fn exec_error(self) -> &'static str {
        match self {
            Daemon::Dhclient => DHCLIENT_ERROR,
            Daemon::Udhcpc => UDHCPC_ERROR,
        }
    }

    /// udhcpc gets no stdin at all: the control channel belongs to us.
    fn detach_stdin(self) -> bool {
        matches!(self, Daemon::Udhcpc)
    }

    fn from_selector(selector: &OsStr) -> Option<Daemon> {
        let selector = selector.as_bytes();
        Daemon::ALL
            .iter()
            .copied()
            .find(|daemon| selector.starts_with(daemon.selector().as_bytes()))
    }
}

/// How the program was invoked.
#[derive(Debug, PartialEq)]
pub enum Invocation<'a> {
    /// Spawn and supervise `daemon`, passing `passthrough` to it.
    Supervise {
        daemon: Daemon,
        passthrough: &'a [OsString],
    },
    /// We are the daemon's lease event script.
    Callback {
        program: Option<&'a OsStr>,
        event: Option<&'a OsStr>,
    },
}
impl<'a> Invocation<'a> {
    /// `args` is the full argument vector, including the program name.
    pub fn from_args(args: &'a [OsString]) -> Invocation<'a> {
        let selector = args.get(1).map(OsString::as_os_str);
        match selector.and_then(Daemon::from_selector) {
            Some(daemon) => Invocation::Supervise {
                daemon,
                passthrough: &args[2..],
            },
            None => Invocation::Callback {
                program: args.get(0).map(OsString::as_os_str),
                event: selector,
            },
        }
    }
}

/// Everything the forked child needs to exec the daemon.
///
/// Built before forking: between `fork()` and `execv()` the child must not allocate.
#[derive(Debug)]
pub struct LaunchPlan {
    daemon: Daemon,
    path: CString,
    argv: Vec<CString>,
    exec_error: &'static str,
}
impl LaunchPlan {
    /// The daemon's argument vector is its own path followed by `passthrough`.
    pub fn new(daemon: Daemon, passthrough: &[OsString]) -> Result<LaunchPlan, PrintableErrno<String>> {
        let (path, exec_error) = resolve_daemon(daemon)?;
        let mut argv = Vec::with_capacity(passthrough.len() + 1);
        argv.push(path.clone());
        for arg in passthrough {
            argv.push(to_cstring(arg)?);
        }
        Ok(LaunchPlan {
            daemon,
            path,
            argv,
            exec_error,
        })
    }

    pub fn daemon(&self) -> Daemon {
        self.daemon
    }

    pub fn path(&self) -> &CStr {
        &self.path
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn exec_error(&self) -> &'static str {
        self.exec_error
    }

    pub fn detach_stdin(&self) -> bool {
        self.daemon.detach_stdin()
    }
}

#[cfg(feature = "debug-daemon-override")]
fn resolve_daemon(daemon: Daemon) -> Result<(CString, &'static str), PrintableErrno<String>> {
    match std::env::var_os(DAEMON_OVERRIDE_ENV) {
        Some(path) => {
            printable_error(PROGRAM_NAME, format!("{} overridden with {:?}", daemon.selector(), path)).eprint();
            Ok((to_cstring(&path)?, DAEMON_OVERRIDE_ERROR))
        }
        None => Ok((daemon.path().to_owned(), daemon.exec_error())),
    }
}

#[cfg(not(feature = "debug-daemon-override"))]
fn resolve_daemon(daemon: Daemon) -> Result<(CString, &'static str), PrintableErrno<String>> {
    Ok((daemon.path().to_owned(), daemon.exec_error()))
}

fn to_cstring(arg: &OsStr) -> Result<CString, PrintableErrno<String>> {
    CString::new(arg.as_bytes())
        .map_err(|_| printable_error(PROGRAM_NAME, format!("daemon argument {:?} contains a nul byte", arg)))
}
