//! Privileged supervisor and callback reporter for DHCP client daemons.
//!
//! # What?
//! dhcp-wrapper sits between a controlling process (an orchestrator that talks
//! to it over standard input) and a DHCP client daemon (`dhclient` or `udhcpc`)
//! that it spawns, watches and signals. The same binary doubles as the script
//! the DHCP client runs on every lease event: in that mode it turns the
//! environment the client hands over into one comma-separated line on standard
//! output, which the controller reads back.
//!
//! # Supervisor mode
//! Selected when the first argument starts with `dhclient` or `udhcpc`. The
//! remaining arguments are passed through to the daemon unchanged. Before
//! spawning, the real user id is raised to the effective one (the binary is
//! expected to be installed setuid root, which only raises the effective and
//! saved ids, and the daemons insist on a real root identity).
//!
//! Once the daemon runs, every byte read from standard input is one command:
//!
//! | byte   | command   | effect on the daemon               |
//! |--------|-----------|------------------------------------|
//! | `0x01` | renew     | `SIGUSR1`                          |
//! | `0x02` | release   | `SIGUSR2`                          |
//! | `0x03` | terminate | `SIGKILL`, then exit successfully  |
//!
//! End of input kills the daemon and exits successfully. Any other byte kills
//! the daemon and exits with an error. When the daemon dies on its own, so do
//! we. Nothing is ever written back over the channel.
//!
//! # Callback mode
//! Any other invocation. The lease event is read from the environment (and,
//! for udhcpc, from the first argument) and printed as a single line, with
//! missing values left empty. dhclient records start with the path we were
//! run by.
#![crate_name = "dhcp_wrapper"]
#![cfg_attr(test, deny(warnings))]
#![deny(unused)]
#![deny(unstable_features)]
#![warn(missing_docs)]
#![allow(rustdoc::private_intra_doc_links)]

// Fail compilation early if incompatible features are enabled
#[cfg(all(not(debug_assertions), any(feature = "debug-daemon-override")))]
compile_error!("Building release build with debug features: in order to compile a build with \
                debug-* features, you must compile without the \"--release\" flag.");

/// Commands received over the control channel and their delivery to the daemon.
mod command;

/// Every platform exposes credentials, pipes and process creation a little differently.
/// This module hides those differences behind a small platform-independent surface.
mod platforms;

/// Async-signal-safe relay between signal handlers and the supervisor loop.
mod relay;

/// Lease event reporting (callback mode).
mod report;

/// The supervisor event loop.
mod supervisor;

/// Invocation modes and the daemons we know how to launch.
mod variant;

use precisej_printable_errno::{
    ExitError,
    PrintableResult,
    printable_error,
};
use std::{
    env,
    ffi::OsString,
};

use crate::{
    supervisor::Supervisor,
    variant::{
        Daemon,
        Invocation,
        LaunchPlan,
    },
};


/// The program is called `dhcp-wrapper`. The str referring to the program name is saved in
/// this constant. Useful for [PrintableResult].
const PROGRAM_NAME: &'static str = "dhcp-wrapper";

/// The entry point of the program. This function is in charge of exiting with an error
/// code when [wrapper] returns an [ExitError].
fn main() {
    if let Err(e) = wrapper() {
        e.eprint_and_exit()
    }
}

/// Picks the invocation mode from the first argument and runs it.
///
/// Exit codes on failure:
/// * 1: unable to raise the real user id
/// * 2: unable to create the exit notification pipe
/// * 3: unable to install signal handlers
/// * 4: daemon arguments could not be converted
/// * 5: unable to fork
/// * 6: unable to execute the daemon (exit status of the forked child)
/// * 7: unexpected command byte on the control channel
/// * 8: waiting on the control channel failed
/// * 9: the signal handler could not notify the supervisor loop
/// * 10: the exit notification pipe could not be drained
/// * 11: the daemon's status could not be collected
/// * 12: the lease report could not be written
fn wrapper() -> Result<(), ExitError<String>> {
    let args: Vec<OsString> = env::args_os().collect();
    match Invocation::from_args(&args) {
        Invocation::Supervise { daemon, passthrough } => supervise(daemon, passthrough),
        Invocation::Callback { program, event } => report::report_lease_event(program, event).bail(12),
    }
}

/// Launches the daemon and relays commands to it until either side goes away.
fn supervise(daemon: Daemon, passthrough: &[OsString]) -> Result<(), ExitError<String>> {
    let plan = LaunchPlan::new(daemon, passthrough).bail(4)?;
    let mut supervisor = Supervisor::start(&plan)?;
    let shutdown = supervisor.run()?;
    printable_error(PROGRAM_NAME, shutdown.to_string()).eprint();
    Ok(())
}
