use nix::{
    errno::Errno,
    libc::STDOUT_FILENO,
    unistd::write,
};
use precisej_printable_errno::{
    ErrnoResult,
    PrintableErrno,
};
use std::{
    env,
    ffi::{
        OsStr,
        OsString,
    },
    os::unix::{
        ffi::OsStrExt,
        prelude::RawFd,
    },
};

use crate::PROGRAM_NAME;


/// One column of a lease report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The path the daemon ran us by.
    Program,
    /// The event name passed as our first argument.
    Event,
    /// A plain environment variable.
    Env(&'static str),
    /// `prefix` verbatim if set, else `address/length` if both are set, else empty.
    Prefixed {
        prefix: &'static str,
        address: &'static str,
        length: &'static str,
    },
}

/// The fields a DHCP client hands its script, in the order the controller expects them.
#[derive(Debug, PartialEq, Eq)]
pub struct ReportSchema {
    pub fields: &'static [Field],
}

pub static UDHCPC_SCHEMA: ReportSchema = ReportSchema {
    fields: &[
        Field::Event,
        Field::Env("interface"),
        Field::Env("ip"),
        Field::Env("broadcast"),
        Field::Env("subnet"),
        Field::Env("router"),
        Field::Env("domain"),
        Field::Env("dns"),
        Field::Env("message"),
    ],
};

pub static DHCLIENT_SCHEMA: ReportSchema = ReportSchema {
    fields: &[
        Field::Program,
        Field::Env("reason"),
        Field::Env("interface"),
        Field::Env("new_ip_address"),
        Field::Env("new_broadcast_address"),
        Field::Env("new_subnet_mask"),
        Field::Env("new_routers"),
        Field::Env("new_domain_name"),
        Field::Env("new_domain_name_servers"),
        Field::Env("old_ip_address"),
    ],
};

pub static DHCLIENT6_SCHEMA: ReportSchema = ReportSchema {
    fields: &[
        Field::Program,
        Field::Env("reason"),
        Field::Env("interface"),
        Field::Prefixed {
            prefix: "new_ip6_prefix",
            address: "new_ip6_address",
            length: "new_ip6_prefixlen",
        },
        Field::Env("new_dhcp6_domain_search"),
        Field::Env("new_dhcp6_name_servers"),
        Field::Prefixed {
            prefix: "old_ip6_prefix",
            address: "old_ip6_address",
            length: "old_ip6_prefixlen",
        },
    ],
};

const IP6_KEYS: [&'static str; 6] = [
    "new_ip6_prefix",
    "new_ip6_address",
    "new_ip6_prefixlen",
    "old_ip6_prefix",
    "old_ip6_address",
    "old_ip6_prefixlen",
];

/// Works out which client is calling us.
///
/// udhcpc names the event in its first argument and never sets `reason`; dhclient runs its
/// script without arguments. DHCPv6 reasons end in `6` (`BOUND6`, `EXPIRE6`, ...), and the
/// address keys give it away when the reason doesn't.
pub fn select_schema<F>(event: Option<&OsStr>, lookup: F) -> &'static ReportSchema
where
    F: Fn(&str) -> Option<OsString>,
{
    let reason = lookup("reason");
    if event.is_some() && reason.is_none() {
        return &UDHCPC_SCHEMA;
    }
    let dhcp6_reason = reason.map_or(false, |reason| reason.as_bytes().ends_with(b"6"));
    if dhcp6_reason || IP6_KEYS.iter().any(|&key| lookup(key).is_some()) {
        &DHCLIENT6_SCHEMA
    } else {
        &DHCLIENT_SCHEMA
    }
}

/// One lease event, ready to print. Values are kept as the raw bytes the daemon handed us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    fields: Vec<OsString>,
}
impl ReportRecord {
    /// Missing variables are reported as empty fields, never as errors.
    pub fn collect<F>(schema: &ReportSchema, program: Option<&OsStr>, event: Option<&OsStr>, lookup: F) -> ReportRecord
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let fields = schema.fields
            .iter()
            .map(|field| match *field {
                Field::Program => program.map(OsStr::to_os_string).unwrap_or_default(),
                Field::Event => event.map(OsStr::to_os_string).unwrap_or_default(),
                Field::Env(key) => lookup(key).unwrap_or_default(),
                Field::Prefixed { prefix, address, length } => match (lookup(prefix), lookup(address), lookup(length)) {
                    (Some(prefix), _, _) => prefix,
                    (None, Some(mut address), Some(length)) => {
                        address.push("/");
                        address.push(length);
                        address
                    }
                    _ => OsString::new(),
                },
            })
            .collect();
        ReportRecord {
            fields,
        }
    }

    pub fn fields(&self) -> &[OsString] {
        &self.fields
    }

    /// The fields joined by `,`, without a line terminator.
    pub fn line(&self) -> Vec<u8> {
        let mut line = Vec::new();
        for (i, field) in self.fields().iter().enumerate() {
            if i > 0 {
                line.push(b',');
            }
            line.extend_from_slice(field.as_bytes());
        }
        line
    }
}

fn process_env(key: &str) -> Option<OsString> {
    env::var_os(key)
}

/// Callback mode: print the lease event described by our environment as one line on stdout.
pub fn report_lease_event(program: Option<&OsStr>, event: Option<&OsStr>) -> Result<(), PrintableErrno<String>> {
    let schema = select_schema(event, process_env);
    let record = ReportRecord::collect(schema, program, event, process_env);
    write_line(STDOUT_FILENO, record.line())
}

/// Unbuffered, so the line is out before we exit; short writes are continued.
fn write_line(fd: RawFd, mut pending: Vec<u8>) -> Result<(), PrintableErrno<String>> {
    pending.push(b'\n');
    let mut written = 0;
    while written < pending.len() {
        match write(fd, &pending[written..]) {
            Ok(amount) => written += amount,
            Err(Errno::EINTR) => { /* retry */ }
            Err(errno) => return Err(errno).printable(PROGRAM_NAME, "unable to write the lease report".to_string()),
        }
    }
    Ok(())
}
