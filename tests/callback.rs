//! Callback mode, driven through the real binary the way a DHCP client would run it.

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    process::{
        Command,
        Output,
    },
};

const WRAPPER: &'static str = env!("CARGO_BIN_EXE_dhcp-wrapper");

fn callback(args: &[&str], vars: &[(&str, &str)]) -> Output {
    Command::new(WRAPPER)
        .args(args)
        .env_clear()
        .envs(vars.iter().copied())
        .output()
        .expect("unable to run dhcp-wrapper")
}

fn single_line(output: &Output) -> String {
    assert!(output.status.success(), "callback failed: {:?}", output);
    let stdout = String::from_utf8(output.stdout.clone()).expect("report is not UTF-8");
    let mut lines = stdout.lines();
    let line = lines.next().expect("no report line").to_string();
    assert_eq!(lines.next(), None, "more than one report line in {:?}", stdout);
    line
}

#[test]
fn dhclient_bound_event() {
    let output = callback(&[], &[
        ("reason", "BOUND"),
        ("interface", "eth0"),
        ("new_ip_address", "10.0.0.5"),
    ]);
    let line = single_line(&output);
    let fields: Vec<&str> = line.split(',').collect();
    assert_eq!(fields.len(), 10);
    assert_eq!(&fields[..4], [WRAPPER, "BOUND", "eth0", "10.0.0.5"]);
    assert!(fields[4..].iter().all(|field| field.is_empty()));
}

#[test]
fn dhclient6_combines_address_and_prefix_length() {
    let output = callback(&[], &[
        ("new_ip6_address", "fe80::1"),
        ("new_ip6_prefixlen", "64"),
    ]);
    assert_eq!(single_line(&output), format!("{},,,fe80::1/64,,,", WRAPPER));
}

#[test]
fn dhclient6_prefers_the_combined_form() {
    let output = callback(&[], &[
        ("reason", "REBIND6"),
        ("interface", "eth0"),
        ("new_ip6_prefix", "fe80::1/64"),
        ("new_ip6_address", "fe80::2"),
        ("new_ip6_prefixlen", "48"),
        ("new_dhcp6_name_servers", "2001:db8::53"),
    ]);
    assert_eq!(single_line(&output), format!("{},REBIND6,eth0,fe80::1/64,,2001:db8::53,", WRAPPER));
}

#[test]
fn udhcpc_event_argument() {
    let output = callback(&["renew"], &[
        ("interface", "eth0"),
        ("ip", "192.168.7.10"),
        ("router", "192.168.7.1"),
        ("message", "lease renewed"),
    ]);
    assert_eq!(single_line(&output), "renew,eth0,192.168.7.10,,,192.168.7.1,,,lease renewed");
}

#[test]
fn nothing_set_is_still_one_line() {
    let output = callback(&[], &[]);
    assert_eq!(single_line(&output), format!("{},,,,,,,,,", WRAPPER));
}

#[test]
fn values_are_not_reencoded() {
    let output = Command::new(WRAPPER)
        .env_clear()
        .env("reason", "BOUND")
        .env("interface", OsStr::from_bytes(b"eth\xff0"))
        .output()
        .expect("unable to run dhcp-wrapper");
    assert!(output.status.success(), "callback failed: {:?}", output);

    let mut expected = WRAPPER.as_bytes().to_vec();
    expected.extend_from_slice(b",BOUND,eth\xff0,,,,,,,\n");
    assert_eq!(output.stdout, expected);
}
