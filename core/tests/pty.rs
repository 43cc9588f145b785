//! End-to-end scenarios for the pseudo-terminal-backed coprocess.

use std::io::Read;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use anyhow::Result;
use anyhow::bail;
use coproc_core::CommandSpec;
use coproc_core::CoprocError;
use coproc_core::PtyCoprocess;
use coproc_core::PtySettings;
use coproc_utils_pty::MIN_SUBORDINATE_NAME_LEN;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;

/// End-of-transmission; at line start the terminal turns it into EOF.
const EOT: &[u8] = &[0x04];

fn name_buf() -> [u8; MIN_SUBORDINATE_NAME_LEN] {
    [0u8; MIN_SUBORDINATE_NAME_LEN]
}

/// Reads from the master until `needle` has been seen, with a timeout so a
/// wedged child fails the test instead of hanging it.
fn read_until(coproc: &mut PtyCoprocess, needle: &str) -> Result<String> {
    let mut seen = String::new();
    loop {
        if seen.contains(needle) {
            return Ok(seen);
        }
        let master = match coproc.master() {
            Some(master) => master,
            None => bail!("master closed while waiting for {needle:?}; saw {seen:?}"),
        };
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        if poll(&mut fds, PollTimeout::from(5_000u16))? == 0 {
            bail!("timed out waiting for {needle:?}; saw {seen:?}");
        }
        let mut chunk = [0u8; 256];
        let n = master.read(&mut chunk)?;
        if n == 0 {
            bail!("end of stream before {needle:?}; saw {seen:?}");
        }
        seen.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
}

fn assert_clean_exit(status: ExitStatus) {
    // A pty child may be taken down by hangup when the master closes first.
    let hangup = status.signal() == Some(libc::SIGHUP);
    assert!(status.success() || hangup, "unexpected status {status:?}");
}

#[test]
fn output_arrives_without_explicit_flushing() -> Result<()> {
    let mut name = name_buf();
    let mut coproc = PtyCoprocess::open(
        &CommandSpec::new("cat").argv(["cat"]),
        &PtySettings::default(),
        &mut name,
    )?;
    assert!(name.starts_with(b"/dev/"));
    assert!(coproc.subordinate().is_absolute());

    if let Some(master) = coproc.master() {
        master.write_all(b"abc\n")?;
    }
    read_until(&mut coproc, "abc")?;

    if let Some(master) = coproc.master() {
        master.write_all(EOT)?;
    }
    assert_clean_exit(coproc.close()?);
    Ok(())
}

#[test]
fn shell_invocation_over_a_pty() -> Result<()> {
    let mut name = name_buf();
    let mut coproc = PtyCoprocess::open(
        &CommandSpec::new("cat | cat"),
        &PtySettings::default(),
        &mut name,
    )?;

    if let Some(master) = coproc.master() {
        master.write_all(b"def\n")?;
    }
    read_until(&mut coproc, "def")?;

    if let Some(master) = coproc.master() {
        master.write_all(EOT)?;
    }
    assert_clean_exit(coproc.close()?);
    Ok(())
}

#[test]
fn close_is_idempotent() -> Result<()> {
    let mut name = name_buf();
    let mut coproc = PtyCoprocess::open(
        &CommandSpec::new("cat").argv(["cat"]),
        &PtySettings::default(),
        &mut name,
    )?;
    if let Some(master) = coproc.master() {
        master.write_all(EOT)?;
    }
    assert_clean_exit(coproc.close()?);
    assert!(coproc.master().is_none());
    assert!(coproc.pid().is_none());

    let second = coproc.close()?;
    assert_eq!(second.code(), Some(0));
    Ok(())
}

#[test]
fn undersized_name_buffer_is_rejected() {
    let mut short = [0u8; MIN_SUBORDINATE_NAME_LEN - 1];
    let err = match PtyCoprocess::open(
        &CommandSpec::new("cat").argv(["cat"]),
        &PtySettings::default(),
        &mut short,
    ) {
        Err(err) => err,
        Ok(_) => panic!("undersized buffer must be rejected"),
    };
    assert!(matches!(err, CoprocError::InvalidArgument(_)), "{err}");
    assert!(err.to_string().contains("too small"), "{err}");
}

#[test]
fn spec_contract_applies_to_the_pty_variant_too() {
    let mut name = name_buf();
    let err = match PtyCoprocess::open(
        &CommandSpec::new("cat | sort").argv(["cat"]),
        &PtySettings::default(),
        &mut name,
    ) {
        Err(err) => err,
        Ok(_) => panic!("metacharacters with argv must be rejected"),
    };
    assert!(matches!(err, CoprocError::InvalidArgument(_)), "{err}");
}
