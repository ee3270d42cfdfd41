//! Integration tests for the `polykey-tonic-server` binary entry point.
//!
//! Covers the exit status on startup failures and on a signal-driven
//! shutdown.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use predicates::str::contains;
use std::net::TcpListener;

#[test]
fn occupied_listen_addr_exits_with_failure() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let mut command = cargo_bin_cmd!("polykey-tonic-server");
    command
        .env("LISTEN_ADDR", &addr)
        .env("LOG_FORMAT", "json")
        .env("RUST_LOG", "info");
    let output = command
        .assert()
        .failure()
        .stdout(contains("failed to start server"))
        .stdout(contains(addr.as_str()))
        .stdout(contains("server starting").not())
        .get_output()
        .clone();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let errors = stdout
        .lines()
        .filter(|line| line.contains(r#""level":"ERROR""#))
        .count();
    assert_eq!(errors, 1, "{stdout}");
}

#[test]
fn invalid_config_exits_with_failure() {
    let mut command = cargo_bin_cmd!("polykey-tonic-server");
    command.env("KEEPALIVE_INTERVAL", "0");
    command
        .assert()
        .failure()
        .stderr(contains("KEEPALIVE_INTERVAL"));
}

#[test]
fn help_lists_environment_variables() {
    let mut command = cargo_bin_cmd!("polykey-tonic-server");
    command.arg("--help");
    command
        .assert()
        .success()
        .stdout(contains("LISTEN_ADDR"))
        .stdout(contains("SHUTDOWN_GRACE"));
}

#[cfg(unix)]
#[test]
fn sigterm_drains_and_exits_zero() {
    use std::net::TcpStream;
    use std::process::{Command, Stdio};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    let addr = {
        let free = TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap()
    };

    let mut child = Command::new(assert_cmd::cargo::cargo_bin!("polykey-tonic-server"))
        .env("LISTEN_ADDR", addr.to_string())
        .env("LOG_FORMAT", "json")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(addr).is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        sleep(Duration::from_millis(20));
    }

    let killed = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if child.try_wait().unwrap().is_some() {
            break;
        }
        if Instant::now() >= deadline {
            child.kill().unwrap();
            panic!("server did not exit after SIGTERM");
        }
        sleep(Duration::from_millis(20));
    }

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "exit status: {}", output.status);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("SIGTERM"), "{stdout}");
    assert!(stdout.contains("server stopped"), "{stdout}");
}
