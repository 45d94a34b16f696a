//! CLI Integration Tests
//!
//! Runs the `hmux` binary: argument validation failures, and a full
//! `serve` + `call` round trip over loopback.
//!
//! All addresses use `127.0.0.1` with explicit ports.

use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Output};
use std::thread::sleep;
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

fn hmux() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hmux"))
}

fn free_port_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Kills the backend process when the test ends, pass or fail.
struct ServeGuard(Child);

impl Drop for ServeGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_backend(addr: &str) -> ServeGuard {
    let child = hmux().args(["serve", "-b", addr]).spawn().unwrap();
    let guard = ServeGuard(child);

    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(addr).is_err() {
        assert!(Instant::now() < deadline, "backend on {} did not start", addr);
        sleep(Duration::from_millis(50));
    }
    guard
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ============================================================================
// Argument validation
// ============================================================================

#[test]
fn test_call_without_backend_fails() {
    let output = hmux().args(["call", "/"]).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_call_with_invalid_backend_address_fails() {
    let output = hmux().args(["call", "-b", "no-port", "/"]).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no-port"));
}

#[test]
fn test_call_with_unknown_policy_fails() {
    let output = hmux()
        .args(["call", "-b", "127.0.0.1:6802", "--policy", "random", "/"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_call_to_dead_backend_fails() {
    let addr = free_port_addr();
    let output = hmux()
        .args(["call", "-b", &addr, "--connect-timeout", "1000", "/"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_serve_and_call_round_trip() {
    let addr = free_port_addr();
    let _backend = start_backend(&addr);

    let output = hmux()
        .args([
            "call",
            "-b", &addr,
            "-X", "POST",
            "-H", "X-Test: yes",
            "-d", "ping",
            "/echo?x=1",
        ])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let out = stdout(&output);
    assert!(out.starts_with("200 OK\n"), "stdout: {}", out);
    assert!(out.contains("X-Echo-Length: 4\n"));
    assert!(out.contains("POST /echo?x=1\n"));
    assert!(out.contains("X-Test: yes\n"));
    assert!(out.ends_with("ping"));
}

#[test]
fn test_call_falls_back_to_backup() {
    let dead = free_port_addr();
    let backup = free_port_addr();
    let _backend = start_backend(&backup);

    let output = hmux()
        .args(["call", "-b", &dead, "--backup", &backup, "--connect-timeout", "1000", "/"])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).starts_with("200 OK\n"));
}

#[test]
fn test_call_prints_stats() {
    let addr = free_port_addr();
    let _backend = start_backend(&addr);

    let output = hmux().args(["call", "-b", &addr, "--stats", "/"]).output().unwrap();

    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(stats[0]["address"], addr.as_str());
    assert_eq!(stats[0]["connect_total"], 1);
}
