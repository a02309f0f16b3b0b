//! CLI smoke tests for the modwire-server binary.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn run_modwire_server(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_modwire-server"))
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute modwire-server")
}

/// A config file whose log file lands inside the temp dir.
fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, body).expect("Failed to write config file");
    path
}

const VALID_CONFIG: &str = r#"
server:
  host: "127.0.0.1"
  port: 18080
  shutdown_timeout: 2s

logging:
  default:
    console_level: info
    file: "logs/modwire.log"
    file_level: debug
    max_backups: 1
    max_size_mb: 1
"#;

#[test]
fn test_cli_help_command() {
    let output = run_modwire_server(&["--help"]);
    assert!(output.status.success(), "Help command should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("modwire-server"), "{stdout}");
    assert!(stdout.contains("Usage:"), "{stdout}");
    assert!(stdout.contains("run"), "Should contain 'run' subcommand");
    assert!(stdout.contains("check"), "Should contain 'check' subcommand");
    assert!(stdout.contains("--config"), "Should mention config option");
    assert!(stdout.contains("--print-config"));
}

#[test]
fn test_cli_version_command() {
    let output = run_modwire_server(&["--version"]);
    assert!(output.status.success(), "Version command should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("modwire-server 0.1.0"), "{stdout}");
}

#[test]
fn test_cli_invalid_command() {
    let output = run_modwire_server(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "{stderr}");
}

#[test]
fn test_cli_config_validation_missing_file() {
    let output = run_modwire_server(&["--config", "/nonexistent/config.yaml", "check"]);
    assert!(!output.status.success(), "Should fail with missing config");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "{stderr}");
}

#[test]
fn test_cli_config_validation_invalid_yaml() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = write_config(&temp_dir, "invalid: yaml: content: [unclosed");

    let output = run_modwire_server(&["-c", config_path.to_str().unwrap(), "check"]);
    assert!(!output.status.success(), "Should fail with invalid YAML");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load config"), "{stderr}");
}

#[test]
fn test_cli_config_rejects_unknown_sections() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = write_config(&temp_dir, "database:\n  url: \"sqlite:///tmp/test.db\"\n");

    let output = run_modwire_server(&["--config", config_path.to_str().unwrap(), "check"]);
    assert!(!output.status.success(), "Unknown top-level keys should fail");
}

#[test]
fn test_cli_check_prints_route_table() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = write_config(&temp_dir, VALID_CONFIG);

    let output = run_modwire_server(&["--config", config_path.to_str().unwrap(), "check"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "STDOUT: {stdout}\nSTDERR: {stderr}");

    assert!(stdout.contains("Configuration check passed"), "{stdout}");
    assert!(stdout.contains("POST /auth/signin"), "{stdout}");
    assert!(stdout.contains("GET /users/{name}  [bearer]"), "{stdout}");
    assert!(stdout.contains("/health"), "{stdout}");

    // the relative log file resolves next to the config
    assert!(temp_dir.path().join("logs").is_dir());
}

#[test]
fn test_cli_print_config_applies_overrides() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = write_config(&temp_dir, VALID_CONFIG);

    let output = run_modwire_server(&[
        "--config",
        config_path.to_str().unwrap(),
        "--port",
        "9191",
        "-vv",
        "--print-config",
    ]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("port: 9191"), "{stdout}");
    assert!(stdout.contains("shutdown_timeout: 2s"), "{stdout}");
    assert!(stdout.contains("console_level: trace"), "{stdout}");
}

#[test]
fn test_cli_env_overrides_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = write_config(&temp_dir, VALID_CONFIG);

    let output = Command::new(env!("CARGO_BIN_EXE_modwire-server"))
        .args(["--config", config_path.to_str().unwrap(), "--print-config"])
        .env("APP__SERVER__PORT", "7070")
        .output()
        .expect("Failed to execute modwire-server");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("port: 7070"), "{stdout}");
}

#[test]
fn test_cli_subcommand_help() {
    let output = run_modwire_server(&["run", "--help"]);
    assert!(output.status.success(), "Run subcommand help should succeed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("Start the server"));

    let output = run_modwire_server(&["check", "--help"]);
    assert!(output.status.success(), "Check subcommand help should succeed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("route table"));
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free port")
}

fn http_get(port: u16, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )?;
    let mut out = String::new();
    stream.read_to_string(&mut out)?;
    Ok(out)
}

#[test]
fn test_cli_run_serves_health() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = write_config(&temp_dir, VALID_CONFIG);
    let port = free_port();

    let mut child = Command::new(env!("CARGO_BIN_EXE_modwire-server"))
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "--port",
            &port.to_string(),
            "run",
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start modwire-server");

    let deadline = Instant::now() + Duration::from_secs(10);
    let response = loop {
        match http_get(port, "/health") {
            Ok(resp) => break Some(resp),
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(100)),
            Err(_) => break None,
        }
    };
    let _ = child.kill();
    let _ = child.wait();

    let response = response.expect("server never answered /health");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"status\":\"ok\""), "{response}");
}
