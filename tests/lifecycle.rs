//! Integration tests for the server lifecycle manager
//!
//! These drive real child processes: shell-script stubs stand in for the
//! core server binaries.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tunnelgate::core::{Core, ServerParams};
use tunnelgate::lifecycle::{CoreBinary, LifecycleSettings, ServerLifecycleManager};

fn fast_settings() -> LifecycleSettings {
    LifecycleSettings {
        startup_settle: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(300),
    }
}

/// Write an executable shell script standing in for a core's server binary.
fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn rathole_params(control_port: u16, proxy_port: u16) -> ServerParams {
    ServerParams::Rathole {
        remote_addr: format!("0.0.0.0:{control_port}"),
        token: "abc".to_string(),
        proxy_port,
    }
}

/// Manager whose rathole binary is a stub with the given script body.
fn manager_with_stub(tmp: &TempDir, body: &str) -> ServerLifecycleManager {
    let bin_dir = tmp.path().join("bin");
    fs::create_dir_all(&bin_dir).unwrap();
    write_stub(&bin_dir, "rathole", body);
    let binary = CoreBinary::for_core(Core::Rathole, &bin_dir);
    ServerLifecycleManager::new(Core::Rathole, tmp.path(), binary, fast_settings()).unwrap()
}

fn pid_is_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn start_then_stop_leaves_no_state() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_with_stub(&tmp, "exec sleep 60");

    manager
        .start("t1", &rathole_params(23333, 8989))
        .await
        .unwrap();
    assert!(manager.is_running("t1"));
    assert_eq!(manager.list_active(), vec!["t1".to_string()]);
    assert_eq!(manager.bind_addr("t1").as_deref(), Some("0.0.0.0:23333"));

    let config_path = manager.config_dir().join("t1.toml");
    assert!(config_path.exists());
    let config = fs::read_to_string(&config_path).unwrap();
    assert!(config.contains("bind_addr = \"0.0.0.0:23333\""));
    assert!(config.contains("default_token = \"abc\""));
    assert!(config.contains("[server.services.t1]"));
    assert!(config.contains("bind_addr = \"0.0.0.0:8989\""));

    manager.stop("t1").await;
    assert!(!manager.is_running("t1"));
    assert!(manager.list_active().is_empty());
    assert!(!config_path.exists());
}

#[tokio::test]
async fn double_start_replaces_the_server_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("pids");
    let manager = manager_with_stub(
        &tmp,
        &format!("echo $$ >> \"{}\"\nexec sleep 60", marker.display()),
    );

    manager
        .start("t1", &rathole_params(23334, 8989))
        .await
        .unwrap();
    manager
        .start("t1", &rathole_params(23334, 8989))
        .await
        .unwrap();

    // Two launches, one live process: the second start stopped the first
    let pids: Vec<String> = fs::read_to_string(&marker)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(pids.len(), 2);
    assert!(!pid_is_alive(&pids[0]));
    assert!(pid_is_alive(&pids[1]));
    assert_eq!(manager.list_active(), vec!["t1".to_string()]);

    manager.stop("t1").await;
}

#[tokio::test]
async fn immediate_exit_surfaces_exit_code_and_log_tail() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_with_stub(&tmp, "echo boom-diagnostic\nexit 1");

    let err = manager
        .start("t1", &rathole_params(23335, 8989))
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("exit code: 1"), "unexpected message: {msg}");
    assert!(msg.contains("boom-diagnostic"), "unexpected message: {msg}");

    // All partial state rolled back
    assert!(!manager.is_running("t1"));
    assert!(manager.list_active().is_empty());
    assert!(!manager.config_dir().join("t1.toml").exists());
}

#[tokio::test]
async fn list_active_prunes_externally_killed_servers() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("pids");
    let manager = manager_with_stub(
        &tmp,
        &format!("echo $$ >> \"{}\"\nexec sleep 60", marker.display()),
    );

    manager
        .start("t1", &rathole_params(23336, 8989))
        .await
        .unwrap();
    assert_eq!(manager.list_active(), vec!["t1".to_string()]);

    let pid = fs::read_to_string(&marker).unwrap().trim().to_string();
    std::process::Command::new("kill")
        .args(["-9", &pid])
        .status()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!manager.is_running("t1"));
    assert!(manager.list_active().is_empty());
}

#[tokio::test]
async fn is_running_is_false_for_unknown_tunnels() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_with_stub(&tmp, "exec sleep 60");

    assert!(!manager.is_running("never-started"));
}

#[tokio::test]
async fn stop_is_a_noop_for_unknown_tunnels() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_with_stub(&tmp, "exec sleep 60");

    manager.stop("ghost").await;
    assert!(manager.list_active().is_empty());
}

#[tokio::test]
async fn fallback_binary_is_used_when_primary_is_missing() {
    let tmp = TempDir::new().unwrap();
    let stub = write_stub(tmp.path(), "rathole-stub", "exec sleep 60");
    let binary = CoreBinary {
        primary: tmp.path().join("bin/definitely-missing"),
        fallback: stub.display().to_string(),
    };
    let manager =
        ServerLifecycleManager::new(Core::Rathole, tmp.path(), binary, fast_settings()).unwrap();

    manager
        .start("t1", &rathole_params(23337, 8989))
        .await
        .unwrap();
    assert!(manager.is_running("t1"));

    // Fallback launches get the abbreviated log preamble
    let log = fs::read_to_string(manager.config_dir().join("rathole_t1.log")).unwrap();
    assert!(log.contains("PATH binary"));

    manager.stop("t1").await;
}

#[tokio::test]
async fn missing_binaries_fail_start_and_roll_back() {
    let tmp = TempDir::new().unwrap();
    let binary = CoreBinary {
        primary: tmp.path().join("bin/definitely-missing"),
        fallback: tmp.path().join("also-missing").display().to_string(),
    };
    let manager =
        ServerLifecycleManager::new(Core::Rathole, tmp.path(), binary, fast_settings()).unwrap();

    let err = manager
        .start("t1", &rathole_params(23338, 8989))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to launch"));
    assert!(!manager.config_dir().join("t1.toml").exists());
    assert!(manager.list_active().is_empty());
}

#[tokio::test]
async fn mismatched_params_are_rejected_before_spawning() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_with_stub(&tmp, "exec sleep 60");

    let err = manager
        .start(
            "t1",
            &ServerParams::Frp {
                bind_port: 7000,
                token: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("frp params"));
    assert!(manager.list_active().is_empty());
}

#[tokio::test]
async fn cleanup_all_stops_every_tunnel() {
    let tmp = TempDir::new().unwrap();
    let manager = manager_with_stub(&tmp, "exec sleep 60");

    manager
        .start("t1", &rathole_params(23339, 8989))
        .await
        .unwrap();
    manager
        .start("t2", &rathole_params(23340, 8990))
        .await
        .unwrap();
    assert_eq!(manager.list_active().len(), 2);

    manager.cleanup_all().await;
    assert!(manager.list_active().is_empty());
    assert!(!manager.config_dir().join("t1.toml").exists());
    assert!(!manager.config_dir().join("t2.toml").exists());
}
