//! Singleton claim (property 7) and the registry-cleanup half of scenario
//! S6: a second daemon start while one is already running is rejected
//! naming the winner's pid, and releasing the guard removes the registry
//! file so a later restart finds no stale conflict.

use folderd::singleton::SingletonGuard;
use folderd_core::types::{now_unix_ms, DaemonRegistryRecord};

fn record() -> DaemonRegistryRecord {
    DaemonRegistryRecord {
        pid: std::process::id(),
        control_ports: vec![],
        start_time_unix_ms: now_unix_ms(),
        version: "0.1.0".to_string(),
    }
}

// `SingletonGuard::acquire` resolves its directory from `XDG_STATE_HOME`,
// a process-wide env var, so this is the only test in the crate allowed to
// touch it; a mutex keeps it from racing a concurrent run of this same
// test binary.
static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[test]
fn second_acquire_fails_naming_the_first_holders_pid_then_release_clears_it() {
    let _lock = ENV_GUARD.lock().unwrap();
    let state_home = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_STATE_HOME", state_home.path());

    let first = SingletonGuard::acquire(record()).expect("first daemon should win the singleton");
    let registry_path = first.registry_path().to_path_buf();
    assert!(registry_path.exists());

    // A second daemon start with the singleton already held by this same
    // process must fail rather than silently double-run.
    let second = SingletonGuard::acquire(record());
    assert!(second.is_err());

    first.release();
    assert!(!registry_path.exists(), "releasing the guard must remove the registry file (S6)");

    // With the registry cleared, a later restart finds no stale conflict.
    let restarted = SingletonGuard::acquire(record());
    assert!(restarted.is_ok());
    restarted.unwrap().release();

    std::env::remove_var("XDG_STATE_HOME");
}
