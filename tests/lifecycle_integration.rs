//! Integration tests for the native backend
//!
//! Scripts are fed to /bin/sh on its input, so nothing has to be written
//! and exec'd from a multi-threaded test process.

use procbox::config::loader::{ControlConfig, LimitDefaults};
use procbox::{create_process_with_config, BoundKind, LifecycleState, ProcessHandle};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ControlConfig {
    ControlConfig {
        limits: LimitDefaults::unlimited(),
        ..ControlConfig::default()
    }
}

fn process(executable: &str) -> ProcessHandle {
    create_process_with_config(&config(), executable)
}

fn shell(script: &str) -> ProcessHandle {
    let handle = process("/bin/sh");
    handle.write_bytes(script.to_string()).unwrap();
    handle
}

fn read_all(handle: &ProcessHandle) -> Vec<u8> {
    let mut out = Vec::new();
    let mut reader = handle;
    reader.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn test_cat_echoes_written_bytes() {
    let handle = process("/bin/cat");
    handle.write_bytes("hello ").unwrap();
    handle.write_bytes("world").unwrap();

    assert_eq!(read_all(&handle), b"hello world");
    assert_eq!(handle.get_exit_reason(), "Exited normally (return code 0)");
    assert!(handle.read_chunk(16).is_none());
}

#[test]
fn test_inputs_arrive_in_write_order() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"0123456789").unwrap();
    file.flush().unwrap();

    let handle = process("/bin/cat");
    handle.write_file_at(file.path()).unwrap();
    handle.write_file_range(file.as_file(), 2, 3).unwrap();
    handle.write_bytes("!").unwrap();

    assert_eq!(read_all(&handle), b"0123456789234!");
}

#[test]
fn test_exit_code_and_signal_are_reported() {
    let handle = shell("exit 7\n");
    assert_eq!(handle.get_exit_reason(), "Exited normally (return code 7)");

    let handle = shell("kill -SEGV $$\n");
    assert_eq!(handle.get_exit_reason(), "Killed by signal 11 (SIGSEGV)");
}

#[test]
fn test_missing_executable_is_launch_failure() {
    let handle = process("/nonexistent/procbox-integration");
    assert!(handle.read_chunk(8).is_none());
    assert!(handle.get_exit_reason().starts_with("Failed to launch"));
    assert!(handle.write_bytes("dropped").is_ok());
}

#[test]
fn test_time_limit_stops_busy_loop() {
    let handle = shell("while :; do :; done\n");
    handle.set_time_limit(Duration::from_millis(100)).unwrap();

    assert!(read_all(&handle).is_empty());
    assert_eq!(handle.get_exit_reason(), "Terminated (time limit exceeded)");
    assert!(handle.get_cumulative_time_usage(BoundKind::Lower) >= 100_000);
    assert_eq!(
        handle.get_cumulative_time_usage(BoundKind::Lower),
        handle.get_cumulative_time_usage(BoundKind::Upper)
    );
}

#[test]
fn test_timeout_kills_whole_group() {
    let handle = shell("sleep 30\n");
    handle.set_timeout(Duration::from_millis(100)).unwrap();

    assert!(read_all(&handle).is_empty());
    assert_eq!(handle.get_exit_reason(), "Terminated (timeout)");
}

#[test]
fn test_output_limit_withholds_excess() {
    let handle = shell("while :; do echo xxxxxxxxxxxxxxx; done\n");
    handle.set_output_limit(1000).unwrap();

    let out = read_all(&handle);
    assert!(out.len() <= 1000);
    assert_eq!(handle.get_exit_reason(), "Terminated (output limit exceeded)");
    assert!(handle.get_output_usage(BoundKind::Lower) >= out.len() as u64);
}

#[test]
fn test_force_exit_unblocks_reader() {
    let handle = Arc::new(shell("sleep 30\n"));
    let reader = Arc::clone(&handle);
    let pending = std::thread::spawn(move || reader.read_chunk(64));

    std::thread::sleep(Duration::from_millis(100));
    handle.force_exit();
    handle.force_exit();

    assert_eq!(pending.join().unwrap(), None);
    assert_eq!(handle.get_exit_reason(), "Terminated (forced exit)");
}

#[test]
fn test_writes_after_termination_are_accepted() {
    let handle = shell("exit 0\n");
    assert!(read_all(&handle).is_empty());
    assert!(handle.state().is_terminated());

    assert!(handle.write_bytes("late").is_ok());
    assert!(handle.read_chunk(8).is_none());
}

/// Input left open, so /bin/cat keeps running after answering.
fn open_cat() -> ProcessHandle {
    let config = ControlConfig {
        seal_input_on_read: false,
        ..config()
    };
    create_process_with_config(&config, "/bin/cat")
}

#[test]
fn test_measurement_bounds_are_ordered() {
    let handle = open_cat();
    assert_eq!(handle.get_peak_memory_usage(BoundKind::Lower), 0);
    assert_eq!(handle.get_peak_memory_usage(BoundKind::Upper), u64::MAX);

    handle.write_bytes("x").unwrap();
    assert_eq!(handle.read_chunk(8), Some(b"x".to_vec()));
    assert_eq!(handle.state(), LifecycleState::Running);

    let lower = handle.get_current_memory_usage(BoundKind::Lower);
    let upper = handle.get_current_memory_usage(BoundKind::Upper);
    assert!(lower > 0);
    assert!(lower <= upper);
    // unknown while running
    assert_eq!(handle.get_cumulative_time_usage(BoundKind::Upper), u64::MAX);

    assert!(handle.reset_peak_memory_usage().is_ok());
    assert!(
        handle.get_peak_memory_usage(BoundKind::Lower)
            <= handle.get_peak_memory_usage(BoundKind::Upper)
    );

    handle.force_exit();
    assert!(read_all(&handle).is_empty());
    assert_eq!(handle.get_exit_reason(), "Terminated (forced exit)");
    assert_eq!(handle.get_current_memory_usage(BoundKind::Upper), 0);
    let peak_lower = handle.get_peak_memory_usage(BoundKind::Lower);
    let peak_upper = handle.get_peak_memory_usage(BoundKind::Upper);
    assert!(peak_lower <= peak_upper);
    assert!(peak_upper > 0);
    assert_eq!(handle.get_output_usage(BoundKind::Lower), 1);
    assert_eq!(handle.get_output_usage(BoundKind::Upper), 1);
}

#[test]
fn test_close_kills_running_process() {
    let handle = open_cat();
    handle.write_bytes("y").unwrap();
    assert_eq!(handle.read_chunk(8), Some(b"y".to_vec()));
    let pid_alive = handle.state() == LifecycleState::Running;
    assert!(pid_alive);

    // returns only once the process is gone
    handle.close();
}

#[test]
fn test_reset_after_exit_keeps_peak_below_current() {
    let handle = shell("exit 0\n");
    assert!(read_all(&handle).is_empty());
    assert_eq!(handle.get_exit_reason(), "Exited normally (return code 0)");

    assert!(handle.reset_peak_memory_usage().is_ok());
    let peak = handle.get_peak_memory_usage(BoundKind::Lower);
    let current = handle.get_current_memory_usage(BoundKind::Lower);
    assert!(peak <= current, "peak {} current {}", peak, current);
}

#[test]
fn test_time_limit_covers_child_processes() {
    let handle = shell("sh -c 'while :; do :; done'\n");
    handle.set_time_limit(Duration::from_millis(100)).unwrap();
    handle.set_timeout(Duration::from_secs(10)).unwrap();

    assert!(read_all(&handle).is_empty());
    assert_eq!(handle.get_exit_reason(), "Terminated (time limit exceeded)");
    assert!(handle.get_cumulative_time_usage(BoundKind::Lower) >= 100_000);
}

fn read_exact_len(handle: &ProcessHandle, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        match handle.read_chunk(len - out.len()) {
            Some(chunk) => out.extend(chunk),
            None => break,
        }
    }
    out
}

#[test]
fn test_output_limit_window_restarts_when_set_again() {
    let handle = open_cat();
    handle.set_output_limit(10).unwrap();

    handle.write_bytes("aaaaaaaa").unwrap();
    assert_eq!(read_exact_len(&handle, 8), b"aaaaaaaa");

    // new window counts only what comes after this call
    handle.set_output_limit(10).unwrap();
    handle.write_bytes("bbbbbbbb").unwrap();
    assert_eq!(read_exact_len(&handle, 8), b"bbbbbbbb");
    assert_eq!(handle.state(), LifecycleState::Running);
    assert_eq!(handle.get_output_usage(BoundKind::Lower), 16);

    handle.write_bytes("ccccccccccc").unwrap();
    let tail = read_all(&handle);
    assert!(tail.len() <= 2, "{} bytes past the window", tail.len());
    assert_eq!(handle.get_exit_reason(), "Terminated (output limit exceeded)");
}
