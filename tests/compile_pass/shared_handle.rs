//! A handle is Send + Sync: one thread reads while another may act on it.

use procbox::config::loader::{BackendKind, ControlConfig};
use std::sync::Arc;

fn assert_send_sync<T: Send + Sync>() {}

fn main() {
    assert_send_sync::<procbox::ProcessHandle>();

    let mut config = ControlConfig::default();
    config.backend = BackendKind::ScriptedEcho;
    let handle = Arc::new(procbox::create_process_with_config(&config, "/bin/echo"));
    handle.write_bytes("ping").unwrap();

    let reader = Arc::clone(&handle);
    let out = std::thread::spawn(move || reader.read_chunk(16))
        .join()
        .unwrap();
    assert_eq!(out, Some(b"ping".to_vec()));

    handle.force_exit();
}
