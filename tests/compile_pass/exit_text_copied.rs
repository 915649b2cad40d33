//! The exit text is borrowed from the handle; an owned copy survives close.

use procbox::config::loader::{BackendKind, ControlConfig};

fn main() {
    let mut config = ControlConfig::default();
    config.backend = BackendKind::ScriptedEcho;
    let handle = procbox::create_process_with_config(&config, "/bin/echo");

    let reason = handle.get_exit_reason().to_string();
    handle.close();

    assert_eq!(reason, "Exited normally (return code 0)");
}
