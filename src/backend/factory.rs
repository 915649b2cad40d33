//! Backend selection from configuration

use crate::backend::native::NativeBackend;
use crate::backend::Backend;
use crate::config::loader::{BackendKind, ControlConfig};
use crate::testing::scripted::{ScriptedBackend, ScriptedProgram};
use std::sync::Arc;

pub fn create_backend(config: &ControlConfig) -> Arc<dyn Backend> {
    match config.backend {
        BackendKind::Native => Arc::new(NativeBackend::new(config)),
        BackendKind::ScriptedEcho => Arc::new(ScriptedBackend::new(ScriptedProgram::Echo)),
    }
}
