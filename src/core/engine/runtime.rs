//! Runtime provisioning.
//!
//! A runtime listed by the pipeline is ready when its configured setup command
//! succeeds, or, without one, when an executable of that name is on `PATH`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::utils::command;

pub trait RuntimeProvisioner: Send + Sync {
    fn provision(&self, runtimes: &[String], workspace: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ShellRuntimeProvisioner {
    setup_commands: HashMap<String, String>,
}

impl ShellRuntimeProvisioner {
    pub fn new(setup_commands: HashMap<String, String>) -> Self {
        Self { setup_commands }
    }

    fn probe(&self, runtime: &str) -> String {
        match self.setup_commands.get(runtime) {
            Some(cmd) => cmd.clone(),
            None => format!("command -v '{}'", runtime.replace('\'', "")),
        }
    }
}

impl RuntimeProvisioner for ShellRuntimeProvisioner {
    fn provision(&self, runtimes: &[String], workspace: &Path) -> Result<()> {
        let dir = workspace.to_string_lossy();
        for runtime in runtimes {
            let output = command::run_shell(&self.probe(runtime), Some(&dir), &[], &[]);
            if !output.success {
                let detail = if output.stderr.trim().is_empty() {
                    format!("exit code {}", output.exit_code)
                } else {
                    output.stderr.trim().to_string()
                };
                return Err(Error::runtime_setup_failed(runtime, detail));
            }
            log_status!("runtime", "Runtime {} ready", runtime);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn shell_on_path_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        ShellRuntimeProvisioner::default()
            .provision(&["sh".to_string()], dir.path())
            .unwrap();
    }

    #[test]
    fn unknown_runtime_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShellRuntimeProvisioner::default()
            .provision(&["cdrun-no-such-runtime".to_string()], dir.path())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RunRuntimeSetupFailed);
    }

    #[test]
    fn configured_setup_command_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut setup = HashMap::new();
        setup.insert("nodejs18".to_string(), "touch node-ready".to_string());
        ShellRuntimeProvisioner::new(setup)
            .provision(&["nodejs18".to_string()], dir.path())
            .unwrap();
        assert!(dir.path().join("node-ready").exists());
    }
}
