//! Hook-script execution. Named executable files under `--hooks-path`,
//! invoked at phase boundaries with migration context exported as
//! environment variables, mirroring gh-ost's own `GH_OST_*` convention
//! (`examples/original_source/go/cmd/gh-ost/main.go`). A non-zero exit is
//! fatal only for `onBeforeCutOver`.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::{instrument, warn};

use crate::error::GhostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    OnStartup,
    OnValidated,
    OnRowCopyComplete,
    OnBeforeCutOver,
    OnSuccess,
    OnFailure,
    OnStatus,
    OnInteractiveCommand,
}

impl HookPoint {
    fn file_name(self) -> &'static str {
        match self {
            HookPoint::OnStartup => "onStartup",
            HookPoint::OnValidated => "onValidated",
            HookPoint::OnRowCopyComplete => "onRowCopyComplete",
            HookPoint::OnBeforeCutOver => "onBeforeCutOver",
            HookPoint::OnSuccess => "onSuccess",
            HookPoint::OnFailure => "onFailure",
            HookPoint::OnStatus => "onStatus",
            HookPoint::OnInteractiveCommand => "onInteractiveCommand",
        }
    }

    /// Only the pre-cut-over hook's failure is fatal; every other hook is
    /// observational.
    fn failure_is_fatal(self) -> bool {
        matches!(self, HookPoint::OnBeforeCutOver)
    }
}

pub struct Hooks {
    hooks_path: Option<PathBuf>,
    hint: Option<String>,
}

impl Hooks {
    pub fn new(hooks_path: Option<PathBuf>, hint: Option<String>) -> Self {
        Hooks { hooks_path, hint }
    }

    #[instrument(skip(self, env))]
    pub async fn invoke(&self, point: HookPoint, env: &HashMap<String, String>) -> Result<(), GhostError> {
        let Some(dir) = &self.hooks_path else {
            return Ok(());
        };
        let path = dir.join(point.file_name());
        if !path.exists() {
            return Ok(());
        }

        let mut cmd = Command::new(&path);
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(hint) = &self.hint {
            cmd.env("GHOST_HOOKS_HINT", hint);
        }

        let status = cmd.status().await?;
        if !status.success() {
            if point.failure_is_fatal() {
                return Err(GhostError::FatalTopology(format!(
                    "hook {} exited with {status}",
                    point.file_name()
                )));
            }
            warn!(hook = point.file_name(), %status, "hook exited non-zero, continuing");
        }
        Ok(())
    }
}

/// Builds the `GHOST_*` environment passed to every hook invocation.
pub fn base_env(database: &str, table: &str, alter: &str, rows_copied: u64) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("GHOST_DATABASE_NAME".to_string(), database.to_string());
    env.insert("GHOST_TABLE_NAME".to_string(), table.to_string());
    env.insert("GHOST_ALTER_STATEMENT".to_string(), alter.to_string());
    env.insert("GHOST_ROWS_COPIED".to_string(), rows_copied.to_string());
    env
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_before_cut_over_is_fatal() {
        assert!(HookPoint::OnBeforeCutOver.failure_is_fatal());
        assert!(!HookPoint::OnStartup.failure_is_fatal());
        assert!(!HookPoint::OnSuccess.failure_is_fatal());
    }
}
