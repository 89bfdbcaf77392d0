//! Scriptlet-vs-builtin dispatch (§4.4): every step either runs the part's
//! `override-<step>`/`overlay-script` scriptlet, or falls back to the
//! step's builtin behavior when no scriptlet is declared.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::errors::PartsError;

/// Run `scriptlet` as a shell command with working directory `work_dir`.
/// Failure (non-zero exit, or the shell itself could not be spawned) is
/// reported as a `PartsError::Custom` naming the part and step.
pub fn run_scriptlet(
    scriptlet: &str,
    work_dir: &Path,
    part_name: &str,
    step_name: &str,
) -> Result<(), PartsError> {
    debug!("running {step_name} scriptlet for part {part_name:?} in {}", work_dir.display());
    std::fs::create_dir_all(work_dir)?;

    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(scriptlet)
        .current_dir(work_dir)
        .status()
        .map_err(|e| {
            PartsError::custom(format!(
                "failed to spawn {step_name} scriptlet for part {part_name:?}: {e}"
            ))
        })?;

    if !status.success() {
        return Err(PartsError::custom(format!(
            "{step_name} scriptlet for part {part_name:?} exited with {status}"
        )));
    }
    Ok(())
}

/// Dispatch either the scriptlet (if declared) or the builtin closure.
/// Centralizes the "scriptlet wins" rule so every step handler applies it
/// identically.
pub fn run_step<F>(
    scriptlet: Option<&str>,
    work_dir: &Path,
    part_name: &str,
    step_name: &str,
    builtin: F,
) -> Result<(), PartsError>
where
    F: FnOnce() -> Result<(), PartsError>,
{
    match scriptlet {
        Some(script) => run_scriptlet(script, work_dir, part_name, step_name),
        None => builtin(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn run_scriptlet_executes_in_work_dir() {
        let dir = tempdir().unwrap();
        run_scriptlet("touch marker", dir.path(), "p1", "pull").unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[test]
    fn run_scriptlet_reports_failure_exit_status() {
        let dir = tempdir().unwrap();
        let err = run_scriptlet("exit 7", dir.path(), "p1", "build").unwrap_err();
        assert!(matches!(err, PartsError::Custom { .. }));
    }

    #[test]
    fn run_step_prefers_scriptlet_over_builtin() {
        let dir = tempdir().unwrap();
        let mut builtin_ran = false;
        run_step(Some("touch scriptlet-ran"), dir.path(), "p1", "pull", || {
            builtin_ran = true;
            Ok(())
        })
        .unwrap();
        assert!(dir.path().join("scriptlet-ran").exists());
        assert!(!builtin_ran);
    }

    #[test]
    fn run_step_falls_back_to_builtin_without_scriptlet() {
        let dir = tempdir().unwrap();
        let mut builtin_ran = false;
        run_step(None, dir.path(), "p1", "pull", || {
            builtin_ran = true;
            Ok(())
        })
        .unwrap();
        assert!(builtin_ran);
    }
}
