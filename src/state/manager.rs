//! The State Manager (§4.1): load/save per-(part, step) state, and answer
//! the dirty/outdated/has-run/should-run questions the Sequencer drives its
//! planning from.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::ProjectOptions;
use crate::errors::PartsError;
use crate::overlay::layer_hash;
use crate::parts::Part;
use crate::state::states::{first_differing_property, StepState};
use crate::steps::Step;

/// Why a step must run again even though it already ran: a property of
/// interest changed, project options changed, a dependency re-staged, or
/// the overlay stack moved under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyReport {
    reason: String,
}

impl DirtyReport {
    pub fn property_changed(name: &str) -> Self {
        DirtyReport {
            reason: format!("'{name}' property changed"),
        }
    }

    pub fn custom(reason: impl Into<String>) -> Self {
        DirtyReport { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Why a step's output is stale relative to an input it consumed, without
/// any of its own properties having changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedReport {
    reason: String,
}

impl OutdatedReport {
    pub fn custom(reason: impl Into<String>) -> Self {
        OutdatedReport { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Per-part, per-step state cache backed by `<work>/parts/<part>/state/<step>`
/// JSON files.
pub struct StateManager {
    work_root: PathBuf,
    cache: RefCell<HashMap<(String, Step), Option<StepState>>>,
}

impl StateManager {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        StateManager {
            work_root: work_root.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn state_file_path(&self, part_name: &str, step: Step) -> PathBuf {
        self.work_root
            .join("parts")
            .join(part_name)
            .join("state")
            .join(step.as_str())
    }

    /// Read the state for `(part_name, step)`, consulting the in-memory
    /// cache first so a `set_state` not yet committed to disk is visible.
    pub fn get_state(&self, part_name: &str, step: Step) -> Option<StepState> {
        let key = (part_name.to_string(), step);
        if let Some(cached) = self.cache.borrow().get(&key) {
            return cached.clone();
        }
        let path = self.state_file_path(part_name, step);
        let loaded = if path.is_file() {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<StepState>(&text) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!("failed to parse state file {}: {e}", path.display());
                        None
                    }
                },
                Err(e) => {
                    warn!("failed to read state file {}: {e}", path.display());
                    None
                }
            }
        } else {
            None
        };
        self.cache.borrow_mut().insert(key, loaded.clone());
        loaded
    }

    pub fn has_step_run(&self, part_name: &str, step: Step) -> bool {
        self.get_state(part_name, step).is_some()
    }

    /// Replace the in-memory state for `(part_name, step)`. Disk write
    /// happens only when the executor commits the action (`commit_state`).
    pub fn set_state(&self, part_name: &str, step: Step, state: StepState) {
        self.cache
            .borrow_mut()
            .insert((part_name.to_string(), step), Some(state));
    }

    /// Write the cached state for `(part_name, step)` to disk. No-op if
    /// nothing is cached (should not happen once `set_state` precedes it).
    pub fn commit_state(&self, part_name: &str, step: Step) -> Result<(), PartsError> {
        let key = (part_name.to_string(), step);
        let state = self.cache.borrow().get(&key).cloned().flatten();
        let Some(state) = state else {
            return Ok(());
        };
        let path = self.state_file_path(part_name, step);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| PartsError::SerializationError(e.to_string()))?;
        fs::write(&path, json)?;
        debug!("wrote state {}:{}", part_name, step);
        Ok(())
    }

    /// Remove the on-disk state file and cache entry for `(part_name, step)`.
    pub fn remove_state(&self, part_name: &str, step: Step) -> Result<(), PartsError> {
        let path = self.state_file_path(part_name, step);
        if path.is_file() {
            fs::remove_file(&path)?;
        }
        self.cache
            .borrow_mut()
            .insert((part_name.to_string(), step), None);
        Ok(())
    }

    /// Touch the state's timestamp without rewriting its contents (used by
    /// UPDATE actions, which refresh staleness without a full clean+rerun).
    pub fn update_state_timestamp(&self, part_name: &str, step: Step) {
        if let Some(mut state) = self.get_state(part_name, step) {
            state.common_mut().timestamp = chrono::Utc::now();
            self.set_state(part_name, step, state);
            let _ = self.commit_state(part_name, step);
        }
    }

    /// Synonym used by the sequencer right after emitting an UPDATE action
    /// (§4.3); semantically identical to `update_state_timestamp`.
    pub fn mark_step_updated(&self, part_name: &str, step: Step) {
        self.update_state_timestamp(part_name, step);
    }

    pub fn get_layer_hash(&self, part: &Part) -> Option<Vec<u8>> {
        layer_hash::load_layer_hash(part)
    }

    /// True iff `step` has never run for `part`, or is currently dirty or
    /// outdated.
    #[allow(clippy::too_many_arguments)]
    pub fn should_step_run(
        &self,
        part: &Part,
        step: Step,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        current_overlay_hash: Option<&str>,
    ) -> bool {
        if !self.has_step_run(&part.name, step) {
            return true;
        }
        if self
            .check_if_dirty(part, step, sorted_parts, project_options, current_overlay_hash)
            .is_some()
        {
            return true;
        }
        self.check_if_outdated(part, step, sorted_parts).is_some()
    }

    pub fn check_if_dirty(
        &self,
        part: &Part,
        step: Step,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        current_overlay_hash: Option<&str>,
    ) -> Option<DirtyReport> {
        let state = self.get_state(&part.name, step)?;
        let common = state.common();

        if let Some(name) = first_differing_property(step, &part.spec, &common.part_properties) {
            return Some(DirtyReport::property_changed(name));
        }

        if &common.project_options != project_options {
            return Some(DirtyReport::custom("project options changed"));
        }

        if step == Step::Build {
            if let Some(report) = self.check_dependencies_restaged(part, sorted_parts) {
                return Some(report);
            }
        }

        if matches!(step, Step::Overlay | Step::Build | Step::Stage) {
            if let Some(current_hash) = current_overlay_hash {
                if common.overlay_hash.as_deref() != Some(current_hash) {
                    return Some(DirtyReport::custom("overlay changed"));
                }
            }
        }

        None
    }

    fn check_dependencies_restaged(&self, part: &Part, sorted_parts: &[Part]) -> Option<DirtyReport> {
        let build_state = self.get_state(&part.name, Step::Build)?;
        let build_ts = build_state.common().timestamp;

        for dep in crate::parts::part_dependencies(&part.name, sorted_parts) {
            if let Some(stage_state) = self.get_state(&dep.name, Step::Stage) {
                if stage_state.common().timestamp > build_ts {
                    return Some(DirtyReport::custom(format!(
                        "dependency {:?} was staged after this part was built",
                        dep.name
                    )));
                }
            }
        }
        None
    }

    pub fn check_if_outdated(
        &self,
        part: &Part,
        step: Step,
        _sorted_parts: &[Part],
    ) -> Option<OutdatedReport> {
        match step {
            Step::Pull => {
                let state = self.get_state(&part.name, step)?;
                let src_mtime = fs::metadata(part.src_dir()).ok()?.modified().ok()?;
                let src_mtime: chrono::DateTime<chrono::Utc> = src_mtime.into();
                if src_mtime > state.common().timestamp {
                    Some(OutdatedReport::custom("source definition changed"))
                } else {
                    None
                }
            }
            Step::Build => {
                let build_state = self.get_state(&part.name, step)?;
                let pull_ts = self.get_state(&part.name, Step::Pull)?.common().timestamp;
                if pull_ts > build_state.common().timestamp {
                    Some(OutdatedReport::custom("pull step is newer than build"))
                } else {
                    None
                }
            }
            Step::Overlay | Step::Stage | Step::Prime => None,
        }
    }

    /// Remove the state for `step` and every higher step of `part` (§4.1).
    /// Filesystem artifact cleanup for shared stage/prime directories is the
    /// Part Handler's responsibility (§4.5); this only drops state records.
    pub fn clean_part(&self, part: &Part, step: Step) -> Result<(), PartsError> {
        for s in std::iter::once(step).chain(step.next_steps()) {
            self.remove_state(&part.name, s)?;
        }
        Ok(())
    }

    /// Load the state of `step` for every part in `parts`, keyed by name.
    /// Used by shared-area cleanup (§4.5) to compute the co-ownership
    /// subtraction.
    pub fn load_all_states(&self, step: Step, parts: &[Part]) -> HashMap<String, StepState> {
        parts
            .iter()
            .filter_map(|p| self.get_state(&p.name, step).map(|s| (p.name.clone(), s)))
            .collect()
    }
}
