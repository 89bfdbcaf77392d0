//! `LifecycleManager` (§2): the caller-facing orchestration layer. Holds a
//! sorted part list and the two hard-core subsystems (Sequencer, Part
//! Handler) plus the external collaborators (package/snap repositories,
//! mount backend, callbacks) and turns `plan()` + `execute()` into a
//! complete build.

use tracing::{info, warn};

use crate::actions::{Action, ActionType};
use crate::callbacks::CallbackRegistry;
use crate::config::{EngineConfig, ProjectOptions};
use crate::errors::PartsError;
use crate::executor::PartHandler;
use crate::overlay::{LayerMounter, MountBackend, MountGuardState, NoopMountBackend};
use crate::packages::snaps::{NullSnapRepository, SnapRepository};
use crate::packages::{NullPackageRepository, PackageRepository};
use crate::parts::{Part, PartSpec, PartsDocument};
use crate::sequencer::Sequencer;
use crate::state::manager::StateManager;
use crate::steps::Step;

/// The externally-supplied collaborators a `LifecycleManager` needs beyond
/// the project's own part definitions (§6): package/snap repositories, the
/// overlay mount backend, and the pre/post-step callback registry. All
/// default to inert implementations so the engine runs (and its own test
/// suite runs) without any of these being wired up.
pub struct Collaborators {
    pub package_repo: Box<dyn PackageRepository>,
    pub snap_repo: Box<dyn SnapRepository>,
    pub mount_backend: Box<dyn MountBackend>,
    pub callbacks: CallbackRegistry,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            package_repo: Box::new(NullPackageRepository),
            snap_repo: Box::new(NullSnapRepository),
            mount_backend: Box::new(NoopMountBackend),
            callbacks: CallbackRegistry::new(),
        }
    }
}

/// Owns the sorted part list, persisted state, and the collaborators
/// needed to plan and execute a project's lifecycle (§2).
pub struct LifecycleManager {
    sorted_parts: Vec<Part>,
    state_manager: StateManager,
    project_options: ProjectOptions,
    config: EngineConfig,
    collaborators: Collaborators,
    mount_guard: MountGuardState,
}

impl LifecycleManager {
    /// Load a `parts:` YAML document, derive each part's directories under
    /// `config.work_dir`, and topologically sort by `after`.
    pub fn load(yaml: &str, project_options: ProjectOptions, config: EngineConfig, collaborators: Collaborators) -> Result<Self, PartsError> {
        let document = PartsDocument::from_yaml(yaml)?;
        Self::from_specs(document.parts.into_iter().collect(), project_options, config, collaborators)
    }

    /// Build directly from already-parsed `(name, spec)` pairs, for callers
    /// that assemble parts programmatically rather than from YAML.
    pub fn from_specs(
        specs: Vec<(String, PartSpec)>,
        project_options: ProjectOptions,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, PartsError> {
        let parts: Vec<Part> = specs
            .into_iter()
            .map(|(name, spec)| Part::new(name, spec, &config.work_dir))
            .collect();
        let sorted_parts = crate::parts::sort_parts(parts)?;
        let state_manager = StateManager::new(&config.work_dir);

        Ok(LifecycleManager {
            sorted_parts,
            state_manager,
            project_options,
            config,
            collaborators,
            mount_guard: MountGuardState::new(),
        })
    }

    pub fn parts(&self) -> &[Part] {
        &self.sorted_parts
    }

    fn sequencer(&self) -> Sequencer<'_> {
        Sequencer::new(
            &self.sorted_parts,
            &self.state_manager,
            &self.project_options,
            &self.config.base_layer_hash,
            &self.config,
        )
    }

    fn handler(&self) -> PartHandler<'_> {
        PartHandler {
            state_manager: &self.state_manager,
            package_repo: self.collaborators.package_repo.as_ref(),
            snap_repo: self.collaborators.snap_repo.as_ref(),
            mount_backend: self.collaborators.mount_backend.as_ref(),
            mount_guard: &self.mount_guard,
            callbacks: &self.collaborators.callbacks,
            work_root: self.config.work_dir.clone(),
        }
    }

    /// Produce the ordered action list for `target_step` over `part_names`
    /// (empty/`None` selects every part). Delegates to the Sequencer (§4.3).
    pub fn plan(&self, target_step: Step, part_names: Option<&[String]>) -> Result<Vec<Action>, PartsError> {
        self.sequencer().plan(target_step, part_names)
    }

    /// Execute a previously-planned action list in order. Stops at the
    /// first failing action without touching the remainder (§7
    /// propagation); earlier actions' side effects, including state
    /// writes, remain in place.
    pub fn execute(&self, target_step: Step, part_names: Option<&[String]>) -> Result<(), PartsError> {
        let plan_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("plan", plan_id = %plan_id, target_step = %target_step);
        let _enter = span.enter();

        let plan = self.sequencer().plan_full(target_step, part_names)?;
        info!("planned {} action(s)", plan.actions.len());
        for action in &plan.actions {
            self.execute_action(action, plan.overlay_hash.as_deref())?;
        }
        Ok(())
    }

    fn find_part(&self, name: &str) -> Result<&Part, PartsError> {
        self.sorted_parts
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PartsError::InvalidPartName(name.to_string()))
    }

    fn previous_layer_hash(&self, part: &Part) -> Vec<u8> {
        let mut previous = self.config.base_layer_hash.clone();
        for p in &self.sorted_parts {
            if p.name == part.name {
                break;
            }
            previous = p.layer_hash();
        }
        previous
    }

    /// Dispatch a single action (§4.4). `plan_overlay_hash` is the
    /// plan-wide overlay hash the Sequencer fixed, if this plan needed one.
    fn execute_action(&self, action: &Action, plan_overlay_hash: Option<&str>) -> Result<(), PartsError> {
        let part = self.find_part(&action.part_name)?;
        let handler = self.handler();
        self.dispatch_action(&handler, part, action, plan_overlay_hash)
    }

    fn dispatch_action(&self, handler: &PartHandler<'_>, part: &Part, action: &Action, plan_overlay_hash: Option<&str>) -> Result<(), PartsError> {
        match action.action_type {
            ActionType::Skip => {
                info!("{}:{} skip ({})", part.name, action.step, action.reason.as_deref().unwrap_or("already ran"));
                Ok(())
            }

            ActionType::Reapply => {
                info!("{}:{} reapply ({})", part.name, action.step, action.reason.as_deref().unwrap_or(""));
                if action.step != Step::Overlay {
                    return Err(PartsError::InvalidAction(format!(
                        "REAPPLY is only valid for the overlay step, got {}",
                        action.step
                    )));
                }
                let mounter = LayerMounter::new(handler.mount_backend, handler.mount_guard, &self.sorted_parts, part, part.overlay_dir())?;
                drop(mounter);
                Ok(())
            }

            ActionType::Run | ActionType::Rerun => {
                if action.action_type == ActionType::Rerun {
                    for step in std::iter::once(action.step).chain(action.step.next_steps()) {
                        handler.clean_step(part, step, &self.sorted_parts)?;
                    }
                    self.state_manager.clean_part(part, action.step)?;
                }
                handler.callbacks.run_pre_step(part, action);
                let result = self
                    .run_step(handler, part, action.step, plan_overlay_hash, false)
                    .and_then(|state| handler.run_and_commit_step(part, action.step, state));
                handler.callbacks.run_post_step(part, action);
                result
            }

            ActionType::Update => match action.step {
                Step::Pull => handler.update_pull(part),
                Step::Overlay => handler.update_overlay(part),
                Step::Build => {
                    let state = handler.update_build(part, &self.sorted_parts, &self.project_options, plan_overlay_hash)?;
                    handler.run_and_commit_step(part, Step::Build, state)
                }
                Step::Stage | Step::Prime => {
                    warn!("UPDATE is not a valid action for {}; treating as no-op", action.step);
                    Ok(())
                }
            },
        }
    }

    fn run_step(
        &self,
        handler: &PartHandler<'_>,
        part: &Part,
        step: Step,
        plan_overlay_hash: Option<&str>,
        update: bool,
    ) -> Result<crate::state::states::StepState, PartsError> {
        match step {
            Step::Pull => handler.run_pull(part, &self.project_options),
            Step::Overlay => {
                let previous_hash = self.previous_layer_hash(part);
                handler.run_overlay(part, &self.sorted_parts, &self.project_options, &previous_hash)
            }
            Step::Build => handler.run_build(part, &self.sorted_parts, &self.project_options, plan_overlay_hash, update),
            Step::Stage => handler.run_stage(part, &self.sorted_parts, &self.project_options, plan_overlay_hash),
            Step::Prime => handler.run_prime(part, &self.sorted_parts, &self.project_options, plan_overlay_hash),
        }
    }

    /// Remove every trace of `part_name` from `step` upward: state records
    /// and the filesystem artifacts they describe. Used by a `clean`
    /// surface the CLI exposes; the core itself never calls this during
    /// planning or execution.
    pub fn clean(&self, part_name: &str, step: Step) -> Result<(), PartsError> {
        let part = self.find_part(part_name)?;
        let handler = self.handler();
        for s in std::iter::once(step).chain(step.next_steps()) {
            handler.clean_step(part, s, &self.sorted_parts)?;
        }
        self.state_manager.clean_part(part, step)
    }
}
