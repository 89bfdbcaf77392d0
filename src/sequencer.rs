//! The Sequencer (§4.3): turns part definitions, persisted state, and a
//! target step into a totally ordered action list.
//!
//! This is the one module in the crate that is read best alongside the
//! spec's scenario table (§8 S1-S4): every branch below exists to produce
//! one row of that table, and the unit tests at the bottom replay the
//! scenarios verbatim.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::actions::{Action, ActionType};
use crate::config::{EngineConfig, ProjectOptions};
use crate::errors::PartsError;
use crate::overlay::layer_hash;
use crate::parts::{self, Part};
use crate::state::manager::StateManager;
use crate::steps::Step;

/// The result of a single `plan()` call: the ordered action list plus the
/// plan-wide overlay hash, if this plan ever needed one.
#[derive(Debug, Clone)]
pub struct PlanResult {
    pub actions: Vec<Action>,
    pub overlay_hash: Option<String>,
}

/// Plans action lists against a fixed, already-sorted part list and a
/// shared `StateManager`. One `Sequencer` is built per `LifecycleManager`
/// and reused across `plan()` calls within a session.
pub struct Sequencer<'a> {
    pub sorted_parts: &'a [Part],
    pub state_manager: &'a StateManager,
    pub project_options: &'a ProjectOptions,
    pub base_layer_hash: &'a [u8],
    pub config: &'a EngineConfig,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        sorted_parts: &'a [Part],
        state_manager: &'a StateManager,
        project_options: &'a ProjectOptions,
        base_layer_hash: &'a [u8],
        config: &'a EngineConfig,
    ) -> Self {
        Sequencer {
            sorted_parts,
            state_manager,
            project_options,
            base_layer_hash,
            config,
        }
    }

    fn find(&self, name: &str) -> Option<&'a Part> {
        self.sorted_parts.iter().find(|p| p.name == name)
    }

    fn last_part(&self) -> Option<&'a Part> {
        self.sorted_parts.last()
    }

    /// Entry point (§4.3 algorithm steps 1-3). `part_names` selects a
    /// subset; empty/`None` selects every part.
    pub fn plan(&self, target_step: Step, part_names: Option<&[String]>) -> Result<Vec<Action>, PartsError> {
        Ok(self.plan_full(target_step, part_names)?.actions)
    }

    /// Like `plan`, but also returns the plan-wide overlay hash fixed by
    /// `ensure_overlay_consistency` the first time a BUILD/STAGE step
    /// needed one (§4.3), for the executor to stamp into BUILD/STAGE/PRIME
    /// state records.
    pub fn plan_full(&self, target_step: Step, part_names: Option<&[String]>) -> Result<PlanResult, PartsError> {
        let mut ctx = PlanContext::new();
        self.plan_into(&mut ctx, target_step, part_names)?;
        Ok(PlanResult {
            actions: ctx.actions,
            overlay_hash: ctx.plan_overlay_hash,
        })
    }

    /// Recursive core: emits into `ctx` rather than returning a fresh list,
    /// so prerequisite sub-plans (dependency pulls, overlay consistency
    /// repairs) share one running action log and one "already emitted this
    /// part/step" memo with the top-level plan.
    fn plan_into(&self, ctx: &mut PlanContext, target_step: Step, part_names: Option<&[String]>) -> Result<(), PartsError> {
        let selected = parts::part_list_by_name(part_names, self.sorted_parts);
        let selected_names: HashSet<&str> = selected.iter().map(|p| p.name.as_str()).collect();
        let explicitly_named = part_names.is_some_and(|n| !n.is_empty());

        let mut steps_to_plan = target_step.previous_steps();
        steps_to_plan.push(target_step);

        for current_step in steps_to_plan {
            for p in &selected {
                if current_step == Step::Overlay {
                    let reason = format!("required to overlay {:?}", p.name);
                    let h = self.ensure_overlay_consistency(ctx, p, &reason, true)?;
                    p.set_layer_hash(h);
                } else {
                    let sees_or_has_overlay = (current_step == Step::Build && self.sees_overlay(p))
                        || (current_step == Step::Stage && p.has_overlay());
                    if sees_or_has_overlay && ctx.plan_overlay_hash.is_none() {
                        if let Some(last) = self.last_part() {
                            let reason = format!("required to {} {:?}", current_step.verb(), p.name);
                            let h = self.ensure_overlay_consistency(ctx, last, &reason, false)?;
                            ctx.plan_overlay_hash = Some(hex::encode(&h));
                        }
                    }
                }

                self.add_step_actions(ctx, current_step, target_step, p, explicitly_named && selected_names.contains(p.name.as_str()))?;
            }
        }

        Ok(())
    }

    /// True iff `part`, or any part before it in `sorted_parts`, has
    /// overlay parameters (§4.4 "has overlay visibility").
    fn sees_overlay(&self, part: &Part) -> bool {
        parts::has_overlay_visibility(part, self.sorted_parts)
    }

    /// §4.3 `ensure_overlay_consistency`: walk the stack from the bottom,
    /// recomputing each part's layer hash against the previous part's, and
    /// emit an OVERLAY plan for any part whose persisted hash has drifted.
    /// Returns `top_part`'s freshly computed hash.
    fn ensure_overlay_consistency(
        &self,
        ctx: &mut PlanContext,
        top_part: &Part,
        reason: &str,
        skip_last: bool,
    ) -> Result<Vec<u8>, PartsError> {
        let mut previous_hash = self.base_layer_hash.to_vec();
        let mut result = previous_hash.clone();

        for p in self.sorted_parts {
            let h = layer_hash::compute_layer_digest(&p.spec, &previous_hash);

            if p.name == top_part.name && skip_last {
                result = h;
                break;
            }

            let persisted = self.state_manager.get_layer_hash(p);
            if persisted.as_deref() != Some(h.as_slice()) {
                if ctx.emitted.contains(&(p.name.clone(), Step::Overlay)) {
                    // A repair for this part's OVERLAY was already queued
                    // earlier in this same plan; `add_step_actions_with_reason`
                    // is idempotent on `ctx.emitted`, so re-planning it here
                    // would just no-op. The drift still shows up against
                    // on-disk state because nothing executes during planning,
                    // not because the queued repair is wrong.
                    let message = format!("overlay stack still drifted at {:?} pending its already-planned repair ({reason})", p.name);
                    if self.config.strict_layer_validation {
                        warn!("{message}");
                    } else {
                        debug!("{message}");
                    }
                } else {
                    debug!("overlay stack drift at {:?}, replanning OVERLAY ({reason})", p.name);
                    let names = vec![p.name.clone()];
                    self.plan_overlay_prerequisite(ctx, &names, reason)?;
                }
            }
            // Cache every part's freshly computed hash as we walk, not just
            // `top_part`'s: the executor reads a part's own `layer_hash()`
            // at OVERLAY-execution time to find the previous part's digest,
            // and a predecessor reached only through this recursive
            // consistency walk (never visited by the main per-part loop)
            // would otherwise never have it set.
            p.set_layer_hash(h.clone());

            if p.name == top_part.name {
                result = h;
                break;
            }
            previous_hash = h;
        }

        Ok(result)
    }

    /// A narrowed recursive call used only by `ensure_overlay_consistency`:
    /// plan OVERLAY for exactly the named part, tagging every action this
    /// produces with `reason` (the table's "required to overlay/build/stage
    /// 'x'" wording), without re-triggering another layer-consistency pass
    /// (the caller is already inside one).
    fn plan_overlay_prerequisite(&self, ctx: &mut PlanContext, names: &[String], reason: &str) -> Result<(), PartsError> {
        let selected = parts::part_list_by_name(Some(names), self.sorted_parts);
        for current_step in Step::Overlay.previous_steps().into_iter().chain(std::iter::once(Step::Overlay)) {
            for p in &selected {
                self.add_step_actions_with_reason(ctx, current_step, Step::Overlay, p, false, Some(reason))?;
            }
        }
        Ok(())
    }

    /// §4.3 `_add_step_actions` policy table, plus the dependency-prerequisite
    /// recursion and REAPPLY detection described in the prose around it.
    fn add_step_actions(
        &self,
        ctx: &mut PlanContext,
        current_step: Step,
        target_step: Step,
        part: &Part,
        explicitly_named_at_target: bool,
    ) -> Result<(), PartsError> {
        self.add_step_actions_with_reason(ctx, current_step, target_step, part, explicitly_named_at_target, None)
    }

    fn add_step_actions_with_reason(
        &self,
        ctx: &mut PlanContext,
        current_step: Step,
        target_step: Step,
        part: &Part,
        explicitly_named_at_target: bool,
        forced_reason: Option<&str>,
    ) -> Result<(), PartsError> {
        let key = (part.name.clone(), current_step);
        if ctx.emitted.contains(&key) {
            return Ok(());
        }

        // A lower step of this same part already running/rerunning in this
        // plan will, once executed, clean every higher step's state along
        // with it (§4.4 "for RERUN, clean step and every higher step").
        // Treat those higher steps as not-yet-run now rather than waiting
        // to discover it on the next plan (spec §8 S4: a PULL RERUN forces
        // every later step of that part to RUN in the same plan). REAPPLY
        // is explicitly exempted: it remounts a layer without invalidating
        // anything above it.
        let invalidated_by_lower_step = ctx.part_invalidated.contains(&part.name);
        let has_run = !invalidated_by_lower_step && self.state_manager.has_step_run(&part.name, current_step);

        if !has_run {
            self.emit_dependency_prerequisite(ctx, current_step, part)?;
            let reason = forced_reason.map(str::to_string);
            self.emit(ctx, part, current_step, ActionType::Run, reason);
            ctx.part_invalidated.insert(part.name.clone());
            if current_step == Step::Overlay {
                ctx.record_overlay_action(&part.name, ActionType::Run);
            }
            return Ok(());
        }

        if current_step == target_step && explicitly_named_at_target {
            self.emit_dependency_prerequisite(ctx, current_step, part)?;
            self.emit(ctx, part, current_step, ActionType::Rerun, Some("requested step".to_string()));
            ctx.part_invalidated.insert(part.name.clone());
            if current_step == Step::Overlay {
                ctx.record_overlay_action(&part.name, ActionType::Rerun);
            }
            return Ok(());
        }

        if let Some(dirty) = self.state_manager.check_if_dirty(
            part,
            current_step,
            self.sorted_parts,
            self.project_options,
            ctx.plan_overlay_hash.as_deref(),
        ) {
            self.emit_dependency_prerequisite(ctx, current_step, part)?;
            let reason = forced_reason.map(str::to_string).unwrap_or_else(|| dirty.reason().to_string());
            self.emit(ctx, part, current_step, ActionType::Rerun, Some(reason));
            if current_step == Step::Overlay {
                // Don't force this part's own BUILD onto the generic
                // "never ran" RUN path (that's for PULL/explicit-target
                // invalidation, which has no sharper signal available). BUILD
                // already has one via the overlay-hash comparison in its own
                // `check_if_dirty` call, which reports the more precise
                // "overlay changed" reason (S2) once `plan_overlay_hash`
                // reflects this part's freshly recomputed layer.
                ctx.record_overlay_action(&part.name, ActionType::Rerun);
            } else {
                ctx.part_invalidated.insert(part.name.clone());
            }
            return Ok(());
        }

        if let Some(outdated) = self.state_manager.check_if_outdated(part, current_step, self.sorted_parts) {
            let reason = forced_reason.map(str::to_string).unwrap_or_else(|| outdated.reason().to_string());
            match current_step {
                Step::Pull | Step::Overlay | Step::Build => {
                    self.emit(ctx, part, current_step, ActionType::Update, Some(reason));
                    self.state_manager.mark_step_updated(&part.name, current_step);
                }
                Step::Stage | Step::Prime => {
                    self.emit_dependency_prerequisite(ctx, current_step, part)?;
                    self.emit(ctx, part, current_step, ActionType::Rerun, Some(reason));
                    self.state_manager.mark_step_updated(&part.name, current_step);
                    ctx.part_invalidated.insert(part.name.clone());
                }
            }
            return Ok(());
        }

        if current_step == Step::Overlay {
            if let Some(reapply_reason) = self.reapply_reason(ctx, part) {
                self.emit(ctx, part, current_step, ActionType::Reapply, Some(reapply_reason.to_string()));
                ctx.record_overlay_action(&part.name, ActionType::Skip);
                return Ok(());
            }
        }

        self.emit(ctx, part, current_step, ActionType::Skip, forced_reason.map(str::to_string).or_else(|| Some("already ran".to_string())));
        if current_step == Step::Overlay {
            ctx.record_overlay_action(&part.name, ActionType::Skip);
        }
        Ok(())
    }

    /// REAPPLY detection (§4.3): reached only once this part's OVERLAY has
    /// already run and is otherwise an "already ran" SKIP (not dirty, not
    /// outdated, not the explicitly requested target). REAPPLY fires when a
    /// strictly-earlier part in the *current plan* re-ran its own OVERLAY
    /// (RUN or RERUN) — the layer stack moved under this part even though
    /// its own properties did not change.
    fn reapply_reason(&self, ctx: &PlanContext, part: &Part) -> Option<&'static str> {
        for earlier in self.sorted_parts {
            if earlier.name == part.name {
                break;
            }
            if matches!(ctx.overlay_action_of(&earlier.name), Some(ActionType::Run) | Some(ActionType::Rerun)) {
                return Some("previous layer changed");
            }
        }
        None
    }

    /// Before emitting a RUN/RERUN for `current_step`, recursively plan the
    /// step's dependency-prerequisite (§4.3 table: PULL none, OVERLAY the
    /// previous part's OVERLAY, BUILD dependency parts' STAGE, STAGE this
    /// part's BUILD, PRIME this part's STAGE) for every dependency that
    /// still `should_step_run`.
    fn emit_dependency_prerequisite(&self, ctx: &mut PlanContext, current_step: Step, part: &Part) -> Result<(), PartsError> {
        let Some(prerequisite_step) = current_step.dependency_prerequisite_step() else {
            return Ok(());
        };

        let dependency_names: Vec<String> = match current_step {
            Step::Build => parts::part_dependencies(&part.name, self.sorted_parts)
                .into_iter()
                .map(|p| p.name.clone())
                .collect(),
            Step::Stage | Step::Prime => vec![part.name.clone()],
            _ => return Ok(()),
        };

        let reason = format!("required to {} {:?}", current_step.verb(), part.name);

        for dep_name in dependency_names {
            let Some(dep) = self.find(&dep_name) else { continue };
            let should_run = self.state_manager.should_step_run(
                dep,
                prerequisite_step,
                self.sorted_parts,
                self.project_options,
                ctx.plan_overlay_hash.as_deref(),
            );
            if !should_run {
                continue;
            }
            let names = vec![dep_name];
            self.plan_prerequisite(ctx, prerequisite_step, &names, &reason)?;
        }
        Ok(())
    }

    /// Plan `target_step` for exactly `names`, tagging freshly-emitted
    /// actions with `reason` unless they already carry a more specific one
    /// (a dirty/outdated reason always wins over the generic "required to"
    /// label, matching scenario S3's expected output).
    fn plan_prerequisite(&self, ctx: &mut PlanContext, target_step: Step, names: &[String], reason: &str) -> Result<(), PartsError> {
        let selected = parts::part_list_by_name(Some(names), self.sorted_parts);
        let mut steps_to_plan = target_step.previous_steps();
        steps_to_plan.push(target_step);

        for current_step in steps_to_plan {
            for p in &selected {
                if current_step == Step::Overlay {
                    let sub_reason = format!("required to overlay {:?}", p.name);
                    let h = self.ensure_overlay_consistency(ctx, p, &sub_reason, true)?;
                    p.set_layer_hash(h);
                }
                let forced = if current_step == target_step { Some(reason) } else { None };
                self.add_step_actions_with_reason(ctx, current_step, target_step, p, false, forced)?;
            }
        }
        Ok(())
    }

    fn emit(&self, ctx: &mut PlanContext, part: &Part, step: Step, action_type: ActionType, reason: Option<String>) {
        let key = (part.name.clone(), step);
        ctx.emitted.insert(key);
        ctx.actions.push(Action::new(part.name.clone(), step, action_type, reason));
    }
}

/// Per-`plan()`-call mutable bookkeeping: the action log so far, which
/// `(part, step)` pairs have already been emitted (so a dependency
/// recursion doesn't double-emit a step the top-level loop will also visit),
/// the plan-wide fixed overlay hash once `ensure_overlay_consistency` has
/// run for BUILD/STAGE, and each part's OVERLAY action type this plan (for
/// REAPPLY detection).
struct PlanContext {
    actions: Vec<Action>,
    emitted: HashSet<(String, Step)>,
    plan_overlay_hash: Option<String>,
    overlay_actions: std::collections::HashMap<String, ActionType>,
    /// Parts for which a RUN or RERUN of some step has already been
    /// emitted this plan; every later (higher) step of that part is
    /// forced to RUN too, since executing that RUN/RERUN will clean the
    /// higher steps' state out from under them (§4.4).
    part_invalidated: HashSet<String>,
}

impl PlanContext {
    fn new() -> Self {
        PlanContext {
            actions: Vec::new(),
            emitted: HashSet::new(),
            plan_overlay_hash: None,
            overlay_actions: std::collections::HashMap::new(),
            part_invalidated: HashSet::new(),
        }
    }

    fn record_overlay_action(&mut self, part_name: &str, action_type: ActionType) {
        self.overlay_actions.insert(part_name.to_string(), action_type);
    }

    fn overlay_action_of(&self, part_name: &str) -> Option<ActionType> {
        self.overlay_actions.get(part_name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::PartSpec;
    use crate::state::states::{BuildState, OverlayState, PrimeState, PullState, StageState, StepState};
    use tempfile::tempdir;

    fn nil_part(name: &str, after: &[&str], dir: &std::path::Path) -> Part {
        let mut spec = PartSpec::nil(None);
        spec.after = after.iter().map(|s| s.to_string()).collect();
        Part::new(name, spec, dir)
    }

    fn run_pull_and_overlay(sm: &StateManager, part: &Part, opts: &ProjectOptions) {
        let pull = StepState::Pull(PullState::new(part.spec.marshal(), opts.clone()));
        sm.set_state(&part.name, Step::Pull, pull);
        sm.commit_state(&part.name, Step::Pull).unwrap();

        let hash = layer_hash::compute_layer_digest(&part.spec, b"");
        layer_hash::save_layer_hash(part, &hash).unwrap();
        let mut overlay = StepState::Overlay(OverlayState::new(part.spec.marshal(), opts.clone()));
        overlay.common_mut().overlay_hash = Some(hex::encode(&hash));
        sm.set_state(&part.name, Step::Overlay, overlay);
        sm.commit_state(&part.name, Step::Overlay).unwrap();
    }

    /// Persists Pull/Overlay/Build/Stage/Prime state as if `part` had just
    /// finished a full PRIME execution: `chain_previous` is the previous
    /// part's layer hash (the base hash for the first part in the stack),
    /// `plan_top_hash` the plan-wide hash the BUILD/STAGE steps stamped (the
    /// last part's own hash). Returns this part's own layer hash.
    fn run_full_prime(sm: &StateManager, part: &Part, opts: &ProjectOptions, chain_previous: &[u8], plan_top_hash: &str) -> Vec<u8> {
        let pull = StepState::Pull(PullState::new(part.spec.marshal(), opts.clone()));
        sm.set_state(&part.name, Step::Pull, pull);
        sm.commit_state(&part.name, Step::Pull).unwrap();

        let own_hash = layer_hash::compute_layer_digest(&part.spec, chain_previous);
        layer_hash::save_layer_hash(part, &own_hash).unwrap();
        let mut overlay = StepState::Overlay(OverlayState::new(part.spec.marshal(), opts.clone()));
        overlay.common_mut().overlay_hash = Some(hex::encode(&own_hash));
        sm.set_state(&part.name, Step::Overlay, overlay);
        sm.commit_state(&part.name, Step::Overlay).unwrap();

        let mut build = StepState::Build(BuildState::new(part.spec.marshal(), opts.clone()));
        build.common_mut().overlay_hash = Some(plan_top_hash.to_string());
        sm.set_state(&part.name, Step::Build, build);
        sm.commit_state(&part.name, Step::Build).unwrap();

        let mut stage = StepState::Stage(StageState::new(part.spec.marshal(), opts.clone()));
        stage.common_mut().overlay_hash = Some(plan_top_hash.to_string());
        sm.set_state(&part.name, Step::Stage, stage);
        sm.commit_state(&part.name, Step::Stage).unwrap();

        let prime = StepState::Prime(PrimeState::new(part.spec.marshal(), opts.clone()));
        sm.set_state(&part.name, Step::Prime, prime);
        sm.commit_state(&part.name, Step::Prime).unwrap();

        own_hash
    }

    #[test]
    fn s1_full_prime_plan_for_three_nil_parts() {
        let dir = tempdir().unwrap();
        let p1 = nil_part("p1", &[], dir.path());
        let p2 = nil_part("p2", &[], dir.path());
        let p3 = nil_part("p3", &[], dir.path());
        let sorted = vec![p1, p2, p3];
        let sm = StateManager::new(dir.path());
        let opts = ProjectOptions::default();
        let base = Vec::new();

        let config = EngineConfig::new(dir.path());
        let seq = Sequencer::new(&sorted, &sm, &opts, &base, &config);
        let names = vec!["p3".to_string()];
        let actions = seq.plan(Step::Prime, Some(&names)).unwrap();

        let rendered: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
        assert!(rendered.iter().any(|s| s.starts_with("p3:pull RUN")));
        assert!(rendered.iter().any(|s| s.contains("p1:pull RUN") && s.contains("required to overlay")));
        assert!(rendered.iter().any(|s| s.contains("p1:overlay RUN")));
        assert!(rendered.iter().any(|s| s.starts_with("p2:pull RUN")));
        assert!(rendered.iter().any(|s| s.starts_with("p2:overlay RUN")));
        assert!(rendered.iter().any(|s| s.starts_with("p3:overlay RUN")));
        assert!(rendered.iter().any(|s| s.starts_with("p3:build RUN")));
        assert!(rendered.iter().any(|s| s.starts_with("p3:stage RUN")));
        assert!(rendered.iter().any(|s| s.starts_with("p3:prime RUN")));
    }

    #[test]
    fn plan_monotonicity_second_identical_plan_is_all_skip() {
        let dir = tempdir().unwrap();
        let p1 = nil_part("p1", &[], dir.path());
        let sorted = vec![p1];
        let sm = StateManager::new(dir.path());
        let opts = ProjectOptions::default();
        let base = Vec::new();

        run_pull_and_overlay(&sm, &sorted[0], &opts);
        for step in [Step::Build, Step::Stage, Step::Prime] {
            let state = crate::state::states::StepState::Build(crate::state::states::BuildState::new(
                sorted[0].spec.marshal(),
                opts.clone(),
            ));
            sm.set_state("p1", step, state);
            sm.commit_state("p1", step).unwrap();
        }

        let config = EngineConfig::new(dir.path());
        let seq = Sequencer::new(&sorted, &sm, &opts, &base, &config);
        let actions = seq.plan(Step::Prime, None).unwrap();
        assert!(actions.iter().all(|a| a.action_type == crate::actions::ActionType::Skip));
    }

    #[test]
    fn dirty_source_causes_full_rerun_chain() {
        let dir = tempdir().unwrap();
        let mut p1 = nil_part("p1", &[], dir.path());
        let sorted_for_run = vec![Part::new("p1", p1.spec.clone(), dir.path())];
        let sm = StateManager::new(dir.path());
        let opts = ProjectOptions::default();
        let base = Vec::new();

        run_pull_and_overlay(&sm, &sorted_for_run[0], &opts);
        for step in [Step::Build, Step::Stage, Step::Prime] {
            let state = crate::state::states::StepState::Build(crate::state::states::BuildState::new(
                sorted_for_run[0].spec.marshal(),
                opts.clone(),
            ));
            sm.set_state("p1", step, state);
            sm.commit_state("p1", step).unwrap();
        }

        p1.spec.source = Some("changed".to_string());
        let sorted = vec![p1];
        let config = EngineConfig::new(dir.path());
        let seq = Sequencer::new(&sorted, &sm, &opts, &base, &config);
        let actions = seq.plan(Step::Prime, None).unwrap();

        let pull_action = actions.iter().find(|a| a.step == Step::Pull).unwrap();
        assert_eq!(pull_action.action_type, crate::actions::ActionType::Rerun);
        assert_eq!(pull_action.reason.as_deref(), Some("'source' property changed"));

        // S4: a PULL RERUN invalidates every higher step of the same part
        // for the rest of this plan, so each comes back as RUN rather than
        // SKIP even though their own state files were never touched.
        for step in [Step::Overlay, Step::Build, Step::Stage, Step::Prime] {
            let action = actions.iter().find(|a| a.step == step).unwrap();
            assert_eq!(action.action_type, crate::actions::ActionType::Run, "{step} should RUN after the PULL rerun");
        }
    }

    #[test]
    fn s2_overlay_property_change_reapplies_downstream_part() {
        let dir = tempdir().unwrap();
        let mut a = nil_part("a", &[], dir.path());
        a.spec.overlay_script = Some("script-a".to_string());
        let mut b = nil_part("b", &[], dir.path());
        b.spec.overlay_script = Some("script-b".to_string());
        let sorted_for_run = vec![a, b];
        let sm = StateManager::new(dir.path());
        let opts = ProjectOptions::default();
        let base: Vec<u8> = Vec::new();

        let hash_a = layer_hash::compute_layer_digest(&sorted_for_run[0].spec, &base);
        let hash_b = layer_hash::compute_layer_digest(&sorted_for_run[1].spec, &hash_a);
        let top_hash = hex::encode(&hash_b);

        run_full_prime(&sm, &sorted_for_run[0], &opts, &base, &top_hash);
        run_full_prime(&sm, &sorted_for_run[1], &opts, &hash_a, &top_hash);

        let mut sorted = sorted_for_run;
        sorted[0].spec.overlay_script = Some("script-a-changed".to_string());

        let config = EngineConfig::new(dir.path());
        let seq = Sequencer::new(&sorted, &sm, &opts, &base, &config);
        let actions = seq.plan(Step::Prime, None).unwrap();

        let find = |name: &str, step: Step| actions.iter().find(|act| act.part_name == name && act.step == step).unwrap();

        assert_eq!(find("a", Step::Pull).action_type, ActionType::Skip);
        assert_eq!(find("b", Step::Pull).action_type, ActionType::Skip);

        let a_overlay = find("a", Step::Overlay);
        assert_eq!(a_overlay.action_type, ActionType::Rerun);
        assert_eq!(a_overlay.reason.as_deref(), Some("'override-overlay' property changed"));

        let b_overlay = find("b", Step::Overlay);
        assert_eq!(b_overlay.action_type, ActionType::Reapply);
        assert_eq!(b_overlay.reason.as_deref(), Some("previous layer changed"));

        let a_build = find("a", Step::Build);
        assert_eq!(a_build.action_type, ActionType::Rerun);
        assert_eq!(a_build.reason.as_deref(), Some("overlay changed"));

        let b_build = find("b", Step::Build);
        assert_eq!(b_build.action_type, ActionType::Rerun);
        assert_eq!(b_build.reason.as_deref(), Some("overlay changed"));

        for step in [Step::Stage, Step::Prime] {
            assert_eq!(find("a", step).action_type, ActionType::Run, "a:{step} should RUN after its BUILD rerun");
            assert_eq!(find("b", step).action_type, ActionType::Run, "b:{step} should RUN after its BUILD rerun");
        }
    }

    #[test]
    fn s3_staging_one_part_pulls_in_its_build_dependency_and_its_overlay_neighbor() {
        // `p1 after [p2]` puts p2 ahead of p1 in both the dependency order
        // and the layer stack (`sort_parts_respects_after`); p3 keeps its
        // declared position after both. Only p2 carries an overlay, so it
        // alone sits at the bottom of the stack and nothing is "below" it
        // to reconcile during its own OVERLAY; the stack-consistency walk
        // only has work to do once BUILD needs the full stack's hash and
        // discovers p1/p3 have never been overlaid at all.
        let dir = tempdir().unwrap();
        let p1 = nil_part("p1", &["p2"], dir.path());
        let mut p2 = nil_part("p2", &[], dir.path());
        p2.spec.overlay_script = Some("script".to_string());
        let p3 = nil_part("p3", &[], dir.path());
        let sorted = vec![p2, p1, p3];
        let sm = StateManager::new(dir.path());
        let opts = ProjectOptions::default();
        let base: Vec<u8> = Vec::new();

        let config = EngineConfig::new(dir.path());
        let seq = Sequencer::new(&sorted, &sm, &opts, &base, &config);
        let names = vec!["p2".to_string()];
        let actions = seq.plan(Step::Stage, Some(&names)).unwrap();

        let find = |name: &str, step: Step| actions.iter().find(|a| a.part_name == name && a.step == step);

        assert_eq!(find("p2", Step::Pull).unwrap().action_type, ActionType::Run);
        assert_eq!(find("p2", Step::Overlay).unwrap().action_type, ActionType::Run);
        assert_eq!(find("p2", Step::Build).unwrap().action_type, ActionType::Run);
        assert_eq!(find("p2", Step::Stage).unwrap().action_type, ActionType::Run);

        // Brought in only once BUILD needs a consistent stack hash and
        // finds p1/p3 have no persisted layer hash of their own yet.
        for dependent in ["p1", "p3"] {
            let pull = find(dependent, Step::Pull).unwrap();
            assert_eq!(pull.action_type, ActionType::Run);
            assert!(pull.reason.as_deref().unwrap().contains("required to build"));
            let overlay = find(dependent, Step::Overlay).unwrap();
            assert_eq!(overlay.action_type, ActionType::Run);
            assert!(overlay.reason.as_deref().unwrap().contains("required to build"));
            assert!(find(dependent, Step::Build).is_none(), "{dependent} was never asked to build");
        }
    }

    #[test]
    fn plan_monotonicity_random_part_subset_is_pure_skip() {
        use rand::Rng;

        let dir = tempdir().unwrap();
        let names = ["p1", "p2", "p3", "p4"];
        let parts: Vec<Part> = names.iter().map(|n| nil_part(n, &[], dir.path())).collect();
        let sm = StateManager::new(dir.path());
        let opts = ProjectOptions::default();
        let base: Vec<u8> = Vec::new();

        let mut chain = vec![base.clone()];
        for part in &parts {
            let h = layer_hash::compute_layer_digest(&part.spec, chain.last().unwrap());
            chain.push(h);
        }
        let top_hash = hex::encode(chain.last().unwrap());

        let mut previous = base.clone();
        for part in &parts {
            previous = run_full_prime(&sm, part, &opts, &previous, &top_hash);
        }

        let mut rng = rand::rng();
        for _ in 0..8 {
            let subset: Vec<String> = names.iter().filter(|_| rng.random_bool(0.5)).map(|s| s.to_string()).collect();
            let part_names = if subset.is_empty() { None } else { Some(subset.as_slice()) };
            let config = EngineConfig::new(dir.path());
            let seq = Sequencer::new(&parts, &sm, &opts, &base, &config);
            let actions = seq.plan(Step::Prime, part_names).unwrap();
            assert!(actions.iter().all(|a| a.action_type == ActionType::Skip), "a fully primed plan must replan to all-SKIP regardless of the requested subset");
        }
    }
}
