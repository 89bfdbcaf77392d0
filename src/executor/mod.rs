//! The Part Handler (§4.4): executes a single action against a single
//! part, turning Sequencer output into filesystem and state-record changes.

pub mod filesets;
pub mod migration;
pub mod organize;
pub mod step_handler;

use std::collections::BTreeSet;
use std::fs;

use tracing::{info, warn};

use crate::callbacks::CallbackRegistry;
use crate::config::ProjectOptions;
use crate::errors::PartsError;
use crate::overlay::{self, layer_hash, LayerMounter, MountBackend, MountGuardState, PackageCacheMounter};
use crate::packages::{snaps::SnapRepository, PackageRepository};
use crate::parts::Part;
use crate::plugins::{self, PluginContext};
use crate::sources;
use crate::state::manager::StateManager;
use crate::state::states::{BuildState, CommonState, OverlayState, PrimeState, PullState, StageState, StepState};
use crate::steps::Step;

/// Everything the Part Handler needs beyond the part itself and its sorted
/// siblings, collected in one place so `LifecycleManager` can own it and
/// hand out a `&PartHandler` per dispatch.
pub struct PartHandler<'a> {
    pub state_manager: &'a StateManager,
    pub package_repo: &'a dyn PackageRepository,
    pub snap_repo: &'a dyn SnapRepository,
    pub mount_backend: &'a dyn MountBackend,
    pub mount_guard: &'a MountGuardState,
    pub callbacks: &'a CallbackRegistry,
    pub work_root: std::path::PathBuf,
}

impl<'a> PartHandler<'a> {
    fn overlay_marker_path(&self, step: Step) -> std::path::PathBuf {
        let name = match step {
            Step::Stage => "stage_overlay",
            Step::Prime => "prime_overlay",
            _ => unreachable!("overlay marker only applies to STAGE/PRIME"),
        };
        self.work_root.join("overlay").join(name)
    }

    // ---- PULL -------------------------------------------------------

    pub fn run_pull(&self, part: &Part, project_options: &ProjectOptions) -> Result<StepState, PartsError> {
        let _ = fs::remove_dir_all(part.src_dir());
        for dir in part.all_dirs() {
            fs::create_dir_all(dir)?;
        }
        fs::create_dir_all(part.packages_dir())?;
        fs::create_dir_all(part.snaps_dir())?;

        let resolved_stage_packages = self
            .package_repo
            .fetch(&part.spec.stage_packages, &part.packages_dir())
            .map_err(|_| PartsError::StagePackageNotFound {
                part_name: part.name.clone(),
                package_name: part.spec.stage_packages.join(","),
            })?;
        let resolved_stage_snaps = self.snap_repo.fetch(&part.spec.stage_snaps, &part.snaps_dir())?;
        if !part.spec.overlay_packages.is_empty() {
            self.package_repo
                .fetch(&part.spec.overlay_packages, &part.packages_dir())
                .map_err(|_| PartsError::OverlayPackageNotFound {
                    part_name: part.name.clone(),
                    package_name: part.spec.overlay_packages.join(","),
                })?;
        }

        step_handler::run_step(
            part.spec.scriptlet(Step::Pull),
            &part.src_dir(),
            &part.name,
            "pull",
            || {
                if let Some(handler) = sources::resolve(part.spec.source.as_deref(), part.spec.source_type.as_deref()) {
                    handler.pull(&part.src_dir())
                } else {
                    Ok(())
                }
            },
        )?;

        let mut common = CommonState::new(part.spec.marshal(), project_options.clone());
        common.assets = Some(serde_json::json!({
            "stage-packages": resolved_stage_packages,
            "stage-snaps": resolved_stage_snaps,
        }));
        Ok(StepState::Pull(PullState { common }))
    }

    // ---- OVERLAY ------------------------------------------------------

    pub fn run_overlay(
        &self,
        part: &Part,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        previous_layer_hash: &[u8],
    ) -> Result<StepState, PartsError> {
        for dir in part.all_dirs() {
            fs::create_dir_all(dir)?;
        }
        fs::create_dir_all(part.layer_dir())?;

        if !part.spec.overlay_packages.is_empty() {
            let mounter = PackageCacheMounter::new(self.mount_backend, self.mount_guard, &part.packages_dir(), part.layer_dir())?;
            self.package_repo.unpack(&part.packages_dir(), &part.layer_dir())?;
            drop(mounter);
        }

        {
            let mounter = LayerMounter::new(self.mount_backend, self.mount_guard, sorted_parts, part, part.overlay_dir())?;
            step_handler::run_step(
                part.spec.overlay_script.as_deref(),
                &part.layer_dir(),
                &part.name,
                "overlay",
                || Ok(()),
            )?;
            drop(mounter);
        }

        let filter = filesets::FileFilter::from_entries(&part.spec.overlay_files);
        let mut kept_files = BTreeSet::new();
        let mut kept_dirs = BTreeSet::new();
        if part.layer_dir().is_dir() {
            for entry in walkdir::WalkDir::new(part.layer_dir()).min_depth(1) {
                let entry = entry.map_err(std::io::Error::other)?;
                let rel = entry
                    .path()
                    .strip_prefix(part.layer_dir())
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let is_whiteout = overlay::is_whiteout_file(entry.path());
                if filter.is_empty() || filter.matches_with_whiteout_carveout(&rel, is_whiteout) {
                    if entry.file_type().is_dir() {
                        kept_dirs.insert(rel);
                    } else {
                        kept_files.insert(rel);
                    }
                } else if entry.file_type().is_file() {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }

        let hash = layer_hash::compute_layer_digest(&part.spec, previous_layer_hash);
        layer_hash::save_layer_hash(part, &hash)?;

        let mut common = CommonState::new(part.spec.marshal(), project_options.clone());
        common.files = kept_files;
        common.directories = kept_dirs;
        common.overlay_hash = Some(hex::encode(&hash));
        Ok(StepState::Overlay(OverlayState { common }))
    }

    // ---- BUILD ----------------------------------------------------------

    pub fn run_build(
        &self,
        part: &Part,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        plan_overlay_hash: Option<&str>,
        update: bool,
    ) -> Result<StepState, PartsError> {
        let _ = fs::remove_dir_all(part.build_dir());
        for dir in part.all_dirs() {
            fs::create_dir_all(dir)?;
        }

        self.package_repo.unpack(&part.packages_dir(), &part.install_dir())?;
        self.snap_repo.fetch(&part.spec.stage_snaps, &part.snaps_dir())?;

        migration::migrate_tree(&part.src_dir(), &part.build_dir(), &part.name, &Default::default(), &Default::default())?;

        let run_builtin_build = || {
            let plugin = plugins::resolve(&part.spec.plugin);
            let ctx = PluginContext {
                part_name: &part.name,
                spec: &part.spec,
                build_dir: &part.build_dir(),
                install_dir: &part.install_dir(),
            };
            plugin.build(&ctx)
        };

        let sees_overlay = crate::parts::has_overlay_visibility(part, sorted_parts);
        if sees_overlay {
            let mounter = LayerMounter::new(self.mount_backend, self.mount_guard, sorted_parts, part, part.overlay_dir())?;
            step_handler::run_step(part.spec.scriptlet(Step::Build), &part.build_dir(), &part.name, "build", run_builtin_build)?;
            drop(mounter);
        } else {
            step_handler::run_step(part.spec.scriptlet(Step::Build), &part.build_dir(), &part.name, "build", run_builtin_build)?;
        }

        fs::create_dir_all(part.install_dir())?;
        let previously_organized = if update {
            self.state_manager
                .get_state(&part.name, Step::Build)
                .map(|s| s.common().files.clone())
                .unwrap_or_default()
        } else {
            BTreeSet::new()
        };
        let organized = organize::organize_files(&part.install_dir(), &part.spec.organize, update, &previously_organized, &part.name)?;

        let manifest = crate::manifest::machine_manifest(
            &self.package_repo.get_installed_packages()?,
            &self.snap_repo.get_installed_snaps()?,
        );

        let mut common = CommonState::new(part.spec.marshal(), project_options.clone());
        common.files = organized;
        common.overlay_hash = plan_overlay_hash.map(str::to_string);
        common.assets = Some(manifest);
        Ok(StepState::Build(BuildState { common }))
    }

    // ---- STAGE / PRIME ---------------------------------------------------

    pub fn run_stage(
        &self,
        part: &Part,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        plan_overlay_hash: Option<&str>,
    ) -> Result<StepState, PartsError> {
        self.run_migrate_step(part, sorted_parts, project_options, plan_overlay_hash, Step::Stage)
    }

    pub fn run_prime(
        &self,
        part: &Part,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        plan_overlay_hash: Option<&str>,
    ) -> Result<StepState, PartsError> {
        self.run_migrate_step(part, sorted_parts, project_options, plan_overlay_hash, Step::Prime)
    }

    fn run_migrate_step(
        &self,
        part: &Part,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        plan_overlay_hash: Option<&str>,
        step: Step,
    ) -> Result<StepState, PartsError> {
        fs::create_dir_all(part.stage_dir())?;
        fs::create_dir_all(part.prime_dir())?;

        let shared_dir = if step == Step::Stage { part.stage_dir() } else { part.prime_dir() };
        let already_owned = self
            .state_manager
            .get_state(&part.name, step)
            .map(|s| s.common().files.clone())
            .unwrap_or_default();

        let other_states = self.state_manager.load_all_states(step, sorted_parts);
        let other_owners: std::collections::HashMap<String, String> = other_states
            .iter()
            .filter(|(name, _)| **name != part.name)
            .flat_map(|(name, s)| s.common().files.iter().map(move |f| (f.clone(), name.clone())))
            .collect();

        let migrated = match part.spec.scriptlet(step) {
            Some(script) => {
                step_handler::run_scriptlet(script, &shared_dir, &part.name, step.as_str())?;
                migration::MigratedSet::default()
            }
            None => migration::migrate_tree(&part.install_dir(), &shared_dir, &part.name, &already_owned, &other_owners)?,
        };

        let marker_path = self.overlay_marker_path(step);
        let needs_overlay_migration = !marker_path.is_file();
        if needs_overlay_migration && part.has_overlay() {
            let visible = overlay::visible_in_layer(&part.layer_dir(), &shared_dir).unwrap_or_default();
            fs::create_dir_all(marker_path.parent().unwrap())?;
            let record = serde_json::to_string_pretty(&visible.iter().map(|p| p.to_string_lossy().to_string()).collect::<Vec<_>>())
                .map_err(|e| PartsError::SerializationError(e.to_string()))?;
            fs::write(&marker_path, record)?;
        }

        let mut common = CommonState::new(part.spec.marshal(), project_options.clone());
        common.files = migrated.files;
        common.directories = migrated.directories;
        common.overlay_hash = plan_overlay_hash.map(str::to_string);
        Ok(match step {
            Step::Stage => StepState::Stage(StageState { common }),
            Step::Prime => StepState::Prime(PrimeState { common }),
            _ => unreachable!(),
        })
    }

    // ---- Update paths -----------------------------------------------------

    pub fn update_pull(&self, part: &Part) -> Result<(), PartsError> {
        if let Some(script) = part.spec.scriptlet(Step::Pull) {
            return step_handler::run_scriptlet(script, &part.src_dir(), &part.name, "update-pull");
        }
        if let Some(handler) = sources::resolve(part.spec.source.as_deref(), part.spec.source_type.as_deref()) {
            let since = self
                .state_manager
                .get_state(&part.name, Step::Pull)
                .map(|s| s.common().timestamp)
                .unwrap_or_else(chrono::Utc::now);
            if handler.check_if_outdated(since)? {
                handler.update(&part.src_dir())?;
            }
        } else {
            warn!("update requested on part {:?} with no source handler", part.name);
        }
        self.state_manager.update_state_timestamp(&part.name, Step::Pull);
        Ok(())
    }

    pub fn update_build(
        &self,
        part: &Part,
        sorted_parts: &[Part],
        project_options: &ProjectOptions,
        plan_overlay_hash: Option<&str>,
    ) -> Result<StepState, PartsError> {
        if let Some(handler) = sources::resolve(part.spec.source.as_deref(), part.spec.source_type.as_deref()) {
            handler.update(&part.build_dir())?;
        }
        let _ = fs::remove_dir_all(part.install_dir());
        self.run_build(part, sorted_parts, project_options, plan_overlay_hash, true)
    }

    /// Never called in practice: the sequencer never escalates an outdated
    /// OVERLAY to UPDATE (see DESIGN.md Open Question decision 1).
    pub fn update_overlay(&self, _part: &Part) -> ! {
        unreachable!("OVERLAY never reaches the UPDATE action path")
    }

    // ---- Cleaning -----------------------------------------------------

    pub fn clean_step(&self, part: &Part, step: Step, sorted_parts: &[Part]) -> Result<(), PartsError> {
        match step {
            Step::Pull => {
                let _ = fs::remove_dir_all(part.src_dir());
                let _ = fs::remove_dir_all(part.packages_dir());
                let _ = fs::remove_dir_all(part.snaps_dir());
            }
            Step::Overlay => {
                let _ = fs::remove_file(part.layer_hash_file());
            }
            Step::Build => {
                let _ = fs::remove_dir_all(part.build_dir());
                let _ = fs::remove_dir_all(part.install_dir());
            }
            Step::Stage | Step::Prime => {
                self.clean_shared_step(part, step, sorted_parts)?;
            }
        }
        Ok(())
    }

    fn clean_shared_step(&self, part: &Part, step: Step, sorted_parts: &[Part]) -> Result<(), PartsError> {
        let shared_dir = if step == Step::Stage { part.stage_dir() } else { part.prime_dir() };
        let Some(own_state) = self.state_manager.get_state(&part.name, step) else {
            return Ok(());
        };

        let other_states = self.state_manager.load_all_states(step, sorted_parts);
        let other_files: Vec<&BTreeSet<String>> = other_states
            .iter()
            .filter(|(name, _)| **name != part.name)
            .map(|(_, s)| &s.common().files)
            .collect();
        let other_dirs: Vec<&BTreeSet<String>> = other_states
            .iter()
            .filter(|(name, _)| **name != part.name)
            .map(|(_, s)| &s.common().directories)
            .collect();

        migration::clean_shared_area(&shared_dir, &own_state.common().files, &own_state.common().directories, &other_files, &other_dirs)?;

        let overlay_parts_with_state: Vec<&Part> = crate::parts::parts_with_overlay(sorted_parts)
            .into_iter()
            .filter(|p| p.name != part.name && self.state_manager.has_step_run(&p.name, step))
            .collect();
        if part.has_overlay() && overlay_parts_with_state.is_empty() {
            let marker_path = self.overlay_marker_path(step);
            let _ = fs::remove_file(&marker_path);
        }
        Ok(())
    }

    // ---- Step execution bookkeeping -----------------------------------

    pub fn run_and_commit_step(&self, part: &Part, step: Step, state: StepState) -> Result<(), PartsError> {
        self.state_manager.set_state(&part.name, step, state);
        self.state_manager.commit_state(&part.name, step)?;
        info!("{}:{} state written", part.name, step);
        Ok(())
    }
}
