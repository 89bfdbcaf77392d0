//! Per-(part, step) persisted state records (§3 "StepState", §6 "State file
//! layout").
//!
//! Each step has its own concrete state shape sharing a common set of
//! fields. Rather than modeling this as a class hierarchy (the original's
//! approach), it's a single tagged enum with one variant per step; the
//! "capability set" {`marshal`, `unmarshal`, `properties_of_interest`,
//! `diff`} called for in spec §9 is implemented as methods on the enum and
//! on the per-step property list.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ProjectOptions;
use crate::parts::PartSpec;
use crate::steps::Step;

/// Fields common to every step's state record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommonState {
    #[serde(rename = "part-properties")]
    pub part_properties: serde_json::Value,
    #[serde(rename = "project-options")]
    pub project_options: ProjectOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub files: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub directories: BTreeSet<String>,
    #[serde(rename = "overlay-hash", default, skip_serializing_if = "Option::is_none")]
    pub overlay_hash: Option<String>,
    /// Logical timestamp used for outdatedness comparisons (§4.1). Real
    /// filesystem mtimes are coarse and platform-dependent; the engine
    /// instead stamps this field whenever the record is written or touched,
    /// giving outdatedness checks sub-second, deterministic precision.
    pub timestamp: DateTime<Utc>,
}

impl CommonState {
    pub fn new(part_properties: serde_json::Value, project_options: ProjectOptions) -> Self {
        CommonState {
            part_properties,
            project_options,
            assets: None,
            files: BTreeSet::new(),
            directories: BTreeSet::new(),
            overlay_hash: None,
            timestamp: Utc::now(),
        }
    }
}

macro_rules! step_state_struct {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        pub struct $name {
            #[serde(flatten)]
            pub common: CommonState,
        }

        impl $name {
            pub fn new(part_properties: serde_json::Value, project_options: ProjectOptions) -> Self {
                $name {
                    common: CommonState::new(part_properties, project_options),
                }
            }
        }
    };
}

step_state_struct!(PullState);
step_state_struct!(OverlayState);
step_state_struct!(BuildState);
step_state_struct!(StageState);
step_state_struct!(PrimeState);

/// A tagged union over the five concrete state shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum StepState {
    Pull(PullState),
    Overlay(OverlayState),
    Build(BuildState),
    Stage(StageState),
    Prime(PrimeState),
}

impl StepState {
    pub fn step(&self) -> Step {
        match self {
            StepState::Pull(_) => Step::Pull,
            StepState::Overlay(_) => Step::Overlay,
            StepState::Build(_) => Step::Build,
            StepState::Stage(_) => Step::Stage,
            StepState::Prime(_) => Step::Prime,
        }
    }

    pub fn common(&self) -> &CommonState {
        match self {
            StepState::Pull(s) => &s.common,
            StepState::Overlay(s) => &s.common,
            StepState::Build(s) => &s.common,
            StepState::Stage(s) => &s.common,
            StepState::Prime(s) => &s.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonState {
        match self {
            StepState::Pull(s) => &mut s.common,
            StepState::Overlay(s) => &mut s.common,
            StepState::Build(s) => &mut s.common,
            StepState::Stage(s) => &mut s.common,
            StepState::Prime(s) => &mut s.common,
        }
    }

    /// Serialize to the JSON document persisted at
    /// `<work>/parts/<part>/state/<step>` (§6).
    pub fn marshal(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("StepState always serializes")
    }

    pub fn unmarshal(value: &serde_json::Value) -> Result<Self, crate::errors::PartsError> {
        serde_json::from_value(value.clone())
            .map_err(|e| crate::errors::PartsError::SerializationError(e.to_string()))
    }
}

/// A named property, and how to extract its current value from a `PartSpec`,
/// for dirtiness comparison. The name is the human label used in dirty-report
/// reasons (e.g. `'source' property changed`), which is not always identical
/// to the struct field name — see DESIGN.md on the `overlay-script` /
/// `override-overlay` naming reconciliation.
pub struct PropertyOfInterest {
    pub name: &'static str,
    pub extract: fn(&PartSpec) -> serde_json::Value,
}

fn of(name: &'static str, extract: fn(&PartSpec) -> serde_json::Value) -> PropertyOfInterest {
    PropertyOfInterest { name, extract }
}

/// The properties of interest for `step`, in the order dirtiness checks
/// should consider them (first differing field wins, per spec §9).
pub fn properties_of_interest(step: Step) -> Vec<PropertyOfInterest> {
    match step {
        Step::Pull => vec![
            of("source", |s| serde_json::json!(s.source)),
            of("source-type", |s| serde_json::json!(s.source_type)),
            of("override-pull", |s| serde_json::json!(s.override_pull)),
            of("stage-packages", |s| serde_json::json!(s.stage_packages)),
            of("stage-snaps", |s| serde_json::json!(s.stage_snaps)),
        ],
        Step::Overlay => vec![
            of("override-overlay", |s| serde_json::json!(s.overlay_script)),
            of("overlay-packages", |s| serde_json::json!(s.overlay_packages)),
            of("overlay-files", |s| serde_json::json!(s.overlay_files)),
        ],
        Step::Build => vec![
            of("override-build", |s| serde_json::json!(s.override_build)),
            of("build-packages", |s| serde_json::json!(s.build_packages)),
            of("stage-packages", |s| serde_json::json!(s.stage_packages)),
        ],
        Step::Stage => vec![
            of("override-stage", |s| serde_json::json!(s.override_stage)),
            of("organize", |s| {
                serde_json::to_value(&s.organize.0).unwrap_or(serde_json::Value::Null)
            }),
        ],
        Step::Prime => vec![of("override-prime", |s| serde_json::json!(s.override_prime))],
    }
}

/// Compare `current` against the spec captured in `persisted`'s state,
/// returning the name of the first property of interest that differs.
pub fn first_differing_property(
    step: Step,
    current: &PartSpec,
    persisted_properties: &serde_json::Value,
) -> Option<&'static str> {
    let persisted_spec: PartSpec = serde_json::from_value(persisted_properties.clone()).ok()?;
    for prop in properties_of_interest(step) {
        if (prop.extract)(current) != (prop.extract)(&persisted_spec) {
            return Some(prop.name);
        }
    }
    None
}
