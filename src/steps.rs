//! The five lifecycle steps and their total order.
//!
//! A part moves through `PULL -> OVERLAY -> BUILD -> STAGE -> PRIME` in strict
//! order; nothing in the engine ever runs a step out of this sequence for a
//! single part. `previous_steps`/`next_steps` are used by the sequencer to
//! walk the steps below (or above) a target step.

use std::fmt;

/// One stage in a part's build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Pull,
    Overlay,
    Build,
    Stage,
    Prime,
}

/// All steps, in ascending order. Used for iteration and index lookups.
pub const ALL_STEPS: [Step; 5] = [
    Step::Pull,
    Step::Overlay,
    Step::Build,
    Step::Stage,
    Step::Prime,
];

impl Step {
    /// Lowercase name, as used in state file paths and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Pull => "pull",
            Step::Overlay => "overlay",
            Step::Build => "build",
            Step::Stage => "stage",
            Step::Prime => "prime",
        }
    }

    /// The verb form used in action reasons, e.g. "required to build 'foo'".
    pub fn verb(&self) -> &'static str {
        match self {
            Step::Pull => "pull",
            Step::Overlay => "overlay",
            Step::Build => "build",
            Step::Stage => "stage",
            Step::Prime => "prime",
        }
    }

    fn index(&self) -> usize {
        ALL_STEPS.iter().position(|s| s == self).unwrap()
    }

    /// All steps strictly lower than this one, in ascending order.
    pub fn previous_steps(&self) -> Vec<Step> {
        ALL_STEPS[..self.index()].to_vec()
    }

    /// All steps strictly higher than this one, in ascending order.
    pub fn next_steps(&self) -> Vec<Step> {
        ALL_STEPS[self.index() + 1..].to_vec()
    }

    /// The step whose artifacts this step's execution consumes, if any.
    ///
    /// PULL has no prerequisite. OVERLAY depends on the previous part's
    /// OVERLAY (stack consistency, handled separately by the overlay-hash
    /// machinery rather than this function). BUILD depends on its
    /// dependency parts' STAGE. STAGE depends on this same part's BUILD.
    /// PRIME depends on this same part's STAGE.
    pub fn dependency_prerequisite_step(&self) -> Option<Step> {
        match self {
            Step::Pull => None,
            Step::Overlay => None,
            Step::Build => Some(Step::Stage),
            Step::Stage => Some(Step::Build),
            Step::Prime => Some(Step::Stage),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_matches_declaration() {
        assert!(Step::Pull < Step::Overlay);
        assert!(Step::Overlay < Step::Build);
        assert!(Step::Build < Step::Stage);
        assert!(Step::Stage < Step::Prime);
    }

    #[test]
    fn previous_steps_of_prime_is_everything_else() {
        assert_eq!(
            Step::Prime.previous_steps(),
            vec![Step::Pull, Step::Overlay, Step::Build, Step::Stage]
        );
    }

    #[test]
    fn previous_steps_of_pull_is_empty() {
        assert!(Step::Pull.previous_steps().is_empty());
    }

    #[test]
    fn next_steps_of_build_is_stage_and_prime() {
        assert_eq!(Step::Build.next_steps(), vec![Step::Stage, Step::Prime]);
    }

    #[test]
    fn dependency_prerequisite_step_matches_spec_table() {
        assert_eq!(Step::Pull.dependency_prerequisite_step(), None);
        assert_eq!(Step::Overlay.dependency_prerequisite_step(), None);
        assert_eq!(Step::Build.dependency_prerequisite_step(), Some(Step::Stage));
        assert_eq!(Step::Stage.dependency_prerequisite_step(), Some(Step::Build));
        assert_eq!(Step::Prime.dependency_prerequisite_step(), Some(Step::Stage));
    }
}
