//! Planned actions: the output of the Sequencer and the input to the Part Handler.

use std::fmt;

use crate::steps::Step;

/// What the executor should do for a given `(part, step)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// The step has never run; run it for the first time.
    Run,
    /// The step ran before but must run again from a clean slate.
    Rerun,
    /// The step ran before and is merely outdated; refresh without a full clean.
    Update,
    /// The step's overlay layer must be remounted because a lower layer
    /// changed, without re-running the step's own script.
    Reapply,
    /// The step already ran and nothing requires it to run again.
    Skip,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Run => "RUN",
            ActionType::Rerun => "RERUN",
            ActionType::Update => "UPDATE",
            ActionType::Reapply => "REAPPLY",
            ActionType::Skip => "SKIP",
        };
        write!(f, "{s}")
    }
}

/// A single planned unit of work: run `step` for `part_name` as `action_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub part_name: String,
    pub step: Step,
    pub action_type: ActionType,
    pub reason: Option<String>,
}

impl Action {
    pub fn new(
        part_name: impl Into<String>,
        step: Step,
        action_type: ActionType,
        reason: Option<impl Into<String>>,
    ) -> Self {
        Action {
            part_name: part_name.into(),
            step,
            action_type,
            reason: reason.map(Into::into),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.part_name, self.step, self.action_type)?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        let a = Action::new("p1", Step::Pull, ActionType::Run, Some("requested step"));
        let b = Action::new("p1", Step::Pull, ActionType::Run, Some("requested step"));
        assert_eq!(a, b);
    }

    #[test]
    fn display_includes_reason_when_present() {
        let a = Action::new("p1", Step::Build, ActionType::Rerun, Some("'source' property changed"));
        assert_eq!(a.to_string(), "p1:build RERUN ('source' property changed)");
    }

    #[test]
    fn display_omits_reason_when_absent() {
        let a: Action = Action::new("p1", Step::Stage, ActionType::Skip, None::<String>);
        assert_eq!(a.to_string(), "p1:stage SKIP");
    }
}
