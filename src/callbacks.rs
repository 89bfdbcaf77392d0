//! Pre/post-step callbacks (§9 "Callbacks"): process-wide observers the
//! embedding application registers to hook into step execution without the
//! core depending on any particular logging/metrics/UI stack.

use crate::actions::Action;
use crate::parts::Part;

/// Observes a single action immediately before or after the Part Handler
/// runs it. The engine runs strictly single-threaded within a plan (§5), so
/// this trait carries no `Send`/`Sync` bound.
pub trait StepCallback {
    fn on_pre_step(&self, part: &Part, action: &Action);
    fn on_post_step(&self, part: &Part, action: &Action);
}

/// A callback built from two closures, for registrants that don't want to
/// define a type just to implement `StepCallback`.
pub struct FnCallback<Pre, Post> {
    pre: Pre,
    post: Post,
}

impl<Pre, Post> FnCallback<Pre, Post>
where
    Pre: Fn(&Part, &Action),
    Post: Fn(&Part, &Action),
{
    pub fn new(pre: Pre, post: Post) -> Self {
        FnCallback { pre, post }
    }
}

impl<Pre, Post> StepCallback for FnCallback<Pre, Post>
where
    Pre: Fn(&Part, &Action),
    Post: Fn(&Part, &Action),
{
    fn on_pre_step(&self, part: &Part, action: &Action) {
        (self.pre)(part, action)
    }

    fn on_post_step(&self, part: &Part, action: &Action) {
        (self.post)(part, action)
    }
}

/// An ordered list of registered callbacks, invoked in registration order
/// for `pre` and the same order for `post` (the original's `ProjectInfo`
/// callback registry makes no ordering guarantee beyond FIFO, which this
/// preserves).
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Vec<Box<dyn StepCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry { callbacks: Vec::new() }
    }

    pub fn register(&mut self, callback: Box<dyn StepCallback>) {
        self.callbacks.push(callback);
    }

    pub fn run_pre_step(&self, part: &Part, action: &Action) {
        for cb in &self.callbacks {
            cb.on_pre_step(part, action);
        }
    }

    pub fn run_post_step(&self, part: &Part, action: &Action) {
        for cb in &self.callbacks {
            cb.on_post_step(part, action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::PartSpec;
    use crate::steps::Step;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn registered_callback_runs_for_both_pre_and_post() {
        let pre_count = Rc::new(Cell::new(0));
        let post_count = Rc::new(Cell::new(0));
        let pre_clone = pre_count.clone();
        let post_clone = post_count.clone();

        struct Counting {
            pre: Rc<Cell<u32>>,
            post: Rc<Cell<u32>>,
        }
        impl StepCallback for Counting {
            fn on_pre_step(&self, _part: &Part, _action: &Action) {
                self.pre.set(self.pre.get() + 1);
            }
            fn on_post_step(&self, _part: &Part, _action: &Action) {
                self.post.set(self.post.get() + 1);
            }
        }

        let mut registry = CallbackRegistry::new();
        registry.register(Box::new(Counting { pre: pre_clone, post: post_clone }));

        let part = Part::new("p1", PartSpec::nil(None), "/work");
        let action = Action::new("p1", Step::Pull, crate::actions::ActionType::Run, None);
        registry.run_pre_step(&part, &action);
        registry.run_post_step(&part, &action);

        assert_eq!(pre_count.get(), 1);
        assert_eq!(post_count.get(), 1);
    }
}
