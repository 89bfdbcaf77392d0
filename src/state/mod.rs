//! Persisted per-(part, step) state: the records the Sequencer reads to
//! decide dirtiness/outdatedness (§4.1), and the manager that loads, caches,
//! and commits them.

pub mod manager;
pub mod states;
