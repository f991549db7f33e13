//! Verification of untrusted submissions in throwaway sandboxes.
//!
//! A submission goes through [`lang`] dispatch, is run by the
//! [`runner::Executor`] inside an [`runner::IsolationProvider`], gets a
//! [`verdict::Verdict`] from the evaluator, and is driven through all of that
//! in the background by the [`scheduler::Scheduler`].

pub mod config;
pub mod err;
pub mod lang;
pub mod runner;
pub mod scheduler;
pub mod util;
pub mod verdict;

#[cfg(test)]
mod test;
