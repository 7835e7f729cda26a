//! Steward: a supervisor for commands run on behalf of an automation agent.
//!
//! - [`executor`] runs a command, retrying once before reporting a failure.
//! - [`tracker`] counts consecutive failures, escalates at a limit, and
//!   journals a recovery note when a streak ends.
//! - [`timeout`] watches a whole task against a wall-clock budget.
//! - [`journal`] edits the markdown document recovery notes land in.
//! - [`session`] ties one tracker and one enforcer to one logical run.

pub mod config;
pub mod executor;
pub mod journal;
pub mod session;
pub mod timeout;
pub mod tracker;
