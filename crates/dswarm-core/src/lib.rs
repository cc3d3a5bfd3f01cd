#![forbid(unsafe_code)]

//! Runtime-independent config and identity types shared by the dswarm
//! manager binary and the task-lifecycle engine.

pub mod identity;
pub mod units;

pub use identity::ManagerIdentity;
