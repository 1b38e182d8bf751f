//! Engine modules: the layer that translates what the operator wants into jobs.
//!
//! The engine sits between the plan file (desired layout) and execution
//! (the job queue). It generates ordered, validated job lists.

pub mod plan;

pub use plan::{build_plan, PlanStep, Plan, PlanError, PlanFile};
