//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications with port-level input bindings
//! - Pipeline builder with validation
//! - The DAG executor
//! - Failure tolerance modes
//! - The subject/session planner

mod builder;
mod dag;
mod failure;
mod planner;
mod spec;


pub use builder::PipelineBuilder;
pub use dag::{GraphExecutionResult, StageGraph};
pub use failure::{FailureCollector, FailureMode, FailureRecord, FailureSummary};
pub use planner::{Planner, PlannerServices, PipelinePlan};
pub use spec::{InputBinding, StageSpec};
