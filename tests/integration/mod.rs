//! Integration test suite for the orchestrator.
//!
//! These tests drive [`maestro::orchestration::Orchestrator`] end to end
//! with the in-memory workspace manager and scripted executors, so they
//! need neither a git repository nor an external agent.
//!
//! # Test Categories
//!
//! - `levels`: level ordering, bounded parallelism, blocking
//! - `locks`: resource lock serialization
//! - `recovery`: offline workers, cancellation, timeouts, escalation
//! - `convergence`: goal-tracked tasks
//! - `merging`: merge serialization and conflict retries
//! - `reporting`: persisted batch reports

mod fixtures;

mod convergence;
mod levels;
mod locks;
mod merging;
mod recovery;
mod reporting;
