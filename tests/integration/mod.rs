//! Integration test suite for conductor.
//!
//! These tests drive whole workflows through the orchestrator with scripted
//! executors and check the state machine, context store and retry
//! controller together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `retry_escalation`: Validation retries and escalation
//! - `rollback`: Phase rejection, rollback budget and abandonment
//! - `context_store`: Dependency tracking and ordered context reads
//! - `recovery`: Persistence, restart and resume
//! - `concurrency`: Parallel dispatch, abort and binding reloads
//!
//! # CI Compatibility
//!
//! Executors are in-process scripts; the only external programs used are
//! standard Unix tools in the command executor tests.

mod fixtures;

mod context_store;
mod retry_escalation;
mod workflow_e2e;
