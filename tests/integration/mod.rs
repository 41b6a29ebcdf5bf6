//! Integration suite for the orchestration engine.
//!
//! Every test drives real schedulers against a SQLite store in a temporary
//! directory. Providers are scripted fakes except in `agents_e2e`, which
//! runs the bundled agents over small API documents.
//!
//! # Test Categories
//!
//! - `pipeline`: dependency order, retries, soft-fail and fatal stages
//! - `cancellation`: cancelling a project with work in flight
//! - `crash_recovery`: resuming after a scheduler dies mid-dispatch
//! - `shared_store`: several schedulers claiming from one database
//! - `registry`: stage registry validation
//! - `agents_e2e`: bundled agents from API document to generated files

mod fixtures;

mod agents_e2e;
mod cancellation;
mod crash_recovery;
mod pipeline;
mod registry;
mod shared_store;
