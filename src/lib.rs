//! flowforge: process orchestration and dataset persistence engine.
//!
//! Drives configurable multi-stage pipelines whose jobs execute on external
//! worker services, tracks their lifecycle through an asynchronous callback
//! protocol, and persists the tabular datasets the jobs produce, each with
//! its own dynamically created table, seeded hold-out splitting and
//! filtered, paginated export.
//!
//! The crate is embedded by a serving layer that owns routing and
//! authentication; the [`engine::PipelineExecutionService`] is the API
//! surface it drives.

pub mod cli;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod registry;
pub mod storage;
pub mod worker;
