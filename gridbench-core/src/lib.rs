#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

//! Execution core of the gridbench distributed load-generation harness.
//!
//! A coordinator dispatches a [`stage::TestStage`] to every participating
//! node. Each stage partitions the cluster-wide thread budget
//! ([`cluster`]), runs a [`fleet::StressorFleet`] of stressors paced by an
//! [`pacing::OperationPacer`] until a [`completion::Completion`] policy
//! fires, and reports a [`stage::Ack`] with its measurement bundles. The
//! coordinator folds all acks through [`record::ClusterAggregator`], which
//! maintains the per-test iteration history and drives the repeat loop.

pub mod cluster;
pub mod completion;
pub mod config;
pub mod error;
pub mod fleet;
pub mod pacing;
pub mod record;
pub mod stage;
pub mod stats;
pub mod stressor;
pub mod telemetry;
