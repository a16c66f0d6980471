//! tabsync: bidirectional synchronization between a local record workbook
//! and external record stores through pluggable connectors.
//!
//! Local edits live on a dirty branch of the working store; the main branch
//! mirrors the last confirmed remote state. Publishing diffs the two,
//! classifies changes into create/update/delete buckets, and drives a
//! connector in fixed-size batches with checkpointed, resumable progress.
//! Pulling streams remote records back into the main branch and reconciles
//! remote deletions.

pub mod config;
pub mod connector;
pub mod db;
pub mod diff;
pub mod error;
pub mod job;
pub mod model;
pub mod naming;
pub mod publish;
pub mod pull;
pub mod store;
