//! Retrieval-grounded SQL generation for telecom commission SRFs.
//!
//! A service request form (SRF) is matched against stored request/SQL
//! examples, turned into structured metadata and per-step SQL by a text
//! generator, validated, and compiled into one script with a report.

pub mod cli;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod feedback;
pub mod lm;
pub mod output;
pub mod retrieval;
pub mod store;
pub mod util;
pub mod workflow;
