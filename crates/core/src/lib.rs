#![warn(missing_docs)]

//! # Archflow Core
//!
//! Foundation types shared by every Archflow crate:
//!
//! - [`ExecutionId`] and [`ExecutionKind`] — typed, hierarchical execution
//!   identifiers with parent linkage and tracker-assigned sequencing
//! - [`keys`] — canonical context-path builders (`step.<id>.output`, …)
//!
//! This crate has no async machinery and no engine logic; it exists so the
//! tracker, engine, tooling and broker all agree on identity and path
//! spelling.

pub mod id;
pub mod keys;

pub use id::{ExecutionId, ExecutionKind, IdParseError};
