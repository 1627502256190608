#![warn(missing_docs)]

//! # Archflow Streaming
//!
//! Per-execution event fan-out:
//!
//! - [`EventStreamEmitter`] — one publisher per execution id, assigning the
//!   strictly monotone per-execution sequence and fanning events out to
//!   bounded subscriber queues
//! - [`StreamingRegistry`] — owns the emitters, enforces the emitter cap
//!   with least-recently-active eviction, and runs the idle reaper
//!
//! A slow subscriber never stalls the engine: when its queue fills, the
//! queue is dropped, the subscriber receives a final overflow error event
//! and is detached.

pub mod emitter;
pub mod registry;

pub use emitter::{EventStreamEmitter, Subscription};
pub use registry::{StreamingConfig, StreamingRegistry};
