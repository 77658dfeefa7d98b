//! Weft task-parallel runtime.
//!
//! Weft schedules fine-grained tasks over a dataflow of events and
//! datablocks. Tasks declare a fixed number of dependence slots; events
//! (single-assignment, latch, finish-latch) fire into those slots, and a
//! two-tier scheduler ships ready tasks from producing workers through a
//! controller back into worker assigned-work piles.
//!
//! # Example
//!
//! ```rust
//! use weft::{Runtime, RuntimeConfig, TaskOptions, WorkerCtx};
//!
//! let rt = Runtime::new(RuntimeConfig {
//!     num_workers: 2,
//!     start_threads: false,
//!     ..RuntimeConfig::default()
//! });
//!
//! let hello = rt.create_template(0, |_ctx, _params, _deps| {
//!     tracing::info!("hello from a task");
//!     None
//! });
//! let handle = rt
//!     .create_task(
//!         WorkerCtx::external(),
//!         hello,
//!         &[],
//!         &[],
//!         TaskOptions { output_event: true, ..TaskOptions::default() },
//!         None,
//!     )
//!     .unwrap();
//!
//! rt.drain().unwrap();
//! let out = handle.output_event.unwrap();
//! assert!(rt.event_get(out).unwrap().is_some());
//! ```

#![doc(html_root_url = "https://docs.rs/weft")]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]

// Public modules
pub mod datablock;
pub mod event;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod task;

// Internal plumbing
pub(crate) mod depend;
mod error;

// Utility modules
pub mod util;

// Re-exports
pub use error::{Result, RuntimeError};
pub use event::{EventKind, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
pub use registry::{Guid, Object, ObjectKind, Payload, Registry};
pub use runtime::{Runtime, RuntimeConfig, RuntimeStats, WorkerCtx};
pub use scheduler::{Tier, WorkerId};
pub use task::{Dep, TaskCtx, TaskHandle, TaskOptions};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
