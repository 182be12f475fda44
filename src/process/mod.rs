//! # Process Supervision
//!
//! Worker process lifecycle: spawning with daemon semantics, the shared
//! heartbeat cell the worker writes and the parent reads, and the metadata
//! snapshot the watchdog and the control surface consume.
//!
//! The heartbeat is a small file rewritten by the worker at each progress
//! point. The only contract is that the parent can read the latest value
//! the worker wrote with bounded staleness; a file satisfies it without
//! shared memory or an IPC channel, and survives the parent restarting.

pub mod heartbeat;
pub mod supervisor;

pub use heartbeat::{HeartbeatCell, HEARTBEAT_ENV_VAR};
pub use supervisor::{ProcessMetadata, WorkerProcess};
