//! Shared-directory coordination backend.
//!
//! Peers coordinate through a directory on a local or network filesystem:
//! leader election uses a non-blocking OS advisory lock on a well-known lock
//! file, the shared snapshot is published by atomic rename, and stale
//! artifacts from crashed peers are reclaimed with a process-liveness check.

mod backend;

pub use backend::LocalFileBackend;
