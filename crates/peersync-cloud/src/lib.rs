//! S3-compatible object store coordination backend.
//!
//! Peers coordinate through marker objects in the store: a candidate leader
//! marker is uploaded, a settle interval passes, and the instance whose
//! marker sorts earliest by (timestamp, instance id) wins. Markers past the
//! staleness bound are deleted by any observer, so a crashed leader never
//! wedges the system. The shared snapshot is a single object; PUT is atomic
//! at the key level, so readers never observe a partial snapshot.

mod backend;

pub use backend::CloudObjectBackend;
