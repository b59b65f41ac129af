//! The two operations this crate needs from a live connection to the profiled VM.

use crate::loader::LoaderId;

/// Connection to the target process.
///
/// Implementations report failures as `anyhow::Error`. When the target is gone
/// they should put [`TargetTerminated`](crate::error::TargetTerminated) into the
/// error chain so lookups can surface it as a fatal condition.
pub trait TargetClient: Send + Sync {
    /// Class file bytes for each `(names[i], loader_ids[i])` pair, in order. An empty
    /// vector means the VM no longer has that class.
    fn bytes_for(&self, names: &[String], loader_ids: &[LoaderId]) -> anyhow::Result<Vec<Vec<u8>>>;

    /// The loader that actually defined `name` when it is requested through
    /// `loader_id`, or `-1` when the VM does not know.
    fn defining_loader_id(&self, name: &str, loader_id: LoaderId) -> anyhow::Result<LoaderId>;
}
