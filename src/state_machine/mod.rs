//! Deterministic application of committed commands.
mod applier;

pub(crate) use applier::Applier;

use std::io;

/// StateMachine is the replicated application. Every replica applies the same commands in the same
/// order, so `apply` must be a pure function of (command, prior state).
pub(crate) trait StateMachine: Send + Sync + 'static {
    /// A point-in-time image of the whole state. Capturing must be cheap; serializing it happens off
    /// the applier task.
    type Image: Send + 'static;

    /// An `InvalidData` error means the command could never be applied on any replica. It is
    /// skipped and the proposer is told so.
    fn apply(&self, command: &[u8]) -> Result<(), io::Error>;

    fn capture(&self) -> Self::Image;

    fn serialize_image(image: &Self::Image) -> Vec<u8>;

    /// Replace the whole state with a serialized image.
    fn restore(&self, data: &[u8]) -> Result<(), io::Error>;
}
