use crate::domain::SyncError;

/// One replicated document. Update and state payloads are opaque byte
/// sequences whose application is associative and commutative; nothing above
/// the infrastructure adapter may interpret them.
pub trait CrdtDoc: Send {
    /// Applies one encoded update. A payload that cannot be decoded or
    /// applied leaves the state untouched and reports `MalformedUpdate`.
    fn apply_update(&mut self, update: &[u8]) -> Result<(), SyncError>;

    /// Full state as a single update, suitable for bootstrapping a fresh
    /// replica.
    fn encode_state(&self) -> Vec<u8>;

    /// Materialized text at the current state.
    fn text(&self) -> String;

    /// Replaces the whole text in a single transaction and returns the
    /// update encoding exactly that transaction.
    fn replace_text(&mut self, text: &str) -> Vec<u8>;

    fn is_empty(&self) -> bool;
}

/// Constructor seam keeping the engine CRDT-library agnostic.
pub trait CrdtFactory: Send + Sync {
    fn create(&self) -> Box<dyn CrdtDoc>;

    fn from_state(&self, state: &[u8]) -> Result<Box<dyn CrdtDoc>, SyncError>;
}
