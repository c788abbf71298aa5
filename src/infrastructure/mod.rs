pub mod access;
pub mod crdt;
pub mod realtime;
pub mod snapshot;
