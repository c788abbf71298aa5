pub mod bucket_access;
pub mod crdt;
pub mod snapshot_store;

pub use bucket_access::BucketAccess;
pub use crdt::{CrdtDoc, CrdtFactory};
pub use snapshot_store::SnapshotStore;
