pub mod error;
pub mod keys;

pub use error::SyncError;
pub use keys::{BucketId, DocumentKey, Origin};
