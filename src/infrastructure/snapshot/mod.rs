mod fs;
mod memory;
mod s3;

pub use fs::FsSnapshotStore;
pub use memory::MemorySnapshotStore;
pub use s3::S3SnapshotStore;
