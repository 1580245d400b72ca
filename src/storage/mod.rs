//! Tenant path layout, blob storage and workspace snapshots.

pub mod layout;
pub mod object_store;
pub mod snapshot;

pub use layout::DirectoryManager;
pub use object_store::{LocalDiskStore, ObjectStore, S3Store, build_object_store};
pub use snapshot::SnapshotManager;
