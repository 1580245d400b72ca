pub mod config;
pub mod documents;
pub mod protocol;
pub mod sandbox;
pub mod storage;

pub use config::Config;
pub use documents::{Document, DocumentSection, PersistentDocumentWriter};
pub use protocol::{AgentProtocolClient, EventStream, ProtocolEvent, SessionState};
pub use sandbox::{SandboxError, SandboxManager, build_manager};
pub use storage::{DirectoryManager, ObjectStore, SnapshotManager};
