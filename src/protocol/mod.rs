pub mod client;
pub mod events;
pub mod frame;
pub mod transport;

pub use client::{AgentProtocolClient, ClientInfo, EventStream, SessionState};
pub use events::{PlanEntry, ProtocolEvent};
pub use transport::AgentTransport;
