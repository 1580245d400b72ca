use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplex byte stream to an agent: a local child's stdio or a remote exec
/// channel. The client reads frames from `reader` and writes to `writer`.
pub struct AgentTransport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl AgentTransport {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// In-memory transport pair. The second half plays the agent.
    pub fn pair(max_buf_size: usize) -> (Self, tokio::io::DuplexStream) {
        let (client, agent) = tokio::io::duplex(max_buf_size);
        let (read, write) = tokio::io::split(client);
        (Self::new(read, write), agent)
    }
}

impl std::fmt::Debug for AgentTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AgentTransport")
    }
}
