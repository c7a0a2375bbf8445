//! Listening side of a process's agent channel.
//!
//! A fresh endpoint is created per launched process and must be listening
//! before the process starts, otherwise the agent's connect races the bind.

use std::io;

use tracing::{debug, trace};

use crate::error::{Result, SessionError};

#[cfg(unix)]
pub type AgentStream = tokio::net::UnixStream;

#[cfg(not(unix))]
pub type AgentStream = tokio::net::TcpStream;

pub struct AgentEndpoint {
    name: String,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(not(unix))]
    listener: tokio::net::TcpListener,
}

impl AgentEndpoint {
    /// Bind a uniquely named endpoint. The name is what the process is told.
    #[cfg(unix)]
    pub async fn bind() -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("hotreload-{}.sock", uuid::Uuid::new_v4()));
        let listener = tokio::net::UnixListener::bind(&path).map_err(SessionError::Endpoint)?;

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms).map_err(SessionError::Endpoint)?;

        let name = path.display().to_string();
        debug!(endpoint = %name, "Agent endpoint listening");
        Ok(Self { name, listener })
    }

    #[cfg(not(unix))]
    pub async fn bind() -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(SessionError::Endpoint)?;
        let name = listener
            .local_addr()
            .map_err(SessionError::Endpoint)?
            .to_string();
        debug!(endpoint = %name, "Agent endpoint listening");
        Ok(Self { name, listener })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the process's agent to connect.
    pub async fn accept(&self) -> io::Result<AgentStream> {
        let (stream, _) = self.listener.accept().await?;
        trace!(endpoint = %self.name, "Agent connected");
        Ok(stream)
    }
}

#[cfg(unix)]
impl Drop for AgentEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.name) {
            trace!(endpoint = %self.name, "Failed to remove endpoint socket: {}", e);
        }
    }
}

/// Connect to an endpoint by name, as an agent inside the target process would.
#[cfg(unix)]
pub async fn connect(name: &str) -> io::Result<AgentStream> {
    tokio::net::UnixStream::connect(name).await
}

#[cfg(not(unix))]
pub async fn connect(name: &str) -> io::Result<AgentStream> {
    tokio::net::TcpStream::connect(name).await
}
