//! Line server for coordinator connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use bankcoord_common::Result;
use bankcoord_protocol::BranchRequest;

use crate::handler::RequestHandler;

/// Accepts coordinator connections and answers their requests in order.
pub struct BranchServer<H> {
    listener: TcpListener,
    handler: Arc<H>,
}

impl<H> BranchServer<H>
where
    H: RequestHandler + 'static,
{
    /// Bind to `addr`.
    pub async fn bind(addr: &str, handler: Arc<H>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until the listener fails.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Branch listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let _ = stream.set_nodelay(true);
            info!(peer = %peer, "Coordinator connected");

            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    error!(peer = %peer, error = %e, "Connection failed");
                }
                info!(peer = %peer, "Coordinator disconnected");
            });
        }
    }
}

/// Answer each request line of one connection.
pub async fn handle_connection<S, H>(stream: S, handler: Arc<H>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: RequestHandler + ?Sized,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: BranchRequest = match line.parse() {
            Ok(request) => request,
            Err(e) => {
                warn!(line = %line, error = %e, "Ignoring malformed request");
                continue;
            }
        };
        debug!(request = %request, "Request received");

        let reply = handler.handle(request).await;
        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
