//! Wire protocol and socket fabrics of the replication engine
//!
//! Two fabrics carry [`protocol::RawFrame`]s:
//!
//! - the **network fabric**, a TCP endpoint each broker binds, which remote
//!   Senders connect to;
//! - the **local fabric**, a Unix socket each broker binds, which local
//!   Receivers and task submitters connect to.
//!
//! Both are multi-peer: every frame names the session address it belongs to,
//! so one socket can multiplex many concurrent transfers.

use anyhow::Context;
use tracing::instrument;

pub mod protocol;
pub mod streams;

/// Binds the network fabric.
#[instrument]
pub async fn bind_network(addr: std::net::SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind network fabric on {addr}"))?;
    tracing::info!(
        "Network fabric listening on {}",
        listener.local_addr().map_or_else(|_| addr.to_string(), |a| a.to_string())
    );
    Ok(listener)
}

/// Splits an accepted or connected TCP stream into framed halves.
pub fn network_streams(
    stream: tokio::net::TcpStream,
) -> anyhow::Result<(streams::NetworkSendStream, streams::NetworkRecvStream)> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        streams::SendStream::new(write_half),
        streams::RecvStream::new(read_half),
    ))
}

/// Connects to a remote broker's network fabric, bounded by `timeout`.
#[instrument]
pub async fn connect_network(
    addr: std::net::SocketAddr,
    timeout: std::time::Duration,
) -> anyhow::Result<(streams::NetworkSendStream, streams::NetworkRecvStream)> {
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .with_context(|| format!("timeout connecting to {addr}"))?
        .with_context(|| format!("failed to connect to {addr}"))?;
    network_streams(stream)
}

/// Binds the local fabric, replacing a stale socket left behind by a previous broker.
#[instrument]
pub fn bind_local(path: &std::path::Path) -> anyhow::Result<tokio::net::UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {parent:?}"))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed stale socket {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove stale socket {path:?}")),
    }
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind local fabric on {path:?}"))?;
    tracing::info!("Local fabric listening on {:?}", path);
    Ok(listener)
}

pub fn local_streams(
    stream: tokio::net::UnixStream,
) -> (streams::LocalSendStream, streams::LocalRecvStream) {
    let (read_half, write_half) = stream.into_split();
    (
        streams::SendStream::new(write_half),
        streams::RecvStream::new(read_half),
    )
}

/// Connects to the local broker's fabric, bounded by `timeout`.
#[instrument]
pub async fn connect_local(
    path: &std::path::Path,
    timeout: std::time::Duration,
) -> anyhow::Result<(streams::LocalSendStream, streams::LocalRecvStream)> {
    let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
        .await
        .with_context(|| format!("timeout connecting to local fabric {path:?}"))?
        .with_context(|| format!("failed to connect to local fabric {path:?}"))?;
    Ok(local_streams(stream))
}

/// Submits `new-send` for `replica_id` to the local broker and returns its verdict.
///
/// This is the call the external scheduler makes when a task is due.
#[instrument]
pub async fn request_send(
    path: &std::path::Path,
    replica_id: u64,
    timeout: std::time::Duration,
) -> anyhow::Result<Result<String, String>> {
    let (mut send, mut recv) = connect_local(path, timeout).await?;
    let address = format!("submit-{}-{}", std::process::id(), replica_id);
    send.send(&address, &protocol::Message::NewSend(replica_id))
        .await?;
    match recv.recv_timeout(timeout).await? {
        Some((_, protocol::Message::Success(message))) => Ok(Ok(message)),
        Some((_, protocol::Message::Error(message))) => Ok(Err(message)),
        Some((_, other)) => Err(anyhow::anyhow!(
            "unexpected reply to new-send: {}",
            other.command()
        )),
        None => Err(anyhow::anyhow!("broker closed the connection without replying")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_fabric_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run").join("broker.sock");
        let listener = bind_local(&path)?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (mut send, mut recv) = local_streams(stream);
            let (address, message) = recv.recv().await?.unwrap();
            assert_eq!(message, protocol::Message::NewSend(3));
            send.send(&address, &protocol::Message::Success("started".into()))
                .await?;
            anyhow::Ok(())
        });
        let reply = request_send(&path, 3, std::time::Duration::from_secs(5)).await?;
        assert_eq!(reply, Ok("started".to_string()));
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broker.sock");
        std::fs::write(&path, b"stale")?;
        let _listener = bind_local(&path)?;
        Ok(())
    }

    #[tokio::test]
    async fn connect_network_times_out_or_fails() {
        // nothing listens on port 9 of the loopback interface
        let addr: std::net::SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(
            connect_network(addr, std::time::Duration::from_millis(200))
                .await
                .is_err()
        );
    }
}
