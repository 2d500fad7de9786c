// src/connection/connector.rs

use crate::core::AnyStream;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Opens the raw stream behind a connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> io::Result<(AnyStream, Option<SocketAddr>)>;
}

/// Dials `host:port` over TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> io::Result<(AnyStream, Option<SocketAddr>)> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok((AnyStream::Tcp(stream), peer))
    }
}
