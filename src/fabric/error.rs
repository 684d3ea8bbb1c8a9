use std::io;

use thiserror::Error;

pub type Result<T, E = FabricError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("cannot connect to coordinator: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("send failed: {0}")]
    Write(#[from] quinn::WriteError),
    #[error("receive failed: {0}")]
    Read(#[from] quinn::ReadExactError),
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("rank {0} is not reachable from this rank")]
    NoRoute(usize),
    #[error("rank {0} disconnected")]
    Disconnected(usize),
    #[error("malformed message with tag byte {0}")]
    Malformed(u8),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("send was abandoned before it completed")]
    Abandoned,
    #[error("mailbox lock poisoned")]
    Poisoned,
}
