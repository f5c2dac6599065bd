use std::io;
use std::net::SocketAddrV4;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("spawn event loop thread {name} failed: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl NetError {
    pub fn bind(addr: SocketAddrV4, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    pub fn spawn<S: ToString>(name: S, source: io::Error) -> Self {
        Self::Spawn { name: name.to_string(), source }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
