use std::io;
use thiserror::Error;

/// Errors returned by teonet operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No answer arrived within the configured window.
    #[error("timeout")]
    Timeout,

    /// The rendezvous server returned a public key different from ours.
    #[error("incorrect public key")]
    IncorrectPublicKey,

    /// The client presented a server key that does not belong to this server.
    #[error("incorrect server key")]
    IncorrectServerKey,

    #[error("does not connected to teonet")]
    NotConnectedToTeonet,

    #[error("peer {0} is not connected")]
    NotConnected(String),

    #[error("no rendezvous server address")]
    NoAuthServer,

    #[error("teonet is closed")]
    Closed,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Error reported by the remote side, surfaced verbatim.
    #[error("{0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Map an error string received from the wire back to a typed error when
    /// it names one of ours.
    pub(crate) fn from_remote(err: &str) -> Self {
        if err == Error::IncorrectServerKey.to_string() {
            Error::IncorrectServerKey
        } else if err == Error::IncorrectPublicKey.to_string() {
            Error::IncorrectPublicKey
        } else {
            Error::Server(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_remote() {
        assert!(matches!(
            Error::from_remote("incorrect server key"),
            Error::IncorrectServerKey
        ));
        match Error::from_remote("peer abc is not connected") {
            Error::Server(s) => assert_eq!(s, "peer abc is not connected"),
            e => panic!("unexpected {:?}", e),
        }
    }
}
