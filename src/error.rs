use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Failure taxonomy for a casting run.
///
/// Every variant is terminal for the current run: each reflects either a
/// configuration problem or an environment this tool cannot repair, so none
/// of them is retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The mDNS discovery transport could not be opened at all, e.g. no
    /// multicast-capable interface.
    #[error("mDNS discovery unavailable: {0}")]
    NetworkUnavailable(#[source] anyhow::Error),

    /// Discovery finished without seeing a matching device.
    #[error("no cast device found within {timeout:?}")]
    NotFound { timeout: Duration },

    /// TCP or TLS connection to the device failed.
    #[error("failed to connect to cast device at {addr}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: anyhow::Error,
    },

    /// The device sent a frame with a protocol version we don't speak.
    #[error("cast device speaks an incompatible protocol version")]
    ProtocolMismatch,

    /// The device acknowledged the LOAD request but refused to play the
    /// content. The control channel stays usable after this.
    #[error("cast device rejected media load: {reason}")]
    LoadRejected { reason: String },

    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Unknown file extension (or unfetchable URL scheme). MIME types come
    /// from a fixed mapping; this tool never guesses.
    #[error("cannot determine media type for {input:?}; pass an explicit MIME type to override")]
    UnsupportedFormat { input: String },

    /// No local address reachable by the device could be determined, so a
    /// local file cannot be served to it.
    #[error("cannot determine a local address reachable by the cast device")]
    NetworkUnreachable(#[source] std::io::Error),

    /// The control channel broke mid-session.
    #[error("control channel to cast device lost")]
    TransportLost(#[source] anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Process exit code for this failure kind. Distinct per variant so
    /// scripts can tell the failure modes apart.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NetworkUnavailable(_) => 10,
            Error::NotFound { .. } => 11,
            Error::ConnectFailed { .. } => 12,
            Error::ProtocolMismatch => 13,
            Error::LoadRejected { .. } => 14,
            Error::FileNotFound { .. } => 15,
            Error::UnsupportedFormat { .. } => 16,
            Error::NetworkUnreachable(_) => 17,
            Error::TransportLost(_) => 18,
            Error::Internal(_) => 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_are_nonzero_and_distinct() {
        let errs = [
            Error::NetworkUnavailable(anyhow::anyhow!("x")),
            Error::NotFound { timeout: Duration::from_secs(3) },
            Error::ConnectFailed {
                addr: "192.168.1.40:8009".parse().unwrap(),
                source: anyhow::anyhow!("refused"),
            },
            Error::ProtocolMismatch,
            Error::LoadRejected { reason: "LOAD_FAILED".into() },
            Error::FileNotFound { path: "/no/such/file.mp4".into() },
            Error::UnsupportedFormat { input: "movie.xyz".into() },
            Error::NetworkUnreachable(std::io::Error::other("x")),
            Error::TransportLost(anyhow::anyhow!("x")),
            Error::Internal(anyhow::anyhow!("x")),
        ];

        let mut codes: Vec<u8> = errs.iter().map(Error::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }
}
