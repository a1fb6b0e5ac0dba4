use std::io;

/// Errors surfaced by the library. The verdict hot path never returns these
/// upward; parse and buffer failures degrade to an unmodified ACCEPT.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("buffer too short for {0}")]
    ShortBuffer(&'static str),

    #[error("raw send failed: {0}")]
    RawSend(#[source] io::Error),

    #[error("cannot bind netfilter queue {queue}: {source}")]
    QueueBind { queue: u16, source: io::Error },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("capture write failed: {0}")]
    CaptureIo(#[source] io::Error),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
