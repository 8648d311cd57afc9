use std::io;

/// Errors returned by muxio's fallible constructors and socket helpers.
///
/// Readiness-path failures (short reads, peer resets, poll interruptions)
/// never surface here; they are handled where they occur and either logged
/// or folded into the connection state machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An address string could not be parsed as an IPv4 endpoint.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// An event loop thread panicked before its loop came up.
    #[error("event loop thread failed to start")]
    LoopStartup,
    /// An underlying socket or fd operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
