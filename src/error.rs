//! Error types for ddm-bridge

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// ddm-bridge error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Bridge daemon answered FAIL
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Bridge daemon answered neither OKAY nor FAIL
    #[error("Unexpected response: {0:?}")]
    UnexpectedResponse(String),

    /// 4-hex-digit length prefix could not be parsed
    #[error("Malformed length prefix: {0:?}")]
    MalformedLength(String),

    /// Remote side did not echo the JDWP handshake
    #[error("JDWP handshake failed")]
    HandshakeFailed,

    /// Outer JDWP packet is malformed
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Payload is shorter than the field being read
    #[error("Buffer underflow: need {needed} bytes at offset {offset}, {available} available")]
    Underflow {
        /// Bytes required by the read
        needed: usize,
        /// Read position
        offset: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Chunk payload violates its layout
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// No handler registered for a chunk tag
    #[error("Unknown chunk type: {0}")]
    UnknownChunk(String),

    /// String table index out of range
    #[error("String index {index} out of range for {table} table ({len} entries)")]
    StringIndex {
        /// Table name
        table: &'static str,
        /// Offending index
        index: usize,
        /// Table length
        len: usize,
    },

    /// Native heap header with an unknown version
    #[error("Unsupported native heap header version: {0}")]
    UnsupportedVersion(u16),

    /// Native heap header with an unknown pointer width
    #[error("Unsupported pointer size: {0}")]
    UnsupportedPointerSize(u16),

    /// Debugger port pool is exhausted
    #[error("No debugger port available")]
    NoDebuggerPort,

    /// Client session is gone
    #[error("Client {0} is not connected")]
    ClientClosed(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Worker thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
