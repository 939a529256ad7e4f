//! Error types for zkwire.

use thiserror::Error;

/// Server error codes as they appear on the wire.
pub mod code {
    pub const OK: i32 = 0;
    pub const SYSTEM_ERROR: i32 = -1;
    pub const RUNTIME_INCONSISTENCY: i32 = -2;
    pub const DATA_INCONSISTENCY: i32 = -3;
    pub const CONNECTION_LOSS: i32 = -4;
    pub const MARSHALLING_ERROR: i32 = -5;
    pub const UNIMPLEMENTED: i32 = -6;
    pub const OPERATION_TIMEOUT: i32 = -7;
    pub const BAD_ARGUMENTS: i32 = -8;
    pub const API_ERROR: i32 = -100;
    pub const NO_NODE: i32 = -101;
    pub const NO_AUTH: i32 = -102;
    pub const BAD_VERSION: i32 = -103;
    pub const NO_CHILDREN_FOR_EPHEMERALS: i32 = -108;
    pub const NODE_EXISTS: i32 = -110;
    pub const NOT_EMPTY: i32 = -111;
    pub const SESSION_EXPIRED: i32 = -112;
    pub const INVALID_ACL: i32 = -114;
    pub const AUTH_FAILED: i32 = -115;
    pub const INVALID_CALLBACK: i32 = -116;
    pub const SESSION_MOVED: i32 = -118;
}

/// Deterministic decode failure for malformed wire input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before the record was complete.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// A length prefix was negative (and not the reserved -1 null marker).
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    /// A frame announced a length above the configured maximum.
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    /// A string field did not hold valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Main error type for all zkwire operations.
///
/// Failures that belong to a single operation carry the client path the
/// caller passed in (pre-chroot), so callers can match on the kind and
/// report the path without re-threading context.
#[derive(Debug, Error)]
pub enum ZkError {
    /// I/O error on the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A client path failed validation before anything was sent.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The server sent bytes that do not decode as the expected record.
    #[error("malformed server payload: {0}")]
    Decode(#[from] DecodeError),

    /// The connection dropped while the operation was in flight, or the
    /// session is not currently connected.
    #[error("connection to the server was lost")]
    ConnectionLoss { path: Option<String> },

    /// The per-operation deadline elapsed before a response arrived.
    #[error("operation timed out")]
    OperationTimeout { path: Option<String> },

    /// The server declared this session expired. Session-fatal.
    #[error("session expired")]
    SessionExpired,

    /// The server rejected the session's authentication. Session-fatal.
    #[error("authentication failed")]
    AuthFailed,

    /// The session moved to another server and this request was stale.
    #[error("session moved")]
    SessionMoved { path: Option<String> },

    /// The node does not exist.
    #[error("no node: {path}")]
    NoNode { path: String },

    /// The caller lacks permission for the operation.
    #[error("not authorized: {path}")]
    NoAuth { path: String },

    /// The request's expected version did not match the node's version.
    #[error("version mismatch: {path}")]
    BadVersion { path: String },

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral nodes may not have children: {path}")]
    NoChildrenForEphemerals { path: String },

    /// The node already exists.
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// The node has children and cannot be deleted.
    #[error("node has children: {path}")]
    NotEmpty { path: String },

    /// The ACL list was rejected by the server.
    #[error("invalid acl: {path}")]
    InvalidAcl { path: String },

    /// The server rejected a callback registration.
    #[error("invalid callback")]
    InvalidCallback { path: Option<String> },

    /// One of the server-side system error codes (the -1..-8 range and
    /// API_ERROR), surfaced as a single bucket.
    #[error("server system error {code}")]
    System { code: i32, path: Option<String> },

    /// An error code this client does not know about.
    #[error("unknown server error {code}")]
    Unknown { code: i32, path: Option<String> },

    /// The client was closed by the caller.
    #[error("client is closed")]
    Closed,
}

impl ZkError {
    /// Translate a non-zero server error code into an error carrying the
    /// operation's original client path.
    pub(crate) fn from_server_code(err: i32, path: Option<&str>) -> ZkError {
        let owned = || path.map(str::to_string);
        let required = || path.unwrap_or_default().to_string();
        match err {
            code::NO_NODE => ZkError::NoNode { path: required() },
            code::NO_AUTH => ZkError::NoAuth { path: required() },
            code::BAD_VERSION => ZkError::BadVersion { path: required() },
            code::NO_CHILDREN_FOR_EPHEMERALS => {
                ZkError::NoChildrenForEphemerals { path: required() }
            }
            code::NODE_EXISTS => ZkError::NodeExists { path: required() },
            code::NOT_EMPTY => ZkError::NotEmpty { path: required() },
            code::INVALID_ACL => ZkError::InvalidAcl { path: required() },
            code::INVALID_CALLBACK => ZkError::InvalidCallback { path: owned() },
            code::SESSION_EXPIRED => ZkError::SessionExpired,
            code::AUTH_FAILED => ZkError::AuthFailed,
            code::SESSION_MOVED => ZkError::SessionMoved { path: owned() },
            c @ code::BAD_ARGUMENTS..=code::SYSTEM_ERROR | c @ code::API_ERROR => ZkError::System {
                code: c,
                path: owned(),
            },
            c => ZkError::Unknown {
                code: c,
                path: owned(),
            },
        }
    }
}

/// Result type alias using ZkError.
pub type Result<T> = std::result::Result<T, ZkError>;
