//! Error kinds shared by the resource graph and the request handler.
//!
//! Handlers never bubble these to the transport; they are folded into the
//! `Result { has_error, error, message }` payload of every reply, with the
//! error text carried verbatim and the handler supplying the context line.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no ID given")]
    NoIdGiven,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists")]
    AlreadyExists,
    #[error("unknown type found")]
    UnknownType,
    /// The payload is the offending field name; the display text stays
    /// constant so clients can match on it.
    #[error("unknown field")]
    UnknownField(String),
    #[error("no path given")]
    NoPathGiven,
    #[error("key length for ecdsa must be one of 224, 256, 384 or 521")]
    WrongKeyLength,
    #[error("key length must be between 1024 and 32768")]
    LengthOutOfBounds,
    #[error("ed25519 keys only support 256 length")]
    WrongKeyLengthEd25519,
    #[error("length must not be smaller than 1")]
    LengthTooSmall,
    #[error("serial range is exhausted")]
    SerialExhausted,
    #[error("resource is still referenced by {0}")]
    ResourceInUse(String),
    #[error("resource '{0}' would depend on itself")]
    DependencyCycle(String),
    #[error("a location cannot be used as a dependency")]
    LocationDependency,
    #[error("letsencrypt CAs cannot sign locally")]
    UnsupportedCa,
    #[error("certificate sign request has an invalid signature")]
    BadRequestSignature,
    #[error("duration is out of range")]
    InvalidDuration,
    #[error("command '{command}' failed: {status}")]
    HookFailed { command: String, status: String },
    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}
