use serde_json::Value;
use std::{error::Error, fmt, io};

use super::msg::{Address, WireError};

/// Kind of an application error raised by a remote method.
///
/// The set is closed: a name that is not recognized maps to [ErrorKind::Other],
/// which keeps the received name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The owner does not expose the requested method.
    UnknownMethod,
    /// Arguments are missing or have the wrong type.
    InvalidArguments,
    /// The request line could not be parsed.
    MalformedRequest,
    /// The method referenced a peer that is not registered.
    UnknownPeer,
    /// The name service rejected an unregistration.
    NotRegistered,
    /// The distributed lock protocol was violated.
    LockMisuse,
    /// The fortune database failed.
    Database,
    /// The method panicked.
    Panicked,
    /// Any other error name.
    Other(String),
}

impl ErrorKind {
    /// Name transmitted on the wire.
    pub fn name(&self) -> &str {
        match self {
            Self::UnknownMethod => "UnknownMethod",
            Self::InvalidArguments => "InvalidArguments",
            Self::MalformedRequest => "MalformedRequest",
            Self::UnknownPeer => "UnknownPeer",
            Self::NotRegistered => "NotRegistered",
            Self::LockMisuse => "LockMisuse",
            Self::Database => "Database",
            Self::Panicked => "Panicked",
            Self::Other(name) => name.as_str(),
        }
    }

    /// Looks up the kind for a received name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "UnknownMethod" => Self::UnknownMethod,
            "InvalidArguments" => Self::InvalidArguments,
            "MalformedRequest" => Self::MalformedRequest,
            "UnknownPeer" => Self::UnknownPeer,
            "NotRegistered" => Self::NotRegistered,
            "LockMisuse" => Self::LockMisuse,
            "Database" => Self::Database,
            "Panicked" => Self::Panicked,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An application error raised by a remote method.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
    /// Additional values describing the error.
    pub payload: Vec<Value>,
}

impl RemoteError {
    /// Creates a new remote error without payload.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), payload: Vec::new() }
    }

    /// Attaches a payload value.
    pub fn with_payload(mut self, value: impl Into<Value>) -> Self {
        self.payload.push(value.into());
        self
    }

    pub(crate) fn unknown_method(method: &str) -> Self {
        Self::new(ErrorKind::UnknownMethod, format!("no method named '{method}'")).with_payload(method)
    }

    pub(crate) fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    /// Converts into the transmitted form.
    ///
    /// The message is sent as the first argument, followed by the payload.
    pub fn into_wire(self) -> WireError {
        let mut args = Vec::with_capacity(self.payload.len() + 1);
        args.push(Value::String(self.message));
        args.extend(self.payload);
        WireError { name: self.kind.name().to_string(), args }
    }

    /// Reconstructs from the transmitted form.
    ///
    /// If the first argument is not a string, the message is empty and all arguments
    /// become the payload.
    pub fn from_wire(wire: WireError) -> Self {
        let kind = ErrorKind::from_name(&wire.name);
        let mut args = wire.args.into_iter();
        match args.next() {
            Some(Value::String(message)) => Self { kind, message, payload: args.collect() },
            Some(first) => Self { kind, message: String::new(), payload: std::iter::once(first).chain(args).collect() },
            None => Self { kind, message: String::new(), payload: Vec::new() },
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "remote error {}", self.kind)
        } else {
            write!(f, "remote error {}: {}", self.kind, self.message)
        }
    }
}

impl Error for RemoteError {}

/// Phase of a remote call during which the transport failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Establishing the connection.
    Connect,
    /// Writing the request.
    Send,
    /// Waiting for or reading the response.
    ///
    /// The remote method may have been executed.
    Receive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Socket level failure of a remote call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    /// Address of the remote endpoint.
    pub address: Address,
    /// Phase that failed.
    pub stage: Stage,
    /// Kind of the underlying IO error.
    pub kind: io::ErrorKind,
    /// Description of the underlying IO error.
    pub message: String,
}

impl TransportError {
    pub(crate) fn new(address: &Address, stage: Stage, err: io::Error) -> Self {
        Self { address: address.clone(), stage, kind: err.kind(), message: err.to_string() }
    }

    pub(crate) fn timeout(address: &Address, stage: Stage) -> Self {
        Self::new(address, stage, io::Error::new(io::ErrorKind::TimedOut, format!("{stage} timed out")))
    }

    pub(crate) fn closed(address: &Address) -> Self {
        Self::new(
            address,
            Stage::Receive,
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before response"),
        )
    }

    /// Whether the request may have reached the remote endpoint.
    pub fn maybe_delivered(&self) -> bool {
        self.stage == Stage::Receive
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} to {} failed: {}", self.stage, self.address, self.message)
    }
}

impl Error for TransportError {}

/// A request or response line violated the wire protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line is not a valid JSON message of the expected shape.
    Malformed(String),
    /// The line exceeds the configured maximum length.
    LineTooLong,
    /// A result value could not be converted to the expected type.
    UnexpectedResult(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed message: {}", err),
            Self::LineTooLong => write!(f, "line exceeds maximum length"),
            Self::UnexpectedResult(err) => write!(f, "unexpected result: {}", err),
        }
    }
}

impl Error for ProtocolError {}

/// A remote call failed.
#[derive(Clone, Debug, PartialEq)]
pub enum CallError {
    /// The remote endpoint could not be reached.
    Transport(TransportError),
    /// The remote method raised an error.
    Remote(RemoteError),
    /// The exchange violated the wire protocol.
    Protocol(ProtocolError),
}

impl CallError {
    /// Whether the remote endpoint should be considered unreachable.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The remote application error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {}", err),
            Self::Remote(err) => write!(f, "{}", err),
            Self::Protocol(err) => write!(f, "protocol error: {}", err),
        }
    }
}

impl Error for CallError {}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<RemoteError> for CallError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl From<ProtocolError> for CallError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}
