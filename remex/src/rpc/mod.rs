//! Remote method invocation over line-delimited JSON.
//!
//! A [Stub] is the caller-side proxy of an object living on another peer,
//! a [Skeleton] listens on a socket and dispatches inbound calls to the object
//! it serves.
//!
//! # Wire protocol
//!
//! Every call uses its own TCP connection carrying exactly one request line
//! and one response line, each a UTF-8 JSON object terminated by a newline:
//!
//! ```text
//! -> {"method": "request_token", "args": [12, 3]}
//! <- {"result": null}
//! ```
//!
//! A failing method is answered with
//!
//! ```text
//! <- {"error": {"name": "UnknownPeer", "args": ["no peer with id 3", 3]}}
//! ```
//!
//! where `name` is one of the [ErrorKind] names and `args` holds the message
//! followed by the error payload.
//!
//! # Exposed methods
//!
//! The owner of a skeleton implements [Dispatch] and names its methods through a
//! closed [Verb] enumeration, usually declared using the [verbs](crate::verbs) macro.
//! A request for any other method name is answered with [ErrorKind::UnknownMethod].
//!
//! # Errors
//!
//! A failing call reports exactly one of
//!
//!   * [CallError::Transport] when the remote endpoint could not be reached, the connection
//!     broke or timed out,
//!   * [CallError::Remote] when the remote method returned an error,
//!   * [CallError::Protocol] when a line could not be parsed.
//!

mod dispatch;
mod error;
mod msg;
mod skeleton;
mod stub;

pub use dispatch::{reply, Args, Dispatch, Verb};
pub use error::{CallError, ErrorKind, ProtocolError, RemoteError, Stage, TransportError};
pub use msg::{Address, Request, Response, WireError};
pub use skeleton::{Serving, Skeleton};
pub use stub::Stub;
