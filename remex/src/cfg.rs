//! Transport configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport configuration shared by stubs and skeletons.
///
/// In most cases the default configuration ([Cfg::default]) is fine and should be used.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Cfg {
    /// Time allowed for establishing the connection of a remote call.
    ///
    /// By default this is 5 seconds.
    pub connect_timeout: Option<Duration>,
    /// Time allowed between sending a request and receiving its response.
    ///
    /// An inbound `request_token` may trigger a token handoff on the callee,
    /// so this must cover one nested remote call.
    /// By default this is 30 seconds.
    pub response_timeout: Option<Duration>,
    /// Time a skeleton handler waits for the request line after accepting a connection.
    ///
    /// By default this is 30 seconds.
    pub request_timeout: Option<Duration>,
    /// Maximum length of a request or response line in bytes.
    ///
    /// By default this is 1 MiB.
    /// This must be at least 64 bytes.
    pub max_line_length: usize,
    /// Maximum number of inbound requests handled in parallel by a skeleton.
    ///
    /// `None` spawns one task per accepted connection without limit.
    /// By default this is `None`.
    /// This must not be zero.
    pub max_handlers: Option<usize>,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(5)),
            response_timeout: Some(Duration::from_secs(30)),
            request_timeout: Some(Duration::from_secs(30)),
            max_line_length: 1_048_576,
            max_handlers: None,
        }
    }
}

impl Cfg {
    /// Checks the configuration.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub(crate) fn check(&self) {
        if self.max_line_length < 64 {
            panic!("maximum line length must be at least 64 bytes");
        }

        if self.max_handlers == Some(0) {
            panic!("maximum number of handlers must not be zero");
        }
    }
}
