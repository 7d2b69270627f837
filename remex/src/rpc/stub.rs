use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, time::Duration};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::{
    error::{CallError, ProtocolError, RemoteError, Stage, TransportError},
    msg::{Address, Request, Response},
};
use crate::Cfg;

/// Caller-side proxy of an object served by a [Skeleton](super::Skeleton).
///
/// Every call opens its own connection, transmits one request line,
/// waits for one response line and closes the connection.
#[derive(Clone, Debug)]
pub struct Stub {
    address: Address,
    cfg: Cfg,
}

impl Stub {
    /// Creates a stub for the object listening on `address`.
    ///
    /// No connection is made until a method is called.
    pub fn new(address: Address, cfg: Cfg) -> Self {
        Self { address, cfg }
    }

    /// Address of the remote object.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Invokes `method` on the remote object.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let request = Request { method: method.to_string(), args };
        let line = serde_json::to_string(&request).map_err(|err| ProtocolError::Malformed(err.to_string()))?;

        let stream = within(self.cfg.connect_timeout, TcpStream::connect((self.address.host.as_str(), self.address.port)))
            .await
            .ok_or_else(|| TransportError::timeout(&self.address, Stage::Connect))?
            .map_err(|err| TransportError::new(&self.address, Stage::Connect, err))?;
        let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(self.cfg.max_line_length));

        log::trace!("-> {}: {}", &self.address, &line);
        lines.send(line).await.map_err(|err| self.codec_error(Stage::Send, err))?;

        let reply = match within(self.cfg.response_timeout, lines.next()).await {
            None => return Err(TransportError::timeout(&self.address, Stage::Receive).into()),
            Some(None) => return Err(TransportError::closed(&self.address).into()),
            Some(Some(Err(err))) => return Err(self.codec_error(Stage::Receive, err)),
            Some(Some(Ok(reply))) => reply,
        };
        log::trace!("<- {}: {}", &self.address, &reply);

        match serde_json::from_str(&reply).map_err(|err| ProtocolError::Malformed(err.to_string()))? {
            Response::Result(value) => Ok(value),
            Response::Error(wire) => Err(RemoteError::from_wire(wire).into()),
        }
    }

    /// Invokes `method` on the remote object and converts the result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, CallError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|err| ProtocolError::UnexpectedResult(err.to_string()).into())
    }

    fn codec_error(&self, stage: Stage, err: LinesCodecError) -> CallError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong.into(),
            LinesCodecError::Io(err) => TransportError::new(&self.address, stage, err).into(),
        }
    }
}

/// Runs `fut` to completion, giving up after `limit` if one is set.
pub(crate) async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
