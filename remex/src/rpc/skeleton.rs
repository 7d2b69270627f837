use futures::{FutureExt, SinkExt, StreamExt};
use std::{any::Any, io, net::SocketAddr, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LinesCodec};

use super::{
    dispatch::{Args, Dispatch, Verb},
    error::{ErrorKind, RemoteError},
    msg::{Request, Response},
    stub::within,
};
use crate::Cfg;

/// Pause after a failed accept, so that exhausted file descriptors do not cause a busy loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Callee-side listener that dispatches inbound calls to an owner object.
///
/// Each accepted connection carries exactly one request and is handled by its own task.
pub struct Skeleton {
    listener: TcpListener,
    local_addr: SocketAddr,
    cfg: Cfg,
}

impl Skeleton {
    /// Binds the listening socket.
    ///
    /// Connections are queued by the operating system until [serve](Self::serve) or
    /// [spawn](Self::spawn) starts accepting them.
    ///
    /// # Panics
    /// Panics if the configuration is invalid.
    pub async fn bind(addr: impl ToSocketAddrs, cfg: Cfg) -> io::Result<Self> {
        cfg.check();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::debug!("skeleton listening on {}", local_addr);
        Ok(Self { listener, local_addr, cfg })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and dispatches their requests to `owner` forever.
    pub async fn serve<D: Dispatch>(self, owner: Arc<D>) {
        let Self { listener, local_addr, cfg } = self;
        let cfg = Arc::new(cfg);
        let permits = cfg.max_handlers.map(|n| Arc::new(Semaphore::new(n)));

        loop {
            let permit = match &permits {
                Some(permits) => match permits.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let (stream, from) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!("accepting connection on {} failed: {}", local_addr, err);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let owner = owner.clone();
            let cfg = cfg.clone();
            tokio::spawn(async move {
                handle(stream, from, &*owner, &cfg).await;
                drop(permit);
            });
        }
    }

    /// Spawns [serve](Self::serve) onto a new task.
    pub fn spawn<D: Dispatch>(self, owner: Arc<D>) -> Serving {
        let local_addr = self.local_addr;
        Serving { task: tokio::spawn(self.serve(owner)), local_addr }
    }
}

/// Handle to a spawned accept loop.
///
/// Dropping the handle stops accepting connections.
/// Requests that are already being handled run to completion.
#[derive(Debug)]
pub struct Serving {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Serving {
    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the listening socket.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Serving {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reads one request from the connection, executes it and writes back the response.
async fn handle<D: Dispatch>(stream: TcpStream, from: SocketAddr, owner: &D, cfg: &Cfg) {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(cfg.max_line_length));

    let line = match within(cfg.request_timeout, lines.next()).await {
        Some(Some(Ok(line))) => line,
        Some(Some(Err(err))) => {
            log::warn!("receiving request from {} failed: {}", from, err);
            return;
        }
        Some(None) => {
            log::debug!("connection from {} closed without request", from);
            return;
        }
        None => {
            log::warn!("request from {} timed out", from);
            return;
        }
    };
    log::trace!("<- {}: {}", from, &line);

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => execute(owner, request).await,
        Err(err) => {
            log::warn!("malformed request from {}: {}", from, err);
            Response::Error(RemoteError::new(ErrorKind::MalformedRequest, err.to_string()).into_wire())
        }
    };

    let reply = match serde_json::to_string(&response) {
        Ok(reply) => reply,
        Err(err) => {
            log::warn!("encoding response to {} failed: {}", from, err);
            return;
        }
    };
    log::trace!("-> {}: {}", from, &reply);

    if let Err(err) = lines.send(reply).await {
        log::warn!("sending response to {} failed: {}", from, err);
    }
}

/// Resolves the verb and invokes it on the owner, converting errors and panics into responses.
async fn execute<D: Dispatch>(owner: &D, request: Request) -> Response {
    let Some(verb) = D::Verb::parse(&request.method) else {
        log::debug!("rejecting unknown method {}", &request.method);
        return Response::Error(RemoteError::unknown_method(&request.method).into_wire());
    };

    let args = Args::new(verb.name(), request.args);
    match AssertUnwindSafe(owner.invoke(verb, args)).catch_unwind().await {
        Ok(Ok(value)) => Response::Result(value),
        Ok(Err(err)) => {
            log::debug!("method {} failed: {}", verb.name(), &err);
            Response::Error(err.into_wire())
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            log::error!("method {} panicked: {}", verb.name(), &message);
            Response::Error(RemoteError::new(ErrorKind::Panicked, message).into_wire())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
