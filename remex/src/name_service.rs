//! Name service: assigns peer ids and lists the peers registered for a type.
//!
//! The directory is kept in memory by a [NameService] served over a [Skeleton].
//! Peers talk to it through a [NameServiceClient].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::SocketAddr,
    sync::Arc,
};
use tokio::{net::ToSocketAddrs, sync::Mutex};
use uuid::Uuid;

use crate::{
    rpc::{reply, Address, Args, CallError, Dispatch, ErrorKind, RemoteError, Serving, Skeleton, Stub, Verb},
    verbs, Cfg, PeerId,
};

verbs! {
    /// Methods exposed by the name service.
    pub enum NameServiceVerb {
        /// `register(type, address) -> [id, token]`
        Register => "register",
        /// `unregister(id, type, token)`
        Unregister => "unregister",
        /// `lookup(type) -> [[id, address], ...]`
        Lookup => "lookup",
    }
}

struct Registration {
    address: Address,
    token: String,
}

#[derive(Default)]
struct Directory {
    last_id: PeerId,
    types: HashMap<String, BTreeMap<PeerId, Registration>>,
}

/// In-memory name service.
#[derive(Default)]
pub struct NameService {
    directory: Mutex<Directory>,
}

impl NameService {
    /// Creates an empty name service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a skeleton on `addr` and starts serving a new name service.
    pub async fn spawn(addr: impl ToSocketAddrs, cfg: Cfg) -> io::Result<(Arc<Self>, Serving)> {
        let skeleton = Skeleton::bind(addr, cfg).await?;
        let service = Arc::new(Self::new());
        let serving = skeleton.spawn(service.clone());
        log::info!("name service listening on {}", serving.local_addr());
        Ok((service, serving))
    }

    /// Registers a peer of the given type and returns its id and registration token.
    ///
    /// Ids are assigned in increasing order starting at 1 and are never reused.
    pub async fn register(&self, kind: &str, address: Address) -> (PeerId, String) {
        let mut dir = self.directory.lock().await;
        dir.last_id += 1;
        let id = dir.last_id;
        let token = Uuid::new_v4().to_string();
        log::info!("registered {} peer {} at {}", kind, id, &address);
        dir.types.entry(kind.to_string()).or_default().insert(id, Registration { address, token: token.clone() });
        (id, token)
    }

    /// Removes a registration.
    ///
    /// Fails if the peer is not registered for the type or the token does not match.
    pub async fn unregister(&self, id: PeerId, kind: &str, token: &str) -> Result<(), RemoteError> {
        let mut dir = self.directory.lock().await;
        let registered =
            dir.types.get_mut(kind).filter(|peers| peers.get(&id).is_some_and(|reg| reg.token == token));
        match registered {
            Some(peers) => {
                peers.remove(&id);
            }
            None => {
                return Err(RemoteError::new(ErrorKind::NotRegistered, format!("no {kind} peer {id} with this token"))
                    .with_payload(id))
            }
        }
        log::info!("unregistered {} peer {}", kind, id);
        Ok(())
    }

    /// Lists the peers currently registered for the type, ordered by id.
    pub async fn lookup(&self, kind: &str) -> Vec<(PeerId, Address)> {
        let dir = self.directory.lock().await;
        dir.types
            .get(kind)
            .map(|peers| peers.iter().map(|(id, reg)| (*id, reg.address.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dispatch for NameService {
    type Verb = NameServiceVerb;

    async fn invoke(&self, verb: NameServiceVerb, mut args: Args) -> Result<Value, RemoteError> {
        match verb {
            NameServiceVerb::Register => {
                let kind: String = args.next("type")?;
                let address: Address = args.next("address")?;
                reply(self.register(&kind, address).await)
            }
            NameServiceVerb::Unregister => {
                let id: PeerId = args.next("id")?;
                let kind: String = args.next("type")?;
                let token: String = args.next("token")?;
                self.unregister(id, &kind, &token).await?;
                Ok(Value::Null)
            }
            NameServiceVerb::Lookup => {
                let kind: String = args.next("type")?;
                reply(self.lookup(&kind).await)
            }
        }
    }
}

/// Typed proxy of a remote [NameService].
#[derive(Clone, Debug)]
pub struct NameServiceClient {
    stub: Stub,
}

impl NameServiceClient {
    /// Creates a client for the name service listening on `address`.
    pub fn new(address: Address, cfg: Cfg) -> Self {
        Self { stub: Stub::new(address, cfg) }
    }

    /// Connects to a name service given by socket address.
    pub fn at(addr: SocketAddr, cfg: Cfg) -> Self {
        Self::new(addr.into(), cfg)
    }

    /// Address of the name service.
    pub fn address(&self) -> &Address {
        self.stub.address()
    }

    /// Registers a peer and returns its id and registration token.
    pub async fn register(&self, kind: &str, address: &Address) -> Result<(PeerId, String), CallError> {
        self.stub.call_as(NameServiceVerb::Register.name(), vec![json!(kind), json!(address)]).await
    }

    /// Removes a registration.
    pub async fn unregister(&self, id: PeerId, kind: &str, token: &str) -> Result<(), CallError> {
        self.stub.call(NameServiceVerb::Unregister.name(), vec![json!(id), json!(kind), json!(token)]).await?;
        Ok(())
    }

    /// Lists the peers registered for a type.
    pub async fn lookup(&self, kind: &str) -> Result<Vec<(PeerId, Address)>, CallError> {
        self.stub.call_as(NameServiceVerb::Lookup.name(), vec![json!(kind)]).await
    }
}
