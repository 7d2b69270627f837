//! A complete participant: peer identity, membership registry and distributed lock.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{error::Error, fmt, sync::Arc};
use tokio::{net::ToSocketAddrs, sync::Mutex};

use crate::{
    lock::{DistributedLock, LockState, LockStatus, Token},
    name_service::NameServiceClient,
    peer::{Peer, PeerError},
    peer_list::{PeerList, Peers, RegistryError},
    rpc::{reply, Address, Args, CallError, Dispatch, RemoteError, Serving, Skeleton, Stub, Verb},
    verbs, Cfg, PeerId,
};

verbs! {
    /// Peer protocol methods exposed by every member.
    pub enum MemberVerb {
        /// `check() -> [id, type]`
        Check => "check",
        /// `register_peer(id, address) -> [id, address]`
        RegisterPeer => "register_peer",
        /// `unregister_peer(id)`
        UnregisterPeer => "unregister_peer",
        /// `request_token(time, id)`
        RequestToken => "request_token",
        /// `obtain_token(token)`
        ObtainToken => "obtain_token",
    }
}

/// Joining the network failed.
#[derive(Debug)]
pub enum JoinError {
    /// The peer could not be started.
    Peer(PeerError),
    /// The membership registry could not be populated.
    Registry(RegistryError),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Peer(err) => write!(f, "starting peer failed: {}", err),
            Self::Registry(err) => write!(f, "joining peers failed: {}", err),
        }
    }
}

impl Error for JoinError {}

impl From<PeerError> for JoinError {
    fn from(err: PeerError) -> Self {
        Self::Peer(err)
    }
}

impl From<RegistryError> for JoinError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

/// A peer taking part in membership and mutual exclusion.
///
/// Use [join](Self::join) to start a member serving only the peer protocol.
/// Objects exposing further methods embed a member created by [start](Self::start)
/// and forward the [MemberVerb]s to [execute](Self::execute).
pub struct Member {
    peer: Peer,
    peers: PeerList,
    lock: DistributedLock,
    serving: Mutex<Option<Serving>>,
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Member").field("peer", &self.peer).finish()
    }
}

impl Member {
    /// Starts and registers a peer without serving or joining yet.
    ///
    /// The caller spawns the returned skeleton with the object embedding the member,
    /// passes the handle to [attach](Self::attach) and then calls [initialize](Self::initialize).
    pub async fn start(
        cfg: Cfg, kind: &str, bind: impl ToSocketAddrs, name_service: NameServiceClient,
    ) -> Result<(Self, Skeleton), JoinError> {
        let (peer, skeleton) = Peer::start(cfg.clone(), kind, bind, name_service).await?;
        let peers = PeerList::new(peer.id(), peer.address().clone(), kind, cfg);
        let lock = DistributedLock::new(peer.id(), peers.roster());
        Ok((Self { peer, peers, lock, serving: Mutex::new(None) }, skeleton))
    }

    /// Starts a member, serves the peer protocol and joins the other peers of type `kind`.
    pub async fn join(
        cfg: Cfg, kind: &str, bind: impl ToSocketAddrs, name_service: NameServiceClient,
    ) -> Result<Arc<Self>, JoinError> {
        let (member, skeleton) = Self::start(cfg, kind, bind, name_service).await?;
        let member = Arc::new(member);
        member.attach(skeleton.spawn(member.clone())).await;
        member.initialize().await?;
        Ok(member)
    }

    /// Keeps the handle of the skeleton serving this member, so that leaving stops it.
    pub async fn attach(&self, serving: Serving) {
        *self.serving.lock().await = Some(serving);
    }

    /// Joins the other peers and sets up the distributed lock.
    ///
    /// The skeleton must be serving already, since peers start calling back
    /// as soon as they learn about this member.
    /// On failure the member is unregistered from the name service again.
    pub async fn initialize(&self) -> Result<(), JoinError> {
        if let Err(err) = self.peers.initialize(self.peer.name_service()).await {
            log::error!("peer {} cannot join: {}", self.peer.id(), &err);
            if let Err(err) = self.peer.destroy().await {
                log::warn!("peer {} cannot unregister: {}", self.peer.id(), err);
            }
            self.halt().await;
            return Err(err.into());
        }
        self.lock.initialize().await;
        log::info!("peer {} joined", self.peer.id());
        Ok(())
    }

    /// Leaves the network.
    ///
    /// Hands the token on if it is here, unregisters from all peers and from
    /// the name service and stops serving.
    /// Only a failing unregistration at the name service is reported.
    pub async fn leave(&self) -> Result<(), CallError> {
        self.lock.destroy().await;
        self.peers.destroy().await;
        let res = self.peer.destroy().await;
        self.halt().await;
        log::info!("peer {} left", self.peer.id());
        res
    }

    /// Stops serving without notifying anybody, as if the process had crashed.
    pub async fn halt(&self) {
        if let Some(serving) = self.serving.lock().await.take() {
            serving.shutdown();
        }
    }

    /// Id assigned by the name service.
    pub fn id(&self) -> PeerId {
        self.peer.id()
    }

    /// Address other peers reach this member at.
    pub fn address(&self) -> &Address {
        self.peer.address()
    }

    /// Peer identity.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Membership registry.
    pub fn peers(&self) -> &PeerList {
        &self.peers
    }

    /// Distributed lock.
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Snapshot of the registered peers.
    pub async fn display_peers(&self) -> Peers {
        self.peers.peers().await
    }

    /// Snapshot of the distributed lock.
    pub async fn display_status(&self) -> LockStatus {
        self.lock.status().await
    }

    /// Current state of the distributed lock.
    pub async fn lock_state(&self) -> LockState {
        self.lock.state().await
    }

    /// Executes a peer protocol method.
    pub async fn execute(&self, verb: MemberVerb, mut args: Args) -> Result<Value, RemoteError> {
        match verb {
            MemberVerb::Check => reply(self.peer.check()),
            MemberVerb::RegisterPeer => {
                let pid: PeerId = args.next("id")?;
                let address: Address = args.next("address")?;
                reply(self.peers.register_peer(pid, address).await)
            }
            MemberVerb::UnregisterPeer => {
                let pid: PeerId = args.next("id")?;
                self.peers.unregister_peer(pid).await?;
                Ok(Value::Null)
            }
            MemberVerb::RequestToken => {
                let time: u64 = args.next("time")?;
                let pid: PeerId = args.next("id")?;
                self.lock.request_token(time, pid).await?;
                Ok(Value::Null)
            }
            MemberVerb::ObtainToken => {
                let token: Token = args.next("token")?;
                self.lock.obtain_token(token).await?;
                Ok(Value::Null)
            }
        }
    }
}

#[async_trait]
impl Dispatch for Member {
    type Verb = MemberVerb;

    async fn invoke(&self, verb: MemberVerb, args: Args) -> Result<Value, RemoteError> {
        self.execute(verb, args).await
    }
}

impl From<Stub> for MemberClient {
    fn from(stub: Stub) -> Self {
        Self { stub }
    }
}

/// Typed proxy of a remote [Member].
#[derive(Clone, Debug)]
pub struct MemberClient {
    stub: Stub,
}

impl MemberClient {
    /// Creates a client for the member listening on `address`.
    pub fn new(address: Address, cfg: Cfg) -> Self {
        Self { stub: Stub::new(address, cfg) }
    }

    /// Address of the remote member.
    pub fn address(&self) -> &Address {
        self.stub.address()
    }

    /// Id and type of the remote member.
    pub async fn check(&self) -> Result<(PeerId, String), CallError> {
        self.stub.call_as(MemberVerb::Check.name(), vec![]).await
    }

    /// Registers a peer at the remote member and returns the member's id and address.
    pub async fn register_peer(&self, pid: PeerId, address: &Address) -> Result<(PeerId, Address), CallError> {
        self.stub.call_as(MemberVerb::RegisterPeer.name(), vec![json!(pid), json!(address)]).await
    }

    /// Unregisters a peer at the remote member.
    pub async fn unregister_peer(&self, pid: PeerId) -> Result<(), CallError> {
        self.stub.call(MemberVerb::UnregisterPeer.name(), vec![json!(pid)]).await?;
        Ok(())
    }

    /// Sends a token request to the remote member.
    pub async fn request_token(&self, time: u64, pid: PeerId) -> Result<(), CallError> {
        self.stub.call(MemberVerb::RequestToken.name(), vec![json!(time), json!(pid)]).await?;
        Ok(())
    }

    /// Hands a token to the remote member.
    pub async fn obtain_token(&self, token: &Token) -> Result<(), CallError> {
        self.stub.call(MemberVerb::ObtainToken.name(), vec![json!(token)]).await?;
        Ok(())
    }
}
