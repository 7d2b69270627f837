//! Membership registry of the peers sharing a type.
//!
//! The registry maps the id of every peer believed to be live, including
//! the owner, to a [Stub] for reaching it.
//! It is bootstrapped from the name service by [PeerList::initialize] and kept
//! current by the `register_peer` and `unregister_peer` calls of joining and
//! leaving peers.
//!
//! The lock tables of the [DistributedLock](crate::lock::DistributedLock) live
//! behind the same mutex and are grown and shrunk together with the registry.

use std::{collections::BTreeMap, error::Error, fmt, sync::Arc};
use tokio::sync::Mutex;

use crate::{
    lock::LockTables,
    member::MemberClient,
    name_service::NameServiceClient,
    rpc::{Address, CallError, ErrorKind, RemoteError, Stub},
    Cfg, PeerId,
};

/// Registry operation failed.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// No peer with this id is registered.
    UnknownPeer(PeerId),
    /// Looking up the peers at the name service failed.
    NameService(CallError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownPeer(pid) => write!(f, "no peer with id {}", pid),
            Self::NameService(err) => write!(f, "name service lookup failed: {}", err),
        }
    }
}

impl Error for RegistryError {}

impl From<RegistryError> for RemoteError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownPeer(pid) => {
                RemoteError::new(ErrorKind::UnknownPeer, err.to_string()).with_payload(pid)
            }
            RegistryError::NameService(_) => RemoteError::new(ErrorKind::Other("NameService".into()), err.to_string()),
        }
    }
}

/// Registry and lock tables, guarded together.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    pub(crate) peers: BTreeMap<PeerId, Stub>,
    pub(crate) tables: LockTables,
}

impl Roster {
    /// Adds or updates a peer.
    ///
    /// Returns whether the peer was not known before.
    pub(crate) fn insert(&mut self, pid: PeerId, stub: Stub) -> bool {
        self.tables.register_peer(pid);
        self.peers.insert(pid, stub).is_none()
    }

    pub(crate) fn remove(&mut self, pid: PeerId) -> Option<Stub> {
        let stub = self.peers.remove(&pid)?;
        self.tables.unregister_peer(pid);
        Some(stub)
    }

    /// All peers except the owner, ordered by id.
    pub(crate) fn others(&self, owner: PeerId) -> Vec<(PeerId, Stub)> {
        self.peers.iter().filter(|(pid, _)| **pid != owner).map(|(pid, stub)| (*pid, stub.clone())).collect()
    }
}

pub(crate) type SharedRoster = Arc<Mutex<Roster>>;

/// Snapshot of the registered peers and their addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peers {
    /// Type of the peers.
    pub kind: String,
    /// Address by peer id.
    pub addresses: BTreeMap<PeerId, Address>,
}

impl Peers {
    /// Registered ids in increasing order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.addresses.keys().copied().collect()
    }
}

impl fmt::Display for Peers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "List of peers of type '{}':", &self.kind)?;
        for (pid, address) in &self.addresses {
            write!(f, "\n    id: {:>2}, address: {}", pid, address)?;
        }
        Ok(())
    }
}

/// The live set of peers of the owner's type.
#[derive(Clone)]
pub struct PeerList {
    owner: PeerId,
    address: Address,
    kind: String,
    cfg: Cfg,
    roster: SharedRoster,
}

impl fmt::Debug for PeerList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PeerList").field("owner", &self.owner).field("kind", &self.kind).finish()
    }
}

impl PeerList {
    /// Creates an empty registry for the peer `owner` reachable at `address`.
    pub fn new(owner: PeerId, address: Address, kind: impl Into<String>, cfg: Cfg) -> Self {
        Self { owner, address, kind: kind.into(), cfg, roster: Default::default() }
    }

    pub(crate) fn roster(&self) -> SharedRoster {
        self.roster.clone()
    }

    /// Populates the registry from the name service and announces the owner.
    ///
    /// Only peers with an id lower than the owner's are contacted; peers
    /// joining later register themselves here.
    /// Peers that cannot be reached are logged and left out.
    pub async fn initialize(&self, name_service: &NameServiceClient) -> Result<(), RegistryError> {
        let found = name_service.lookup(&self.kind).await.map_err(RegistryError::NameService)?;
        self.roster.lock().await.insert(self.owner, Stub::new(self.address.clone(), self.cfg.clone()));

        for (pid, address) in found.into_iter().filter(|(pid, _)| *pid < self.owner) {
            let client = MemberClient::new(address, self.cfg.clone());
            match client.register_peer(self.owner, &self.address).await {
                Ok((id, address)) => {
                    if id != pid {
                        log::warn!("peer listed as {} at {} identifies as {}", pid, client.address(), id);
                    }
                    self.roster.lock().await.insert(id, Stub::new(address, self.cfg.clone()));
                    log::info!("peer {} found peer {}", self.owner, id);
                }
                Err(err) => log::warn!("peer {} at {} is unreachable: {}", pid, client.address(), err),
            }
        }
        Ok(())
    }

    /// Registers a peer joining the network.
    ///
    /// Registering a known peer again updates its address.
    /// Returns the id and address of the owner.
    pub async fn register_peer(&self, pid: PeerId, address: Address) -> (PeerId, Address) {
        let stub = Stub::new(address, self.cfg.clone());
        if self.roster.lock().await.insert(pid, stub) {
            log::info!("peer {} has joined the system", pid);
        }
        (self.owner, self.address.clone())
    }

    /// Unregisters a peer leaving the network.
    pub async fn unregister_peer(&self, pid: PeerId) -> Result<(), RegistryError> {
        match self.roster.lock().await.remove(pid) {
            Some(_) => {
                log::info!("peer {} has left the system", pid);
                Ok(())
            }
            None => {
                log::error!("cannot unregister unknown peer {}", pid);
                Err(RegistryError::UnknownPeer(pid))
            }
        }
    }

    /// Unregisters the owner at every other known peer and removes its own entry.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn destroy(&self) {
        let others = self.roster.lock().await.others(self.owner);
        for (pid, stub) in others {
            if let Err(err) = MemberClient::from(stub).unregister_peer(self.owner).await {
                log::warn!("cannot unregister from peer {}: {}", pid, err);
            }
        }
        self.roster.lock().await.remove(self.owner);
    }

    /// Stub of the peer with the given id.
    pub async fn peer(&self, pid: PeerId) -> Option<Stub> {
        self.roster.lock().await.peers.get(&pid).cloned()
    }

    /// Snapshot of all registered peers.
    pub async fn peers(&self) -> Peers {
        let roster = self.roster.lock().await;
        Peers {
            kind: self.kind.clone(),
            addresses: roster.peers.iter().map(|(pid, stub)| (*pid, stub.address().clone())).collect(),
        }
    }
}
