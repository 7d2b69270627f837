//! Identity and name service registration of a peer.

use std::{error::Error, fmt, io, net::SocketAddr};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};

use crate::{
    name_service::NameServiceClient,
    rpc::{Address, CallError, Skeleton},
    Cfg, PeerId,
};

/// Starting a peer failed.
#[derive(Debug)]
pub enum PeerError {
    /// Binding the listening socket failed.
    Bind(io::Error),
    /// The externally reachable address could not be determined.
    Resolve(io::Error),
    /// Registration at the name service failed.
    Register(CallError),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "binding failed: {}", err),
            Self::Resolve(err) => write!(f, "cannot determine peer address: {}", err),
            Self::Register(err) => write!(f, "registration failed: {}", err),
        }
    }
}

impl Error for PeerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Bind(err) | Self::Resolve(err) => Some(err),
            Self::Register(err) => Some(err),
        }
    }
}

/// A peer registered at the name service.
///
/// The peer's [Skeleton] is returned separately by [start](Self::start), so that
/// the object it serves can be built from the assigned id before calls are dispatched.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    kind: String,
    address: Address,
    token: String,
    name_service: NameServiceClient,
}

impl Peer {
    /// Binds the skeleton of a peer of type `kind` and registers it at the name service.
    ///
    /// If `bind` is a wildcard address, the peer is registered with the address
    /// of the interface used to reach the name service.
    pub async fn start(
        cfg: Cfg, kind: &str, bind: impl ToSocketAddrs, name_service: NameServiceClient,
    ) -> Result<(Self, Skeleton), PeerError> {
        let skeleton = Skeleton::bind(bind, cfg).await.map_err(PeerError::Bind)?;
        let address = external_address(skeleton.local_addr(), name_service.address()).await.map_err(PeerError::Resolve)?;
        let (id, token) = name_service.register(kind, &address).await.map_err(PeerError::Register)?;
        log::info!("{} peer {} started at {}", kind, id, &address);

        let peer = Self { id, kind: kind.to_string(), address, token, name_service };
        Ok((peer, skeleton))
    }

    /// Unregisters the peer from the name service.
    pub async fn destroy(&self) -> Result<(), CallError> {
        self.name_service.unregister(self.id, &self.kind, &self.token).await?;
        log::info!("{} peer {} unregistered", &self.kind, self.id);
        Ok(())
    }

    /// Id and type of the peer.
    pub fn check(&self) -> (PeerId, String) {
        (self.id, self.kind.clone())
    }

    /// Id assigned by the name service.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Type of the peer.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Address other peers reach this peer at.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Client of the name service the peer is registered at.
    pub fn name_service(&self) -> &NameServiceClient {
        &self.name_service
    }
}

/// Address other hosts can dial for a socket bound to `local`.
///
/// A wildcard IP is replaced by the address of the interface routing to the name service.
async fn external_address(local: SocketAddr, name_service: &Address) -> io::Result<Address> {
    if !local.ip().is_unspecified() {
        return Ok(local.into());
    }

    let target = lookup_host((name_service.host.as_str(), name_service.port))
        .await?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("name service {} has no address", name_service))
        })?;

    // Connecting a datagram socket sends nothing but selects the outbound interface.
    let probe = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
    probe.connect(target).await?;
    let ip = probe.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no route to {}", name_service)));
    }

    Ok(SocketAddr::new(ip, local.port()).into())
}
