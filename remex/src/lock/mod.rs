//! Distributed mutual exclusion by token passing.
//!
//! This implements the second Ricart–Agrawala algorithm over the peers of a
//! [PeerList](crate::peer_list::PeerList).
//! A single token circulates between the peers; only the peer holding it may
//! enter the critical section.
//!
//! A peer wanting to enter sends a timestamped request to every other peer
//! and waits for the token.
//! Each peer records the highest request time seen from every other peer in
//! its request table.
//! The token carries, for every peer, the time of its last completed critical
//! section.
//! A request is outstanding while its time exceeds the token entry of the requester.
//!
//! On release the holder scans the other peers in cyclic id order, starting
//! just after its own id, and hands the token to the first peer with an
//! outstanding request.
//! An idle holder hands the token on as soon as a request arrives.
//!
//! # Failures
//!
//! Unreachable peers are skipped when requesting and when handing off the token.
//! The token is lost if the peer holding it crashes; this is not recovered.
//!
//! Violations of the protocol, such as releasing without holding the token,
//! are reported as [LockError] and logged at error level.

use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

mod tables;

pub(crate) use tables::LockTables;
pub use tables::{LockState, LockStatus, Token};

use crate::{
    member::MemberClient,
    peer_list::SharedRoster,
    rpc::{CallError, ErrorKind, RemoteError},
    PeerId,
};

/// The distributed lock protocol was violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockError {
    /// Acquire was called while already in the critical section.
    AlreadyHeld,
    /// Release was called without holding the token.
    NotHolding,
    /// A message referenced a peer that is not registered.
    UnknownPeer(PeerId),
    /// A token was received while one is already present.
    DuplicateToken,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyHeld => write!(f, "lock is already held"),
            Self::NotHolding => write!(f, "token is not held"),
            Self::UnknownPeer(pid) => write!(f, "peer {} is not registered", pid),
            Self::DuplicateToken => write!(f, "received a second token"),
        }
    }
}

impl Error for LockError {}

impl From<LockError> for RemoteError {
    fn from(err: LockError) -> Self {
        let remote = RemoteError::new(ErrorKind::LockMisuse, err.to_string());
        match err {
            LockError::UnknownPeer(pid) => remote.with_payload(pid),
            _ => remote,
        }
    }
}

/// Whom the token may be handed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handoff {
    /// Only peers with an outstanding request.
    Pending,
    /// Any reachable peer.
    Any,
}

/// Token-passing mutual exclusion among the peers of a registry.
///
/// Shares the registry mutex, so that lock tables and registry always change together.
/// The mutex is never held during a remote call.
#[derive(Clone)]
pub struct DistributedLock {
    owner: PeerId,
    roster: SharedRoster,
    token_arrived: Arc<Notify>,
    waiters: Arc<AtomicUsize>,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DistributedLock").field("owner", &self.owner).finish()
    }
}

/// Counts a task waiting for the token for as long as it exists.
struct Waiting(Arc<AtomicUsize>);

impl Waiting {
    fn new(waiters: &Arc<AtomicUsize>) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self(waiters.clone())
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DistributedLock {
    pub(crate) fn new(owner: PeerId, roster: SharedRoster) -> Self {
        Self { owner, roster, token_arrived: Arc::new(Notify::new()), waiters: Arc::new(AtomicUsize::new(0)) }
    }

    /// Sets up the lock once the registry has been populated.
    ///
    /// The peer with the smallest registered id starts with the token.
    pub async fn initialize(&self) {
        let mut roster = self.roster.lock().await;
        let ids: Vec<PeerId> = roster.peers.keys().copied().collect();
        for pid in &ids {
            roster.tables.register_peer(*pid);
        }

        if ids.first() == Some(&self.owner) && roster.tables.state == LockState::NoToken {
            roster.tables.state = LockState::TokenPresent;
            log::info!("peer {} starts with the token", self.owner);
        }
    }

    /// Enters the critical section, waiting for the token if necessary.
    ///
    /// Peers that cannot be reached are skipped when requesting the token.
    /// This waits until some peer hands over the token, which may never happen
    /// if the current holder crashed.
    pub async fn acquire(&self) -> Result<(), LockError> {
        let (time, others, _waiting) = {
            let mut roster = self.roster.lock().await;
            match roster.tables.state {
                LockState::TokenHeld => {
                    log::error!("peer {} tried to acquire the lock it already holds", self.owner);
                    return Err(LockError::AlreadyHeld);
                }
                LockState::TokenPresent => {
                    roster.tables.tick();
                    roster.tables.state = LockState::TokenHeld;
                    log::debug!("peer {} enters the critical section", self.owner);
                    return Ok(());
                }
                LockState::NoToken => (),
            }
            let time = roster.tables.tick();
            (time, roster.others(self.owner), Waiting::new(&self.waiters))
        };

        log::debug!("peer {} requests the token at time {}", self.owner, time);
        for (pid, stub) in others {
            if let Err(err) = MemberClient::from(stub).request_token(time, self.owner).await {
                log::warn!("cannot request the token from peer {}: {}", pid, err);
            }
        }

        loop {
            let arrived = self.token_arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            {
                let mut roster = self.roster.lock().await;
                if roster.tables.state == LockState::TokenPresent {
                    roster.tables.state = LockState::TokenHeld;
                    log::debug!("peer {} enters the critical section", self.owner);
                    return Ok(());
                }
            }

            arrived.await;
        }
    }

    /// Leaves the critical section and hands the token to the next requesting peer.
    ///
    /// If no peer is waiting, or none of the waiting peers can be reached,
    /// the token stays here.
    /// Tasks of this peer waiting in [acquire](Self::acquire) are served before other peers.
    pub async fn release(&self) -> Result<(), LockError> {
        let candidates = {
            let mut roster = self.roster.lock().await;
            let candidates = roster.tables.begin_release(self.owner).map_err(|err| {
                log::error!("peer {} released the lock without holding it", self.owner);
                err
            })?;
            if self.waiters.load(Ordering::SeqCst) > 0 {
                log::debug!("peer {} keeps the token for a local task", self.owner);
                self.token_arrived.notify_waiters();
                return Ok(());
            }
            candidates
        };
        log::debug!("peer {} leaves the critical section", self.owner);

        self.hand_off(candidates, Handoff::Pending).await;
        Ok(())
    }

    /// Handles a token request from another peer.
    ///
    /// An idle holder passes the token on immediately.
    /// A holder with a local task waiting for the token keeps it until that task releases.
    pub async fn request_token(&self, time: u64, pid: PeerId) -> Result<(), LockError> {
        let candidates = {
            let mut roster = self.roster.lock().await;
            roster.tables.tick();
            roster.tables.record_request(pid, time).map_err(|err| {
                log::error!("peer {} received a request from unregistered peer {}", self.owner, pid);
                err
            })?;
            // A local task about to take the token releases it after its critical section.
            if roster.tables.state != LockState::TokenPresent || self.waiters.load(Ordering::SeqCst) > 0 {
                return Ok(());
            }
            roster.tables.begin_release(self.owner)?
        };
        log::debug!("idle peer {} passes on the token after request of peer {}", self.owner, pid);

        self.hand_off(candidates, Handoff::Pending).await;
        Ok(())
    }

    /// Handles the token being handed over by another peer.
    ///
    /// Wakes a task waiting in [acquire](Self::acquire).
    /// If nobody here waits for the token but other peers do, it is passed on.
    pub async fn obtain_token(&self, token: Token) -> Result<(), LockError> {
        let candidates = {
            let mut roster = self.roster.lock().await;
            if roster.tables.state != LockState::NoToken {
                log::error!("peer {} received a token while holding one", self.owner);
                return Err(LockError::DuplicateToken);
            }
            roster.tables.tick();
            roster.tables.install(token);
            roster.tables.state = LockState::TokenPresent;
            log::info!("peer {} obtained the token", self.owner);
            self.token_arrived.notify_waiters();

            if self.waiters.load(Ordering::SeqCst) == 0 && roster.tables.any_pending() {
                Some(roster.tables.begin_release(self.owner)?)
            } else {
                None
            }
        };

        if let Some(candidates) = candidates {
            log::debug!("idle peer {} passes on the received token", self.owner);
            let this = self.clone();
            tokio::spawn(async move {
                this.hand_off(candidates, Handoff::Pending).await;
            });
        }
        Ok(())
    }

    /// Gives away the token before this peer leaves.
    ///
    /// A peer with an outstanding request is preferred; otherwise the token goes
    /// to the first reachable peer in cyclic order.
    pub async fn destroy(&self) {
        let candidates = {
            let mut roster = self.roster.lock().await;
            if roster.tables.state == LockState::NoToken {
                return;
            }
            roster.tables.state = LockState::TokenPresent;
            roster.tables.successors(self.owner)
        };

        if self.hand_off(candidates.clone(), Handoff::Pending).await.is_some() {
            return;
        }
        if self.hand_off(candidates, Handoff::Any).await.is_none() {
            log::warn!("peer {} leaves and no peer could take the token", self.owner);
        }
    }

    /// Current lock state.
    pub async fn state(&self) -> LockState {
        self.roster.lock().await.tables.state
    }

    /// Snapshot of lock state, clock and tables.
    pub async fn status(&self) -> LockStatus {
        self.roster.lock().await.tables.status()
    }

    /// Offers the token to the candidates in order until one takes it.
    ///
    /// Stops early when the token has been taken locally in the meantime.
    /// Returns the peer that took the token.
    async fn hand_off(&self, candidates: Vec<PeerId>, handoff: Handoff) -> Option<PeerId> {
        for pid in candidates {
            let (stub, token) = {
                let mut roster = self.roster.lock().await;
                if roster.tables.state != LockState::TokenPresent {
                    return None;
                }
                let Some(stub) = roster.peers.get(&pid).cloned() else { continue };
                if handoff == Handoff::Pending && !roster.tables.is_pending(pid) {
                    continue;
                }
                // In flight: nobody here may use the token until the handoff failed.
                roster.tables.state = LockState::NoToken;
                (stub, roster.tables.token())
            };

            match MemberClient::from(stub).obtain_token(&token).await {
                Ok(()) => {
                    log::info!("peer {} handed the token to peer {}", self.owner, pid);
                    return Some(pid);
                }
                Err(err) => {
                    match &err {
                        CallError::Transport(err) if err.maybe_delivered() => log::warn!(
                            "peer {} may have received the token but did not confirm: {}",
                            pid,
                            err
                        ),
                        err => log::warn!("peer {} cannot take the token: {}", pid, err),
                    }
                    let mut roster = self.roster.lock().await;
                    // The token may have come back and been taken meanwhile.
                    if roster.tables.state != LockState::NoToken {
                        return None;
                    }
                    roster.tables.state = LockState::TokenPresent;
                    self.token_arrived.notify_waiters();
                }
            }
        }
        None
    }
}
