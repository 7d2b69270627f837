use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound::{Excluded, Unbounded},
};

use super::LockError;
use crate::PeerId;

/// Local state of the distributed lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    /// The token is elsewhere.
    NoToken,
    /// The token is here but the critical section is not entered.
    TokenPresent,
    /// The token is here and the critical section is entered.
    TokenHeld,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoToken => write!(f, "no token"),
            Self::TokenPresent => write!(f, "token present"),
            Self::TokenHeld => write!(f, "token held"),
        }
    }
}

/// The permit of the distributed lock.
///
/// Maps each peer to the logical time of its last completed critical section.
/// Transmitted as a list of `[id, time]` pairs, since JSON object keys must be strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(PeerId, u64)>", into = "Vec<(PeerId, u64)>")]
pub struct Token(pub BTreeMap<PeerId, u64>);

impl From<Vec<(PeerId, u64)>> for Token {
    fn from(entries: Vec<(PeerId, u64)>) -> Self {
        Self(entries.into_iter().collect())
    }
}

impl From<Token> for Vec<(PeerId, u64)> {
    fn from(token: Token) -> Self {
        token.0.into_iter().collect()
    }
}

/// Lock state, logical clock, request table and token table of one peer.
///
/// The key sets of both tables always equal the key set of the peer registry;
/// they are only changed together with it.
#[derive(Debug)]
pub struct LockTables {
    pub(crate) state: LockState,
    clock: u64,
    request: BTreeMap<PeerId, u64>,
    token: BTreeMap<PeerId, u64>,
}

impl Default for LockTables {
    fn default() -> Self {
        Self { state: LockState::NoToken, clock: 0, request: BTreeMap::new(), token: BTreeMap::new() }
    }
}

impl LockTables {
    /// Adds a joining peer to both tables.
    ///
    /// Entries start at zero, so that the first request of the peer is pending.
    /// Existing entries are kept.
    pub(crate) fn register_peer(&mut self, pid: PeerId) {
        self.request.entry(pid).or_insert(0);
        self.token.entry(pid).or_insert(0);
    }

    /// Removes a leaving peer from both tables.
    pub(crate) fn unregister_peer(&mut self, pid: PeerId) {
        self.request.remove(&pid);
        self.token.remove(&pid);
    }

    /// Advances the logical clock and returns the new time.
    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Records a request, keeping the highest time seen from the peer.
    pub(crate) fn record_request(&mut self, pid: PeerId, time: u64) -> Result<(), LockError> {
        match self.request.get_mut(&pid) {
            Some(latest) => {
                *latest = (*latest).max(time);
                Ok(())
            }
            None => Err(LockError::UnknownPeer(pid)),
        }
    }

    /// Whether the peer has a request that the token has not yet satisfied.
    pub(crate) fn is_pending(&self, pid: PeerId) -> bool {
        match (self.request.get(&pid), self.token.get(&pid)) {
            (Some(request), Some(token)) => request > token,
            _ => false,
        }
    }

    /// Whether any peer has an unsatisfied request.
    pub(crate) fn any_pending(&self) -> bool {
        self.request.keys().any(|pid| self.is_pending(*pid))
    }

    /// Leaves the critical section: advances the clock, stamps the owner's token entry
    /// and returns the handoff candidates in cyclic order after the owner.
    ///
    /// The state becomes [LockState::TokenPresent] until a candidate takes the token.
    pub(crate) fn begin_release(&mut self, owner: PeerId) -> Result<Vec<PeerId>, LockError> {
        if self.state == LockState::NoToken {
            return Err(LockError::NotHolding);
        }
        let time = self.tick();
        self.token.insert(owner, time);
        self.state = LockState::TokenPresent;
        Ok(self.successors(owner))
    }

    /// Peers other than the owner, starting just after it and wrapping around to the smallest id.
    pub(crate) fn successors(&self, owner: PeerId) -> Vec<PeerId> {
        let after = self.request.range((Excluded(owner), Unbounded)).map(|(pid, _)| *pid);
        let before = self.request.range(..owner).map(|(pid, _)| *pid);
        after.chain(before).collect()
    }

    /// Copy of the token table for transmission.
    pub(crate) fn token(&self) -> Token {
        Token(self.token.clone())
    }

    /// Replaces the token table with a received one.
    ///
    /// Received values are taken as they are. Entries of peers that are not registered
    /// here are dropped and registered peers missing from the token start at zero,
    /// keeping the key set equal to the registry.
    pub(crate) fn install(&mut self, token: Token) {
        let mut token = token.0;
        token.retain(|pid, _| self.request.contains_key(pid));
        for pid in self.request.keys() {
            token.entry(*pid).or_insert(0);
        }
        self.token = token;
    }

    pub(crate) fn status(&self) -> LockStatus {
        LockStatus { state: self.state, time: self.clock, request: self.request.clone(), token: self.token.clone() }
    }
}

/// Snapshot of the distributed lock of one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    /// Lock state.
    pub state: LockState,
    /// Logical clock.
    pub time: u64,
    /// Highest request time seen per peer.
    pub request: BTreeMap<PeerId, u64>,
    /// Token table as last known here.
    pub token: BTreeMap<PeerId, u64>,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "State   :: {}", self.state)?;
        writeln!(f, "Request :: {:?}", self.request)?;
        writeln!(f, "Token   :: {:?}", self.token)?;
        write!(f, "Time    :: {}", self.time)
    }
}
