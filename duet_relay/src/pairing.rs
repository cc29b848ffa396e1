// Pairing engine: forms and dissolves exclusive two-party rooms.
//
// A room is stored as two directed entries (a → b, b → a) in one map behind
// one mutex. Every decision that reads the map and then writes it ("is
// either side free? then pair them") runs inside a single critical section,
// so two concurrent joins that share a nickname cannot both succeed.
//
// Online checks consult the registry while the pairing lock is held. The
// lock order is always pairing → registry.
//
// "Match me" (`join_any`) is a synchronous scan over online, unpaired
// sessions. The tie-break among candidates is the configured `MatchPolicy`;
// the scan never waits for someone to show up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::seq::SliceRandom;
use tracing::info;

use crate::config::MatchPolicy;
use crate::error::PairingError;
use crate::registry::{Candidate, Registry};
use crate::session::SessionHandle;

pub struct PairingEngine {
    rooms: Mutex<HashMap<String, String>>,
    registry: Arc<Registry>,
    policy: MatchPolicy,
}

impl PairingEngine {
    pub fn new(registry: Arc<Registry>, policy: MatchPolicy) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            registry,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `a` and `b` in a room together.
    pub fn join(&self, a: &str, b: &str) -> Result<(), PairingError> {
        if a == b {
            return Err(PairingError::SelfPairing(a.to_owned()));
        }
        let mut rooms = self.lock();
        for nickname in [a, b] {
            if !self.registry.is_online(nickname) {
                return Err(PairingError::PeerOffline(nickname.to_owned()));
            }
        }
        for nickname in [a, b] {
            if rooms.contains_key(nickname) {
                return Err(PairingError::AlreadyPaired(nickname.to_owned()));
            }
        }
        rooms.insert(a.to_owned(), b.to_owned());
        rooms.insert(b.to_owned(), a.to_owned());
        info!(a, b, "room formed");
        Ok(())
    }

    /// Pair `nickname` with some online, unpaired session chosen by the
    /// match policy. Returns the partner's nickname.
    pub fn join_any(&self, nickname: &str) -> Result<String, PairingError> {
        let mut rooms = self.lock();
        if !self.registry.is_online(nickname) {
            return Err(PairingError::PeerOffline(nickname.to_owned()));
        }
        if rooms.contains_key(nickname) {
            return Err(PairingError::AlreadyPaired(nickname.to_owned()));
        }

        let candidates: Vec<Candidate> = self
            .registry
            .candidates()
            .into_iter()
            .filter(|c| c.nickname != nickname && !rooms.contains_key(&c.nickname))
            .collect();
        let chosen = self
            .choose(&candidates)
            .ok_or(PairingError::NoPeerAvailable)?;
        let peer = chosen.nickname.clone();

        rooms.insert(nickname.to_owned(), peer.clone());
        rooms.insert(peer.clone(), nickname.to_owned());
        info!(a = nickname, b = %peer, policy = ?self.policy, "room matched");
        Ok(peer)
    }

    fn choose<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        match self.policy {
            MatchPolicy::FirstRegistered => candidates.iter().min_by_key(|c| c.id),
            MatchPolicy::LongestIdle => candidates.iter().min_by_key(|c| (c.idle_since, c.id)),
            MatchPolicy::Random => candidates.choose(&mut rand::thread_rng()),
        }
    }

    /// Dissolve `nickname`'s room, if any. Returns the former partner.
    pub fn leave(&self, nickname: &str) -> Option<String> {
        let mut rooms = self.lock();
        let peer = rooms.remove(nickname)?;
        rooms.remove(&peer);
        drop(rooms);

        self.registry.mark_idle(nickname);
        self.registry.mark_idle(&peer);
        info!(a = nickname, b = %peer, "room dissolved");
        Some(peer)
    }

    /// `leave` on behalf of one connection's tenure. Does nothing if the
    /// nickname has since been reclaimed by another connection.
    pub fn leave_session(&self, handle: SessionHandle) -> Option<String> {
        self.end_session(handle, |_| {})
    }

    /// `leave_session`, then `retire` (typically `Registry::release` or
    /// `Registry::deregister` for the same handle) while the pairing lock is
    /// still held. No join can pair the nickname between the two steps, so
    /// a session never goes offline while sitting in a room.
    pub fn end_session(
        &self,
        handle: SessionHandle,
        retire: impl FnOnce(&Registry),
    ) -> Option<String> {
        let mut rooms = self.lock();
        let nickname = self.registry.nickname_of(handle)?;
        let peer = rooms.remove(&nickname);
        if let Some(peer) = &peer {
            rooms.remove(peer);
        }
        retire(&self.registry);
        drop(rooms);

        let peer = peer?;
        self.registry.mark_idle(&peer);
        info!(a = %nickname, b = %peer, "room dissolved on disconnect");
        Some(peer)
    }

    /// Dissolve `nickname`'s room with the session behind `peer_handle` and
    /// take that session offline, in one critical section. Returns `false`
    /// if that room no longer exists, i.e. someone else already ended it.
    pub fn evict(&self, nickname: &str, peer_handle: SessionHandle) -> bool {
        let mut rooms = self.lock();
        let Some(peer) = self.registry.nickname_of(peer_handle) else {
            return false;
        };
        if rooms.get(nickname) != Some(&peer) {
            return false;
        }
        rooms.remove(nickname);
        rooms.remove(&peer);
        self.registry.release(peer_handle);
        drop(rooms);

        self.registry.mark_idle(nickname);
        info!(a = nickname, b = %peer, "partner evicted");
        true
    }

    pub fn peer_of(&self, nickname: &str) -> Option<String> {
        self.lock().get(nickname).cloned()
    }

    pub fn is_paired(&self, nickname: &str) -> bool {
        self.lock().contains_key(nickname)
    }

    pub fn room_count(&self) -> usize {
        self.lock().len() / 2
    }
}
