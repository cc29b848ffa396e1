// Authoritative nickname → session store.
//
// All mutation goes through one mutex, so two connections racing to claim
// the same nickname cannot both win. Sessions live in an arena keyed by
// `SessionId`; the nickname index maps into it. Sessions are never dropped
// on logout, only marked offline, so a client can reclaim its nickname
// later. `deregister` is the only way a nickname leaves the map.
//
// Lock order: when both are needed, the pairing engine's lock is taken
// before this one. Nothing here calls back into the pairing engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use duet_protocol::validate_nickname;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::RegistrationError;
use crate::session::{Session, SessionHandle, SessionId, SessionView};

pub struct Registry {
    inner: Mutex<Inner>,
    max_nickname_len: usize,
}

#[derive(Default)]
struct Inner {
    by_nickname: HashMap<String, SessionId>,
    sessions: BTreeMap<SessionId, Session>,
    next_id: u32,
}

impl Inner {
    fn get(&self, nickname: &str) -> Option<&Session> {
        self.by_nickname
            .get(nickname)
            .and_then(|id| self.sessions.get(id))
    }

    fn get_mut(&mut self, nickname: &str) -> Option<&mut Session> {
        let id = *self.by_nickname.get(nickname)?;
        self.sessions.get_mut(&id)
    }

    /// The session only if `handle` is its live tenure.
    fn current_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions
            .get_mut(&handle.id)
            .filter(|s| s.handle() == handle)
    }
}

/// An online session as seen by the "match me" scan.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: SessionId,
    pub nickname: String,
    pub idle_since: Instant,
}

impl Registry {
    pub fn new(max_nickname_len: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_nickname_len,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `nickname` for `connection`. A known but offline nickname is
    /// reactivated; an online one is refused.
    pub fn register(
        &self,
        nickname: &str,
        connection: Connection,
    ) -> Result<SessionHandle, RegistrationError> {
        validate_nickname(nickname, self.max_nickname_len)
            .map_err(|problem| RegistrationError::InvalidNickname(problem.to_string()))?;

        let mut inner = self.lock();
        if let Some(session) = inner.get_mut(nickname) {
            if session.is_online() {
                return Err(RegistrationError::AlreadyExists(nickname.to_owned()));
            }
            let old = session.reactivate(connection);
            old.close();
            info!(nickname, epoch = session.handle().epoch, "session reactivated");
            return Ok(session.handle());
        }

        let id = SessionId(inner.next_id);
        inner.next_id += 1;
        let session = Session::new(id, nickname.to_owned(), connection);
        let handle = session.handle();
        inner.by_nickname.insert(nickname.to_owned(), id);
        inner.sessions.insert(id, session);
        info!(nickname, id = id.0, "session registered");
        Ok(handle)
    }

    /// Reconnect under a nickname that was registered before. Unlike
    /// `register`, never creates a new session.
    pub fn login(
        &self,
        nickname: &str,
        connection: Connection,
    ) -> Result<SessionHandle, RegistrationError> {
        let mut inner = self.lock();
        let Some(session) = inner.get_mut(nickname) else {
            return Err(RegistrationError::NotFound(nickname.to_owned()));
        };
        if session.is_online() {
            return Err(RegistrationError::AlreadyExists(nickname.to_owned()));
        }
        let old = session.reactivate(connection);
        old.close();
        info!(nickname, epoch = session.handle().epoch, "session logged in");
        Ok(session.handle())
    }

    /// Mark `nickname` offline. Idempotent; unknown nicknames are ignored.
    pub fn logout(&self, nickname: &str) {
        if let Some(session) = self.lock().get_mut(nickname) {
            if session.is_online() {
                debug!(nickname, "session offline");
            }
            session.set_online(false);
        }
    }

    /// Mark the session offline, but only if `handle` is still its live
    /// tenure. Returns whether it was.
    pub fn release(&self, handle: SessionHandle) -> bool {
        match self.lock().current_mut(handle) {
            Some(session) => {
                if session.is_online() {
                    debug!(nickname = session.nickname(), "session released");
                }
                session.set_online(false);
                true
            }
            None => false,
        }
    }

    /// Remove the session entirely, freeing the nickname. Only the live
    /// tenure may do this.
    pub fn deregister(&self, handle: SessionHandle) -> bool {
        let mut inner = self.lock();
        if inner.current_mut(handle).is_none() {
            return false;
        }
        if let Some(session) = inner.sessions.remove(&handle.id) {
            inner.by_nickname.remove(session.nickname());
            info!(nickname = session.nickname(), "session deregistered");
        }
        true
    }

    pub fn lookup(&self, nickname: &str) -> Option<SessionView> {
        self.lock().get(nickname).map(Session::view)
    }

    pub fn is_online(&self, nickname: &str) -> bool {
        self.lock().get(nickname).is_some_and(Session::is_online)
    }

    /// Whether `handle` is the live tenure of its session.
    pub fn is_current(&self, handle: SessionHandle) -> bool {
        self.nickname_of(handle).is_some()
    }

    /// Nickname of the session `handle` refers to, if it is still current.
    pub fn nickname_of(&self, handle: SessionHandle) -> Option<String> {
        self.lock()
            .current_mut(handle)
            .map(|s| s.nickname().to_owned())
    }

    /// Restart the idle clock used by `MatchPolicy::LongestIdle`.
    pub fn mark_idle(&self, nickname: &str) {
        if let Some(session) = self.lock().get_mut(nickname) {
            session.mark_idle();
        }
    }

    /// Online sessions in registration order.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.is_online())
            .map(|s| Candidate {
                id: s.id(),
                nickname: s.nickname().to_owned(),
                idle_since: s.idle_since(),
            })
            .collect()
    }

    pub fn online_nicknames(&self) -> Vec<String> {
        self.candidates().into_iter().map(|c| c.nickname).collect()
    }

    /// Number of known nicknames, online or not.
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every session offline and close its connection. Used on
    /// shutdown; wakes each relay loop out of its blocking read.
    pub fn close_all(&self) {
        let mut inner = self.lock();
        for session in inner.sessions.values_mut() {
            session.set_online(false);
            session.connection().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use duet_protocol::DEFAULT_MAX_NICKNAME_LEN;

    use super::*;
    use crate::connection::tests::test_connection;

    fn registry() -> Registry {
        Registry::new(DEFAULT_MAX_NICKNAME_LEN)
    }

    #[test]
    fn register_then_lookup() {
        let reg = registry();
        let (conn, _client) = test_connection();
        let handle = reg.register("alice", conn.clone()).unwrap();

        let view = reg.lookup("alice").unwrap();
        assert_eq!(view.handle, handle);
        assert!(view.online);
        assert!(view.connection.same_transport(&conn));
        assert!(reg.lookup("bob").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_online_nickname_rejected() {
        let reg = registry();
        let (first, _c1) = test_connection();
        let (second, _c2) = test_connection();
        reg.register("alice", first).unwrap();

        let err = reg.register("alice", second.clone()).unwrap_err();
        assert_eq!(err, RegistrationError::AlreadyExists("alice".into()));
        // The loser's connection is left for the caller to reject.
        assert!(!second.is_closed());
    }

    #[test]
    fn register_after_logout_reactivates_same_session() {
        let reg = registry();
        let (first, _c1) = test_connection();
        let (second, _c2) = test_connection();
        let old = reg.register("alice", first.clone()).unwrap();

        reg.logout("alice");
        reg.logout("alice");
        assert!(!reg.is_online("alice"));

        let new = reg.register("alice", second.clone()).unwrap();
        assert_eq!(new.id, old.id);
        assert_eq!(new.epoch, old.epoch + 1);
        assert!(reg.is_online("alice"));
        assert!(first.is_closed());
        assert!(reg.lookup("alice").unwrap().connection.same_transport(&second));
    }

    #[test]
    fn login_requires_known_offline_nickname() {
        let reg = registry();
        let (c1, _r1) = test_connection();
        let (c2, _r2) = test_connection();
        let (c3, _r3) = test_connection();

        assert_eq!(
            reg.login("carol", c1.clone()).unwrap_err(),
            RegistrationError::NotFound("carol".into())
        );

        reg.register("carol", c1).unwrap();
        assert_eq!(
            reg.login("carol", c2).unwrap_err(),
            RegistrationError::AlreadyExists("carol".into())
        );

        reg.logout("carol");
        let handle = reg.login("carol", c3).unwrap();
        assert_eq!(handle.epoch, 1);
        assert!(reg.is_online("carol"));
    }

    #[test]
    fn stale_release_leaves_new_tenure_online() {
        let reg = registry();
        let (c1, _r1) = test_connection();
        let (c2, _r2) = test_connection();
        let old = reg.register("bob", c1).unwrap();
        reg.logout("bob");
        let new = reg.register("bob", c2).unwrap();

        assert!(!reg.release(old));
        assert!(reg.is_online("bob"));
        assert!(!reg.is_current(old));
        assert_eq!(reg.nickname_of(new).as_deref(), Some("bob"));

        assert!(reg.release(new));
        assert!(reg.release(new));
        assert!(!reg.is_online("bob"));
    }

    #[test]
    fn deregister_frees_nickname() {
        let reg = registry();
        let (c1, _r1) = test_connection();
        let (c2, _r2) = test_connection();
        let handle = reg.register("dave", c1).unwrap();

        assert!(reg.deregister(handle));
        assert!(!reg.deregister(handle));
        assert!(reg.lookup("dave").is_none());
        assert!(reg.is_empty());

        let fresh = reg.register("dave", c2).unwrap();
        assert_ne!(fresh.id, handle.id);
        assert_eq!(fresh.epoch, 0);
    }

    #[test]
    fn invalid_nickname_rejected() {
        let reg = Registry::new(4);
        let (c1, _r1) = test_connection();
        assert!(matches!(
            reg.register("", c1.clone()),
            Err(RegistrationError::InvalidNickname(_))
        ));
        assert!(matches!(
            reg.register("toolong", c1.clone()),
            Err(RegistrationError::InvalidNickname(_))
        ));
        assert!(matches!(
            reg.register("a b", c1),
            Err(RegistrationError::InvalidNickname(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn candidates_exclude_offline_in_registration_order() {
        let reg = registry();
        for name in ["zed", "amy", "kim"] {
            let (conn, _r) = test_connection();
            reg.register(name, conn).unwrap();
        }
        reg.logout("amy");
        assert_eq!(reg.online_nicknames(), vec!["zed", "kim"]);
    }

    #[test]
    fn concurrent_register_has_one_winner() {
        let reg = Arc::new(registry());
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let mut keep_alive = Vec::new();
        let mut threads = Vec::new();
        for _ in 0..contenders {
            let (conn, client) = test_connection();
            keep_alive.push(client);
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            threads.push(thread::spawn(move || {
                barrier.wait();
                reg.register("alice", conn).is_ok()
            }));
        }
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn close_all_takes_everyone_offline() {
        let reg = registry();
        let (c1, _r1) = test_connection();
        let (c2, _r2) = test_connection();
        reg.register("a", c1.clone()).unwrap();
        reg.register("b", c2.clone()).unwrap();

        reg.close_all();
        assert!(reg.online_nicknames().is_empty());
        assert!(c1.is_closed() && c2.is_closed());
    }
}
