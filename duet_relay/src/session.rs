// Per-nickname session record.
//
// A `Session` binds a nickname to the connection currently holding it. The
// registry owns every `Session`; other components refer to one by nickname
// or by `SessionHandle`.
//
// `SessionId` is assigned once, when a nickname is first registered, and
// never reused. `epoch` counts reactivations: each new connection that
// reclaims an offline nickname bumps it. A `SessionHandle` is therefore one
// connection's tenure of a nickname, and a stale handle (from a connection
// that has since been replaced) no longer matches the live session.

use std::time::Instant;

use crate::connection::Connection;

/// Stable arena index of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// One connection's tenure of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: SessionId,
    pub epoch: u64,
}

pub struct Session {
    id: SessionId,
    nickname: String,
    connection: Connection,
    online: bool,
    epoch: u64,
    idle_since: Instant,
}

impl Session {
    pub(crate) fn new(id: SessionId, nickname: String, connection: Connection) -> Self {
        Self {
            id,
            nickname,
            connection,
            online: true,
            epoch: 0,
            idle_since: Instant::now(),
        }
    }

    /// Hand the nickname to a new connection. Returns the connection it
    /// replaced.
    pub(crate) fn reactivate(&mut self, connection: Connection) -> Connection {
        self.epoch += 1;
        self.online = true;
        self.idle_since = Instant::now();
        std::mem::replace(&mut self.connection, connection)
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            epoch: self.epoch,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            handle: self.handle(),
            nickname: self.nickname.clone(),
            online: self.online,
            connection: self.connection.clone(),
        }
    }
}

/// Snapshot of a session taken under the registry lock. The connection is a
/// shared handle, so sends through it reach the live socket.
#[derive(Clone, Debug)]
pub struct SessionView {
    pub handle: SessionHandle,
    pub nickname: String,
    pub online: bool,
    pub connection: Connection,
}
