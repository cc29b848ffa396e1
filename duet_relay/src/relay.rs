// Per-connection relay loop.
//
// Each accepted connection runs `Relay::serve` on its own thread:
//
//   Registering ── Register/Login ok ──▶ Idle ── Join ok ──▶ Paired
//        │                                 ▲                   │
//        │                                 └── Leave / PeerLeft┘
//        └──────── any state: EOF, read error, bad frame, Logout ──▶ Closed
//
// The loop blocks only on reading its own socket. Everything it writes to
// the partner goes through the partner's `Connection`, whose writes are
// bounded by the send timeout, so a stalled partner shows up here as a send
// failure rather than a hang. A failed send dissolves the room, takes the
// partner offline, and reports `PeerLeft`.
//
// Paired/Idle is not tracked locally; the pairing engine is the source of
// truth, since the partner's thread can form or dissolve our room at any
// time.
//
// Cleanup lives in `SessionGuard::drop`, so it runs exactly once per
// registered connection however the loop exits. All cleanup steps are
// idempotent and epoch-guarded, which makes the race between our own EOF
// and the partner's failure path harmless.

use std::io::{self, BufReader};
use std::net::TcpStream;
use std::sync::Arc;

use duet_protocol::{ClientMessage, PeerInfo, ServerMessage, StatusCode};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::connection::Connection;
use crate::error::{PairingError, RelayError, TransportError};
use crate::pairing::PairingEngine;
use crate::registry::Registry;
use crate::session::{SessionHandle, SessionView};

/// Shared state for every connection's relay loop.
pub struct Relay {
    registry: Arc<Registry>,
    pairing: Arc<PairingEngine>,
    config: RelayConfig,
}

/// What the loop does after handling one frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// How a registered connection gives up its session on exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    Release,
    Deregister,
}

/// One connection's registered session. Dropping it runs the disconnect
/// path.
struct SessionGuard<'a> {
    relay: &'a Relay,
    handle: SessionHandle,
    nickname: String,
    connection: Connection,
    exit: Exit,
}

impl SessionGuard<'_> {
    fn reply(&self, msg: ServerMessage) -> Result<(), TransportError> {
        self.connection.send(&msg)
    }

    fn reply_status(
        &self,
        code: StatusCode,
        message: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.reply(ServerMessage::status(code, message))
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let relay = self.relay;
        let (handle, exit) = (self.handle, self.exit);
        // Room and registry entry go together, so nobody can pair with
        // this nickname after it has left its room but before it is offline.
        let former_peer = relay.pairing.end_session(handle, |registry| match exit {
            Exit::Release => {
                registry.release(handle);
            }
            Exit::Deregister => {
                registry.deregister(handle);
            }
        });
        if let Some(peer) = former_peer {
            let notice = ServerMessage::peer_status(
                StatusCode::PeerLeft,
                format!("{} disconnected", self.nickname),
                &self.nickname,
            );
            if let Err(e) = relay.notify(&peer, &notice) {
                debug!(peer = %peer, error = %e, "could not tell partner about disconnect");
            }
        }
        self.connection.close();
        info!(nickname = %self.nickname, "session closed");
    }
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new(config.max_nickname_len));
        let pairing = Arc::new(PairingEngine::new(
            Arc::clone(&registry),
            config.match_policy,
        ));
        Self {
            registry,
            pairing,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pairing(&self) -> &Arc<PairingEngine> {
        &self.pairing
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one connection to completion. Never panics on transport errors;
    /// they end this connection only.
    pub fn serve(&self, stream: TcpStream) {
        let addr = stream.peer_addr().ok();
        let (mut reader, connection) = match self.open(stream) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(?addr, error = %e, "could not set up connection");
                return;
            }
        };

        let Some(mut guard) = self.register(&mut reader, &connection) else {
            connection.close();
            return;
        };
        self.run(&mut reader, &mut guard);
    }

    fn open(&self, stream: TcpStream) -> io::Result<(BufReader<TcpStream>, Connection)> {
        stream.set_read_timeout(Some(self.config.handshake_timeout))?;
        let connection = Connection::new(stream.try_clone()?, self.config.send_timeout)?;
        Ok((BufReader::new(stream), connection))
    }

    /// Registering state: the first frame must claim a nickname.
    fn register(
        &self,
        reader: &mut BufReader<TcpStream>,
        connection: &Connection,
    ) -> Option<SessionGuard<'_>> {
        let reject = |code: StatusCode, message: String| {
            let _ = connection.send(&ServerMessage::status(code, message));
        };

        let first = match duet_protocol::recv::<_, ClientMessage>(reader) {
            Ok(Some(msg)) => msg,
            Ok(None) => return None,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(addr = ?connection.peer_addr(), error = %e, "malformed handshake frame");
                reject(StatusCode::InvalidFrame, e.to_string());
                return None;
            }
            Err(e) => {
                debug!(addr = ?connection.peer_addr(), error = %e, "handshake read failed");
                return None;
            }
        };

        let (nickname, result) = match first {
            ClientMessage::Register { nickname } => {
                let result = self.registry.register(&nickname, connection.clone());
                (nickname, result)
            }
            ClientMessage::Login { nickname } => {
                let result = self.registry.login(&nickname, connection.clone());
                (nickname, result)
            }
            _ => {
                debug!(addr = ?connection.peer_addr(), "frame before registration");
                reject(
                    StatusCode::NotRegistered,
                    "register a nickname first".into(),
                );
                return None;
            }
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                info!(nickname = %nickname, error = %e, "registration refused");
                reject(e.status_code(), e.to_string());
                return None;
            }
        };

        let guard = SessionGuard {
            relay: self,
            handle,
            nickname,
            connection: connection.clone(),
            exit: Exit::Release,
        };
        let welcome = format!("registered as {}", guard.nickname);
        if guard.reply_status(StatusCode::Registered, welcome).is_err() {
            return None;
        }
        if let Err(e) = reader.get_ref().set_read_timeout(None) {
            warn!(error = %e, "could not clear handshake timeout");
            return None;
        }
        Some(guard)
    }

    /// Idle/Paired states: read frames until the connection ends.
    fn run(&self, reader: &mut BufReader<TcpStream>, guard: &mut SessionGuard<'_>) {
        loop {
            let msg = match duet_protocol::recv::<_, ClientMessage>(reader) {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!(nickname = %guard.nickname, "client closed connection");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(nickname = %guard.nickname, error = %e, "malformed frame");
                    let _ = guard.reply_status(StatusCode::InvalidFrame, e.to_string());
                    break;
                }
                Err(e) => {
                    debug!(nickname = %guard.nickname, error = %e, "read failed");
                    break;
                }
            };

            match self.handle_message(guard, msg) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    debug!(nickname = %guard.nickname, error = %e, "reply failed");
                    break;
                }
            }
        }
    }

    /// Dispatch one frame. An `Err` means our own client is unreachable.
    fn handle_message(
        &self,
        guard: &mut SessionGuard<'_>,
        msg: ClientMessage,
    ) -> Result<Flow, TransportError> {
        match msg {
            ClientMessage::Register { .. } | ClientMessage::Login { .. } => {
                guard.reply_status(
                    StatusCode::InvalidFrame,
                    format!("already registered as {}", guard.nickname),
                )?;
            }
            ClientMessage::Join { peer } => self.join(guard, peer)?,
            ClientMessage::Relay { payload } => self.forward(guard, payload)?,
            ClientMessage::Leave => self.leave(guard)?,
            ClientMessage::ListOnline => {
                let peers = self
                    .registry
                    .online_nicknames()
                    .into_iter()
                    .filter(|n| *n != guard.nickname)
                    .map(|nickname| PeerInfo {
                        paired: self.pairing.is_paired(&nickname),
                        nickname,
                    })
                    .collect();
                guard.reply(ServerMessage::Online { peers })?;
            }
            ClientMessage::Logout => {
                guard.reply_status(StatusCode::LoggedOut, "goodbye")?;
                return Ok(Flow::Close);
            }
            ClientMessage::Deregister => {
                if !self.config.allow_deregister {
                    guard.reply_status(
                        StatusCode::Unsupported,
                        "this relay does not release nicknames",
                    )?;
                    return Ok(Flow::Continue);
                }
                guard.exit = Exit::Deregister;
                let text = format!("{} is free for anyone", guard.nickname);
                guard.reply_status(StatusCode::Deregistered, text)?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Idle → Paired. Failures leave us Idle and are reported.
    fn join(&self, guard: &SessionGuard<'_>, peer: Option<String>) -> Result<(), TransportError> {
        let nickname = guard.nickname.as_str();
        let result = match peer {
            Some(peer) => self.pairing.join(nickname, &peer).map(|()| peer),
            None => self.pairing.join_any(nickname),
        };
        let peer = match result {
            Ok(peer) => peer,
            Err(e) => {
                debug!(nickname, error = %e, "join refused");
                return guard.reply_status(e.status_code(), e.to_string());
            }
        };

        let notice = ServerMessage::peer_status(
            StatusCode::Joined,
            format!("{nickname} joined you"),
            nickname,
        );
        let target = self.registry.lookup(&peer).filter(|v| v.online);
        let sent = match &target {
            Some(view) => view.connection.send(&notice),
            None => Err(TransportError::Closed),
        };
        if let Err(source) = sent {
            let err = RelayError::SendFailed {
                peer: peer.clone(),
                source,
            };
            warn!(nickname, error = %err, "new partner unreachable");
            // The partner never learned about the room, so neither does our
            // client: from its side the join failed.
            self.unpair(nickname, target);
            let err = PairingError::PeerOffline(peer);
            return guard.reply_status(err.status_code(), err.to_string());
        }

        guard.reply(ServerMessage::peer_status(
            StatusCode::Joined,
            format!("paired with {peer}"),
            &peer,
        ))
    }

    /// Paired: forward `payload` verbatim to the partner.
    fn forward(&self, guard: &SessionGuard<'_>, payload: Vec<u8>) -> Result<(), TransportError> {
        let nickname = guard.nickname.as_str();
        let Some(peer) = self.pairing.peer_of(nickname) else {
            let err = RelayError::NotPaired;
            return guard.reply_status(err.status_code(), err.to_string());
        };

        let target = self.registry.lookup(&peer).filter(|v| v.online);
        let sent = match &target {
            Some(view) => view.connection.send(&ServerMessage::Message {
                from: nickname.to_owned(),
                payload,
            }),
            None => Err(TransportError::Closed),
        };
        match sent {
            Ok(()) => {
                debug!(from = nickname, to = %peer, "relayed");
                Ok(())
            }
            Err(source) if !source.is_transport_failure() => {
                let err = RelayError::Undeliverable(source);
                warn!(nickname, error = %err, "refusing payload");
                guard.reply_status(err.status_code(), err.to_string())
            }
            Err(source) => {
                let err = RelayError::SendFailed {
                    peer: peer.clone(),
                    source,
                };
                warn!(nickname, error = %err, "dropping unreachable partner");
                self.drop_peer(guard, &peer, target)
            }
        }
    }

    /// Paired → Idle on request. Both sides hear `PeerLeft`.
    fn leave(&self, guard: &SessionGuard<'_>) -> Result<(), TransportError> {
        let nickname = guard.nickname.as_str();
        let Some(peer) = self.pairing.leave(nickname) else {
            let err = RelayError::NotPaired;
            return guard.reply_status(err.status_code(), err.to_string());
        };
        let notice = ServerMessage::peer_status(
            StatusCode::PeerLeft,
            format!("{nickname} left the room"),
            nickname,
        );
        if let Err(e) = self.notify(&peer, &notice) {
            debug!(peer = %peer, error = %e, "could not tell partner about leave");
        }
        guard.reply(ServerMessage::peer_status(
            StatusCode::PeerLeft,
            "you left the room",
            &peer,
        ))
    }

    /// Paired → Idle after the partner's transport failed: dissolve the
    /// room, take the partner offline, close its transport, tell our client.
    ///
    /// If the room is already gone, the partner's own cleanup beat us to it
    /// and has already sent us `PeerLeft`.
    fn drop_peer(
        &self,
        guard: &SessionGuard<'_>,
        peer: &str,
        failed: Option<SessionView>,
    ) -> Result<(), TransportError> {
        if !self.unpair(&guard.nickname, failed) {
            return Ok(());
        }
        guard.reply(ServerMessage::peer_status(
            StatusCode::PeerLeft,
            format!("{peer} is unreachable"),
            peer,
        ))
    }

    /// End `nickname`'s room with an unreachable partner. Returns whether
    /// this call ended it.
    fn unpair(&self, nickname: &str, failed: Option<SessionView>) -> bool {
        match failed {
            Some(view) => {
                let evicted = self.pairing.evict(nickname, view.handle);
                if evicted {
                    view.connection.close();
                }
                evicted
            }
            // The partner is already offline or gone; only the room is left.
            None => self.pairing.leave(nickname).is_some(),
        }
    }

    /// Best-effort send to another online session.
    fn notify(&self, nickname: &str, msg: &ServerMessage) -> Result<(), TransportError> {
        match self.registry.lookup(nickname) {
            Some(view) if view.online => view.connection.send(msg),
            _ => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufWriter;
    use std::thread;
    use std::time::Duration;

    use duet_protocol::MAX_MESSAGE_SIZE;

    use super::*;
    use crate::connection::tests::{recv_server_msg, tcp_pair, test_connection};

    /// A client socket wired to a relay thread running `serve`.
    struct TestClient {
        reader: BufReader<TcpStream>,
        writer: BufWriter<TcpStream>,
    }

    impl TestClient {
        fn connect(relay: &Arc<Relay>) -> Self {
            let (client, server) = tcp_pair();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let relay = Arc::clone(relay);
            thread::spawn(move || relay.serve(server));
            Self {
                reader: BufReader::new(client.try_clone().unwrap()),
                writer: BufWriter::new(client),
            }
        }

        fn send(&mut self, msg: &ClientMessage) {
            duet_protocol::send(&mut self.writer, msg).unwrap();
        }

        fn recv(&mut self) -> ServerMessage {
            recv_server_msg(&mut self.reader)
        }

        fn expect(&mut self, code: StatusCode) -> ServerMessage {
            let msg = self.recv();
            assert_eq!(msg.code(), Some(code), "got {msg:?}");
            msg
        }

        fn register(relay: &Arc<Relay>, nickname: &str) -> Self {
            let mut client = Self::connect(relay);
            client.send(&ClientMessage::Register {
                nickname: nickname.into(),
            });
            client.expect(StatusCode::Registered);
            client
        }
    }

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new(RelayConfig::default()))
    }

    #[test]
    fn first_frame_must_register() {
        let relay = relay();
        let mut client = TestClient::connect(&relay);
        client.send(&ClientMessage::Join { peer: None });
        client.expect(StatusCode::NotRegistered);
        let end: Option<ServerMessage> = duet_protocol::recv(&mut client.reader).unwrap();
        assert!(end.is_none());
        assert!(relay.registry().is_empty());
    }

    #[test]
    fn join_notifies_both_sides() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");
        let mut bob = TestClient::register(&relay, "bob");

        alice.send(&ClientMessage::Join {
            peer: Some("bob".into()),
        });
        let msg = bob.expect(StatusCode::Joined);
        assert!(matches!(msg, ServerMessage::Status { peer: Some(p), .. } if p == "alice"));
        let msg = alice.expect(StatusCode::Joined);
        assert!(matches!(msg, ServerMessage::Status { peer: Some(p), .. } if p == "bob"));
    }

    #[test]
    fn relay_without_room_is_not_paired() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");
        alice.send(&ClientMessage::Relay {
            payload: b"anyone?".to_vec(),
        });
        alice.expect(StatusCode::NotPaired);
        alice.send(&ClientMessage::Leave);
        alice.expect(StatusCode::NotPaired);
    }

    #[test]
    fn failed_send_unpairs_and_reports_peer_left() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");

        // "bob" is registered directly with a connection that then dies.
        let (bob_conn, _bob_client) = test_connection();
        relay.registry().register("bob", bob_conn.clone()).unwrap();
        relay.pairing().join("alice", "bob").unwrap();
        bob_conn.close();

        alice.send(&ClientMessage::Relay {
            payload: b"hi".to_vec(),
        });
        let msg = alice.expect(StatusCode::PeerLeft);
        assert!(matches!(msg, ServerMessage::Status { peer: Some(p), .. } if p == "bob"));
        assert!(!relay.pairing().is_paired("alice"));
        assert!(!relay.registry().is_online("bob"));

        // Alice is Idle, not disconnected.
        alice.send(&ClientMessage::Relay {
            payload: b"hi".to_vec(),
        });
        alice.expect(StatusCode::NotPaired);
    }

    #[test]
    fn join_with_dead_partner_reports_peer_offline() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");
        let (bob_conn, _bob_client) = test_connection();
        relay.registry().register("bob", bob_conn.clone()).unwrap();
        bob_conn.close();

        alice.send(&ClientMessage::Join {
            peer: Some("bob".into()),
        });
        let msg = alice.expect(StatusCode::PeerOffline);
        assert!(matches!(msg, ServerMessage::Status { message, .. } if message.contains("bob")));
        assert!(!relay.pairing().is_paired("alice"));
        assert!(!relay.registry().is_online("bob"));
    }

    #[test]
    fn oversized_forward_is_refused_and_partner_kept() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");
        let mut bob = TestClient::register(&relay, "bob");
        alice.send(&ClientMessage::Join {
            peer: Some("bob".into()),
        });
        bob.expect(StatusCode::Joined);
        alice.expect(StatusCode::Joined);

        // The largest payload whose Relay frame fits; wrapped in a Message
        // with the sender's nickname, it no longer does.
        let limit = MAX_MESSAGE_SIZE as usize;
        let empty = serde_json::to_vec(&ClientMessage::Relay {
            payload: Vec::new(),
        })
        .unwrap()
        .len();
        let payload = vec![0u8; (limit + 1 - empty) / 2];
        let inbound = ClientMessage::Relay {
            payload: payload.clone(),
        };
        assert!(serde_json::to_vec(&inbound).unwrap().len() <= limit);
        let outbound = ServerMessage::Message {
            from: "alice".into(),
            payload,
        };
        assert!(serde_json::to_vec(&outbound).unwrap().len() > limit);

        alice.send(&inbound);
        alice.expect(StatusCode::InvalidFrame);
        assert!(relay.registry().is_online("bob"));
        assert_eq!(relay.pairing().peer_of("alice").as_deref(), Some("bob"));

        alice.send(&ClientMessage::Relay {
            payload: b"small".to_vec(),
        });
        assert_eq!(
            bob.recv(),
            ServerMessage::Message {
                from: "alice".into(),
                payload: b"small".to_vec(),
            }
        );
    }

    #[test]
    fn deregister_needs_opt_in() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");
        alice.send(&ClientMessage::Deregister);
        alice.expect(StatusCode::Unsupported);

        let relay = Arc::new(Relay::new(RelayConfig {
            allow_deregister: true,
            ..RelayConfig::default()
        }));
        let mut alice = TestClient::register(&relay, "alice");
        alice.send(&ClientMessage::Deregister);
        alice.expect(StatusCode::Deregistered);
        let end: Option<ServerMessage> = duet_protocol::recv(&mut alice.reader).unwrap();
        assert!(end.is_none());
        // The socket is closed only after the session is removed.
        assert!(relay.registry().lookup("alice").is_none());
    }

    #[test]
    fn list_online_excludes_self() {
        let relay = relay();
        let mut alice = TestClient::register(&relay, "alice");
        let _bob = TestClient::register(&relay, "bob");
        let _carol = TestClient::register(&relay, "carol");
        relay.pairing().join("bob", "carol").unwrap();

        alice.send(&ClientMessage::ListOnline);
        match alice.recv() {
            ServerMessage::Online { peers } => {
                assert_eq!(
                    peers,
                    vec![
                        PeerInfo {
                            nickname: "bob".into(),
                            paired: true
                        },
                        PeerInfo {
                            nickname: "carol".into(),
                            paired: true
                        },
                    ]
                );
            }
            other => panic!("expected Online, got {other:?}"),
        }
    }
}
