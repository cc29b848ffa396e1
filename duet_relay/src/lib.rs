// duet_relay — pairwise nickname relay.
//
// Clients connect over TCP, claim a nickname, pair up into exclusive
// two-party rooms, and exchange opaque payloads through the relay. The relay
// never interprets payloads.
//
// Module overview:
// - `session.rs`:    `Session` (nickname, connection, online flag) and the
//                    `SessionId`/`SessionHandle` arena handles.
// - `registry.rs`:   `Registry`, the authoritative nickname → session map.
// - `pairing.rs`:    `PairingEngine`, rooms and the one-room-per-nickname
//                    rule, including "match me" with a `MatchPolicy`.
// - `relay.rs`:      The per-connection relay loop (`Relay::serve`).
// - `connection.rs`: Write half of a client socket; serialized, bounded
//                    writes and idempotent close.
// - `server.rs`:     TCP listener and thread-per-connection dispatch.
// - `client.rs`:     Blocking client with a background reader thread.
// - `config.rs`:     `RelayConfig`.
// - `error.rs`:      Error taxonomy and its mapping to wire status codes.
//
// Dependencies: `duet_protocol` (message types and framing).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_relay`).

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod pairing;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use config::{MatchPolicy, RelayConfig};
pub use server::{RelayHandle, start_relay};
