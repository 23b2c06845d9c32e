// turnhub_relay — the message hub for turn-based coordination.
//
// The hub is a thin relay: participants (an authority, players, observers)
// connect over TCP, register under a session id and a participant id, and
// exchange opaque payloads addressed by participant id. The hub never decodes
// game messages and knows nothing about turns; all game logic lives in the
// participants (see `turnhub_authority`).
//
// Module overview:
// - `registry.rs`: Who is registered in which session, connected or not, and
//                  when they were last heard from.
// - `mailbox.rs`:  Bounded per-recipient queue for messages addressed to a
//                  registered but disconnected participant.
// - `hub.rs`:      The central state the event loop drives: handshake,
//                  routing, queue-and-flush, leave, liveness sweep.
// - `server.rs`:   TCP listener, one reader thread per connection, and the
//                  main event loop. Uses `std::net` with a thread-per-reader
//                  architecture and an `mpsc` channel to funnel events into
//                  the single-threaded `Hub`.
// - `client.rs`:   `HubClient`, the participant side of the connection, plus
//                  reconnect backoff.
// - `config.rs`:   `HubConfig`, loadable from TOML.
//
// The hub can run as a standalone binary (`main.rs`) or be embedded in a
// process via the library API (`start_hub`).

pub mod client;
pub mod config;
pub mod hub;
pub mod mailbox;
pub mod registry;
pub mod server;

pub use client::{Backoff, ClientError, HubClient, Welcome};
pub use config::HubConfig;
pub use server::{HubHandle, start_hub};
