//! Remex: remote method invocation and distributed mutual exclusion among peers
//!
//! This crate lets a dynamic set of peers call methods on each other over TCP
//! and share a single resource without a central coordinator.
//!
//! It consists of
//!
//!   * a [transport](rpc) of stubs and skeletons exchanging one line of JSON per request and response,
//!   * a [name service](name_service) assigning peer ids and listing the peers of a type,
//!   * a [membership registry](peer_list) of the live peers, kept current as peers join and leave,
//!   * a [distributed lock](lock) passing a single token between the peers,
//!   * a [member](member) assembling these into one participant, and
//!   * a [fortune database](fortune) protected by the distributed lock.
//!
//! # Example
//!
//! ```no_run
//! use remex::{fortune::{Database, FortuneServer}, name_service::{NameService, NameServiceClient}, Cfg};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_, ns) = NameService::spawn("127.0.0.1:0", Cfg::default()).await.unwrap();
//!     let ns = NameServiceClient::at(ns.local_addr(), Cfg::default());
//!
//!     let db = Database::open("fortunes.db").await.unwrap();
//!     let server = FortuneServer::join(Cfg::default(), "0.0.0.0:0", ns, db).await.unwrap();
//!     server.write("A journey of a thousand miles begins with a single step.").await.unwrap();
//!     println!("{:?}", server.read().await.unwrap());
//!     server.leave().await.unwrap();
//! }
//! ```
//!
//! # Logging
//!
//! Logging is done through the [log] crate.
//! Wire lines are logged at trace level and token movements at info level.
//!

mod cfg;
pub mod fortune;
pub mod lock;
pub mod member;
pub mod name_service;
pub mod peer;
pub mod peer_list;
pub mod rpc;

pub use cfg::Cfg;

/// Peer id assigned by the name service.
pub type PeerId = u64;
