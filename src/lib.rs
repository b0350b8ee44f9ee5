//! pvdd client library
//!
//! Talks to the pvdd daemon, which manages Provisioning Domains (PvDs) and
//! their JSON attributes, over its line-oriented TCP protocol on localhost.
//!
//! - `protocol` - line splitting, multi-line block framing, message decoding
//!   and command encoding
//! - `events` - named signals and the listener registry
//! - `connection` - one socket with a reader thread and optional
//!   auto-reconnect
//! - `sync` - blocking getters with timeouts on a private second socket
//!
//! # Event-driven use
//!
//! ```ignore
//! use pvdd_client::{listener, ConnectOptions, PvdEvent, PvddConnection, Signal};
//!
//! let conn = PvddConnection::new();
//! conn.subscribe(Signal::PvdList, listener(|event| {
//!     if let PvdEvent::PvdList(pvds) = event {
//!         println!("{:?}", pvds);
//!     }
//! }));
//! conn.connect(ConnectOptions::default().auto_reconnect(true));
//! conn.get_list()?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod sync;

pub use config::ConnectOptions;
pub use connection::{ConnectionState, PvddConnection};
pub use error::PvddError;
pub use events::{listener, EventBus, Listener, Propagation, Signal};
pub use protocol::{Command, PvdEvent};
pub use sync::SyncClient;
