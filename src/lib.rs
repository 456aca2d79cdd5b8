//! Directory-backed zone engine for an embedded name server.
//!
//! Zones and records live as entries in a directory service; this crate
//! keeps them projected into in-memory zone databases and keeps both
//! sides aligned:
//!
//!   * a persistent-refresh stream feeds every directory change into a
//!     dispatcher ([`sync`], [`dispatch`]),
//!   * master-zone entries are diffed against the live database and
//!     applied minimally with correct SOA-serial handling ([`projector`],
//!     [`diff`]),
//!   * record entries update single nodes the same way ([`record`]),
//!   * dynamic updates accepted by the host flow back into the directory,
//!     with automatic PTR pairing for address records ([`writeback`]),
//!   * a fixed pool of directory connections carries all of it ([`pool`]).
//!
//! The name-server runtime and the directory protocol library stay
//! outside; [`ldap`] defines the traits this crate consumes.

#[macro_use]
pub mod error;

pub mod codec;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod entry;
pub mod forward;
pub mod fs;
pub mod instance;
pub mod journal;
pub mod ldap;
pub mod logger;
pub mod pool;
pub mod projector;
pub mod record;
pub mod register;
pub mod settings;
pub mod sync;
pub mod task;
pub mod writeback;
pub mod zone;

pub use codec::DnsName;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use instance::{find_instance, register_instance, unregister_instance, Instance};
