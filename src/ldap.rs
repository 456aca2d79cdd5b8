//! Interface consumed from the directory protocol library.
//!
//! The engine never speaks the wire protocol itself; it drives a
//! [`DirConn`] obtained from a [`DirBackend`]. The host links a real
//! implementation, tests plug in a scripted one.

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;

/// Filter selecting every entry class the engine reacts to.
pub const SYNC_FILTER: &str = "(|(objectClass=idnsConfigObject)\
                               (objectClass=idnsZone)\
                               (objectClass=idnsForwardZone)\
                               (objectClass=idnsRecord))";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    One,
    Sub,
}

/// Change kind attached to a persistent-refresh event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    /// Renames are folded into a delete of the old DN; the add leg of the
    /// rename arrives as a plain [`ChangeType::Add`] on the new DN.
    ModDn,
}

impl ChangeType {
    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeType::Delete | ChangeType::ModDn)
    }
}

/// A single attribute modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mod {
    Add(String, Vec<String>),
    Delete(String, Vec<String>),
    Replace(String, Vec<String>),
}

impl Mod {
    pub fn attribute(&self) -> &str {
        match self {
            Mod::Add(attr, _) | Mod::Delete(attr, _) | Mod::Replace(attr, _) => attr,
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            Mod::Add(_, values) | Mod::Delete(_, values) | Mod::Replace(_, values) => values,
        }
    }
}

/// An entry as the protocol library hands it over: DN plus attribute
/// values, nothing interpreted yet.
#[derive(Debug, Clone, Default)]
pub struct RawEntry {
    pub dn: String,
    pub attrs: Vec<(String, Vec<String>)>,
}

impl RawEntry {
    pub fn new(dn: &str) -> Self {
        RawEntry {
            dn: dn.to_string(),
            attrs: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, values: &[&str]) -> Self {
        self.attrs.push((
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }
}

/// One message out of the persistent-refresh stream.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Entry {
        change: ChangeType,
        entry: RawEntry,
    },
    /// The initial refresh pass is complete; live streaming follows.
    RefreshDone,
    /// Search references are not followed.
    Reference,
}

/// Factory for directory connections.
#[async_trait]
pub trait DirBackend: Send + Sync {
    async fn connect(&self, config: &Config) -> Result<Box<dyn DirConn>>;
}

/// A single directory connection. Implementations need not be internally
/// synchronized; the pool guarantees one user at a time.
#[async_trait]
pub trait DirConn: Send {
    /// (Re)binds the connection with the configured method. GSSAPI
    /// credential acquisition failures surface as `NotConnected` so the
    /// reconnect machinery retries.
    async fn bind(&mut self, config: &Config) -> Result<()>;

    async fn search(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<RawEntry>>;

    async fn modify(&mut self, dn: &str, mods: &[Mod]) -> Result<()>;

    async fn add(&mut self, dn: &str, attrs: &[(String, Vec<String>)]) -> Result<()>;

    async fn delete(&mut self, dn: &str) -> Result<()>;

    /// Opens a persistent-refresh search; events are drained with
    /// [`DirConn::sync_recv`].
    async fn sync_open(&mut self, base: &str, filter: &str) -> Result<()>;

    /// Blocks until the next sync event. Cancellation-safe: callers select
    /// against the instance wake signal.
    async fn sync_recv(&mut self) -> Result<SyncEvent>;
}
