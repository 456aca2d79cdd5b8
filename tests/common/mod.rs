//! A scripted in-memory directory for engine tests: entries, a
//! persistent-refresh event queue, and optional echoing of the engine's
//! own writes back into the stream.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use dirzone::codec::dn_canonical;
use dirzone::config::Config;
use dirzone::error::Result;
use dirzone::ldap::{ChangeType, DirBackend, DirConn, Mod, RawEntry, Scope, SyncEvent};

#[derive(Default)]
struct Store {
    entries: BTreeMap<String, RawEntry>,
    queue: VecDeque<SyncEvent>,
    /// Echo engine writes as stream events; flipped on by `refresh_done`.
    echo: bool,
    /// Count of write operations the engine performed.
    writes: usize,
}

#[derive(Clone)]
pub struct MockDirectory {
    store: Arc<Mutex<Store>>,
    notify: Arc<Notify>,
}

impl MockDirectory {
    pub fn new() -> MockDirectory {
        MockDirectory {
            store: Arc::new(Mutex::new(Store::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn DirBackend> {
        Arc::new(MockBackend {
            directory: self.clone(),
        })
    }

    /// Inserts an entry without emitting an event; it will be streamed by
    /// the initial refresh.
    pub fn seed(&self, entry: RawEntry) {
        let mut store = self.store.lock().unwrap();
        store.entries.insert(dn_canonical(&entry.dn), entry);
    }

    fn push(&self, event: SyncEvent) {
        let mut store = self.store.lock().unwrap();
        store.queue.push_back(event);
        drop(store);
        self.notify.notify_waiters();
    }

    pub fn push_add(&self, entry: RawEntry) {
        {
            let mut store = self.store.lock().unwrap();
            store.entries.insert(dn_canonical(&entry.dn), entry.clone());
        }
        self.push(SyncEvent::Entry {
            change: ChangeType::Add,
            entry,
        });
    }

    pub fn push_modify(&self, entry: RawEntry) {
        {
            let mut store = self.store.lock().unwrap();
            store.entries.insert(dn_canonical(&entry.dn), entry.clone());
        }
        self.push(SyncEvent::Entry {
            change: ChangeType::Modify,
            entry,
        });
    }

    /// Re-emits the stored entry as a modify event (a directory echo).
    pub fn push_echo(&self, dn: &str) {
        let entry = self.entry(dn).expect("echo of unknown entry");
        self.push(SyncEvent::Entry {
            change: ChangeType::Modify,
            entry,
        });
    }

    pub fn push_delete(&self, dn: &str) {
        {
            let mut store = self.store.lock().unwrap();
            store.entries.remove(&dn_canonical(dn));
        }
        self.push(SyncEvent::Entry {
            change: ChangeType::Delete,
            entry: RawEntry::new(dn),
        });
    }

    /// Ends the initial refresh and starts echoing engine writes.
    pub fn refresh_done(&self) {
        {
            let mut store = self.store.lock().unwrap();
            store.echo = true;
        }
        self.push(SyncEvent::RefreshDone);
    }

    pub fn entry(&self, dn: &str) -> Option<RawEntry> {
        let store = self.store.lock().unwrap();
        store.entries.get(&dn_canonical(dn)).cloned()
    }

    pub fn attr(&self, dn: &str, attribute: &str) -> Vec<String> {
        self.entry(dn)
            .map(|entry| {
                entry
                    .attrs
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
                    .map(|(_, values)| values.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn writes(&self) -> usize {
        let store = self.store.lock().unwrap();
        store.writes
    }

    fn apply_mods(store: &mut Store, dn: &str, mods: &[Mod]) -> Result<()> {
        let key = dn_canonical(dn);
        let entry = store
            .entries
            .get_mut(&key)
            .ok_or_else(|| dirzone::Error::new(dirzone::ErrorKind::NotFound))?;
        for m in mods {
            let slot = entry
                .attrs
                .iter_mut()
                .position(|(name, _)| name.eq_ignore_ascii_case(m.attribute()));
            match m {
                Mod::Add(attribute, values) => match slot {
                    Some(i) => entry.attrs[i].1.extend(values.iter().cloned()),
                    None => entry.attrs.push((attribute.clone(), values.clone())),
                },
                Mod::Replace(attribute, values) => match slot {
                    Some(i) => entry.attrs[i].1 = values.clone(),
                    None => entry.attrs.push((attribute.clone(), values.clone())),
                },
                Mod::Delete(_, values) => {
                    let Some(i) = slot else {
                        return Err(dirzone::Error::new(dirzone::ErrorKind::NotFound));
                    };
                    if values.is_empty() {
                        entry.attrs.remove(i);
                    } else {
                        entry.attrs[i].1.retain(|v| !values.contains(v));
                        if entry.attrs[i].1.is_empty() {
                            entry.attrs.remove(i);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

struct MockBackend {
    directory: MockDirectory,
}

#[async_trait]
impl DirBackend for MockBackend {
    async fn connect(&self, _config: &Config) -> Result<Box<dyn DirConn>> {
        Ok(Box::new(MockConn {
            directory: self.directory.clone(),
        }))
    }
}

struct MockConn {
    directory: MockDirectory,
}

#[async_trait]
impl DirConn for MockConn {
    async fn bind(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }

    async fn search(
        &mut self,
        base: &str,
        _scope: Scope,
        _filter: &str,
        _attrs: &[&str],
    ) -> Result<Vec<RawEntry>> {
        let store = self.directory.store.lock().unwrap();
        let base = dn_canonical(base);
        Ok(store
            .entries
            .values()
            .filter(|entry| dn_canonical(&entry.dn).ends_with(&base))
            .cloned()
            .collect())
    }

    async fn modify(&mut self, dn: &str, mods: &[Mod]) -> Result<()> {
        let mut store = self.directory.store.lock().unwrap();
        store.writes += 1;
        MockDirectory::apply_mods(&mut store, dn, mods)?;
        if store.echo {
            let entry = store.entries[&dn_canonical(dn)].clone();
            store.queue.push_back(SyncEvent::Entry {
                change: ChangeType::Modify,
                entry,
            });
            drop(store);
            self.directory.notify.notify_waiters();
        }
        Ok(())
    }

    async fn add(&mut self, dn: &str, attrs: &[(String, Vec<String>)]) -> Result<()> {
        let mut store = self.directory.store.lock().unwrap();
        store.writes += 1;
        let key = dn_canonical(dn);
        if store.entries.contains_key(&key) {
            return Err(dirzone::Error::new(dirzone::ErrorKind::Exists));
        }
        let entry = RawEntry {
            dn: dn.to_string(),
            attrs: attrs.to_vec(),
        };
        store.entries.insert(key, entry.clone());
        if store.echo {
            store.queue.push_back(SyncEvent::Entry {
                change: ChangeType::Add,
                entry,
            });
            drop(store);
            self.directory.notify.notify_waiters();
        }
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        let mut store = self.directory.store.lock().unwrap();
        store.writes += 1;
        let key = dn_canonical(dn);
        if store.entries.remove(&key).is_none() {
            return Err(dirzone::Error::new(dirzone::ErrorKind::NotFound));
        }
        if store.echo {
            store.queue.push_back(SyncEvent::Entry {
                change: ChangeType::Delete,
                entry: RawEntry::new(dn),
            });
            drop(store);
            self.directory.notify.notify_waiters();
        }
        Ok(())
    }

    async fn sync_open(&mut self, _base: &str, _filter: &str) -> Result<()> {
        // The initial refresh streams every stored entry ahead of whatever
        // the test queued, parents before children the way a subtree
        // search walks the tree.
        let mut store = self.directory.store.lock().unwrap();
        let mut entries: Vec<RawEntry> = store.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.dn.matches(',').count());
        let mut initial: VecDeque<SyncEvent> = entries
            .into_iter()
            .map(|entry| SyncEvent::Entry {
                change: ChangeType::Add,
                entry,
            })
            .collect();
        initial.append(&mut store.queue);
        store.queue = initial;
        drop(store);
        self.directory.notify.notify_waiters();
        Ok(())
    }

    async fn sync_recv(&mut self) -> Result<SyncEvent> {
        loop {
            let notified = self.directory.notify.notified();
            tokio::pin!(notified);
            {
                let mut store = self.directory.store.lock().unwrap();
                if let Some(event) = store.queue.pop_front() {
                    return Ok(event);
                }
            }
            notified.await;
        }
    }
}

/// Polls until `cond` holds or the test times out.
pub async fn wait_for<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Lets queued events drain through the engine.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
