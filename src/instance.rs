//! One loaded plugin instance: configuration, connection pool, registers,
//! settings stack and task handles, plus the process-wide instance
//! registry dispatched tasks use to find their way back by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{Notify, Semaphore};

use crate::config::Config;
use crate::entry::Entry;
use crate::error::Result;
use crate::forward::ForwardRegister;
use crate::ldap::DirBackend;
use crate::pool::ConnPool;
use crate::register::ZoneRegister;
use crate::settings::{SettingsSet, Spec, Value};
use crate::sync::SyncBarrier;
use crate::task::Task;
use crate::zone::ZoneView;

/// Setting keys shared by the layers.
pub mod keys {
    pub const CONNECTIONS: &str = "connections";
    pub const RECONNECT_INTERVAL: &str = "reconnect_interval";
    pub const TIMEOUT: &str = "timeout";
    pub const DYN_UPDATE: &str = "dyn_update";
    pub const SYNC_PTR: &str = "sync_ptr";
    pub const FAKE_MNAME: &str = "fake_mname";
    pub const VERBOSE_CHECKS: &str = "verbose_checks";
    pub const UPDATE_POLICY: &str = "update_policy";
    pub const FORWARD_POLICY: &str = "forward_policy";
    pub const FORWARDERS: &str = "forwarders";
    pub const ALLOW_QUERY: &str = "allow_query";
    pub const ALLOW_TRANSFER: &str = "allow_transfer";
}

/// In-flight entry events allowed before the stream consumer blocks.
pub const DISPATCH_CONCURRENCY: usize = 25;

pub struct Instance {
    name: String,
    pub config: Arc<Config>,
    pub backend: Arc<dyn DirBackend>,
    pub pool: Arc<ConnPool>,
    pub register: Arc<ZoneRegister>,
    pub forward: Arc<ForwardRegister>,
    pub view: Arc<ZoneView>,
    pub local_settings: Arc<SettingsSet>,
    pub global_settings: Arc<SettingsSet>,
    pub barrier: Arc<SyncBarrier>,
    /// The instance task: config and forward-zone work, and the fallback
    /// for zones that have no task yet.
    pub task: Task,
    pub dispatch_sem: Arc<Semaphore>,
    /// Single-writer token for mutations of shared zone-manager state
    /// (view shape, register membership). A cooperative barrier, not a
    /// data lock.
    pub exclusive: tokio::sync::Mutex<()>,
    exiting: AtomicBool,
    pub wake: Notify,
    tainted: AtomicBool,
}

impl Instance {
    pub fn new(name: &str, config: Config, backend: Arc<dyn DirBackend>) -> Arc<Instance> {
        let config = Arc::new(config);

        let local_settings = SettingsSet::new(
            "local",
            None,
            &[
                Spec::required(keys::CONNECTIONS, Value::Uint(0)),
                Spec::required(keys::RECONNECT_INTERVAL, Value::Uint(0)),
                Spec::required(keys::TIMEOUT, Value::Uint(0)),
                Spec::optional(keys::DYN_UPDATE, Value::Bool(false)),
                Spec::optional(keys::SYNC_PTR, Value::Bool(false)),
                Spec::optional(keys::FAKE_MNAME, Value::Str(String::new())),
                Spec::optional(keys::VERBOSE_CHECKS, Value::Bool(false)),
            ],
        );
        let fill = [
            (keys::CONNECTIONS, Value::Uint(config.connections)),
            (
                keys::RECONNECT_INTERVAL,
                Value::Uint(config.reconnect_interval as u32),
            ),
            (keys::TIMEOUT, Value::Uint(config.timeout as u32)),
            (keys::DYN_UPDATE, Value::Bool(config.dyn_update)),
            (keys::SYNC_PTR, Value::Bool(config.sync_ptr)),
            (
                keys::FAKE_MNAME,
                Value::Str(config.fake_mname.clone().unwrap_or_default()),
            ),
            (keys::VERBOSE_CHECKS, Value::Bool(config.verbose_checks)),
        ];
        for (key, value) in fill {
            local_settings
                .set(key, value)
                .expect("local layer misses a built-in key");
        }
        debug_assert!(local_settings.is_filled());

        let global_settings = SettingsSet::new(
            "global",
            Some(local_settings.clone()),
            &[
                Spec::optional(keys::DYN_UPDATE, Value::Bool(false)),
                Spec::optional(keys::SYNC_PTR, Value::Bool(false)),
                Spec::optional(keys::FORWARD_POLICY, Value::Str(String::new())),
                Spec::optional(keys::FORWARDERS, Value::Str(String::new())),
            ],
        );

        let pool = ConnPool::new(config.clone(), backend.clone());

        Arc::new(Instance {
            name: name.to_string(),
            config,
            backend,
            pool,
            register: ZoneRegister::new(),
            forward: ForwardRegister::new(),
            view: ZoneView::new(),
            local_settings,
            global_settings,
            barrier: SyncBarrier::new(),
            task: Task::spawn(&format!("inst-{}", name)),
            dispatch_sem: Arc::new(Semaphore::new(DISPATCH_CONCURRENCY)),
            exclusive: tokio::sync::Mutex::new(()),
            exiting: AtomicBool::new(false),
            wake: Notify::new(),
            tainted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir(&self.name)
    }

    /// Per-zone settings layer inheriting from the global one.
    pub fn new_zone_settings(&self, zone: &str) -> Arc<SettingsSet> {
        SettingsSet::new(
            zone,
            Some(self.global_settings.clone()),
            &[
                Spec::optional(keys::DYN_UPDATE, Value::Bool(false)),
                Spec::optional(keys::SYNC_PTR, Value::Bool(false)),
                Spec::optional(keys::UPDATE_POLICY, Value::Str(String::new())),
                Spec::optional(keys::FORWARD_POLICY, Value::Str(String::new())),
                Spec::optional(keys::FORWARDERS, Value::Str(String::new())),
                Spec::optional(keys::ALLOW_QUERY, Value::Str(String::new())),
                Spec::optional(keys::ALLOW_TRANSFER, Value::Str(String::new())),
            ],
        )
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Flags the shutdown and wakes every blocking wait.
    pub fn shutdown(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn check_exiting(&self) -> Result<()> {
        if self.exiting() {
            Err(error!(Shutdown => "instance '{}' is shutting down", self.name))
        } else {
            Ok(())
        }
    }

    /// Marks the instance as possibly divergent from the directory; the
    /// only way back is an operator-driven reload.
    pub fn taint(&self, why: &str) {
        if !self.tainted.swap(true, Ordering::SeqCst) {
            log::error!(
                target: "sync",
                "instance '{}' may be out of sync ({}); reload the instance to recover",
                self.name,
                why
            );
        }
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }

    /// Applies a configuration entry to the global settings layer.
    pub fn configure(&self, entry: &Entry) -> Result<()> {
        self.global_settings.update_from_entry(
            entry,
            &[
                (keys::DYN_UPDATE, "idnsAllowDynUpdate"),
                (keys::SYNC_PTR, "idnsAllowSyncPTR"),
                (keys::FORWARD_POLICY, "idnsForwardPolicy"),
            ],
        )?;
        // idnsForwarders is multi-valued and travels as one joined string.
        match entry.values("idnsForwarders") {
            Some(values) => self
                .global_settings
                .set(keys::FORWARDERS, Value::Str(values.join(" ")))?,
            None => self.global_settings.unset(keys::FORWARDERS)?,
        }
        log::info!(target: "sync", "instance '{}' reconfigured from {}", self.name, entry.dn());
        Ok(())
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Instance>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<Instance>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Publishes an instance under its name.
pub fn register_instance(instance: Arc<Instance>) -> Result<()> {
    let mut instances = registry().lock().expect("instance registry poisoned");
    if instances.contains_key(instance.name()) {
        return Err(error!(Exists => "instance '{}' is already registered", instance.name()));
    }
    instances.insert(instance.name().to_string(), instance);
    Ok(())
}

pub fn find_instance(name: &str) -> Option<Arc<Instance>> {
    let instances = registry().lock().expect("instance registry poisoned");
    instances.get(name).cloned()
}

/// Removes an instance and signals its shutdown.
pub fn unregister_instance(name: &str) -> Result<Arc<Instance>> {
    let mut instances = registry().lock().expect("instance registry poisoned");
    let instance = instances
        .remove(name)
        .ok_or_else(|| error!(NotFound => "instance '{}' is not registered", name))?;
    instance.shutdown();
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ldap::{DirConn, RawEntry};

    struct NullBackend;

    #[async_trait]
    impl DirBackend for NullBackend {
        async fn connect(&self, _config: &Config) -> Result<Box<dyn DirConn>> {
            Err(error!(NotConnected))
        }
    }

    fn instance(name: &str) -> Arc<Instance> {
        let config = Config::try_from(
            "uri: ldap://localhost\n\
             base: cn=dns, dc=example,dc=test\n\
             sync_ptr: true\n"
                .as_bytes(),
        )
        .unwrap();
        Instance::new(name, config, Arc::new(NullBackend))
    }

    #[tokio::test]
    async fn zone_settings_inherit_from_config() {
        let instance = instance("inherit");
        let zone = instance.new_zone_settings("example.org.");

        // nothing set on the zone or global layer: the config value shows
        assert!(zone.get_bool(keys::SYNC_PTR).unwrap());
        assert!(!zone.get_bool(keys::DYN_UPDATE).unwrap());

        zone.set(keys::SYNC_PTR, Value::Bool(false)).unwrap();
        assert!(!zone.get_bool(keys::SYNC_PTR).unwrap());
    }

    #[tokio::test]
    async fn configure_updates_the_global_layer() {
        let instance = instance("configure");
        let raw = RawEntry::new("cn=dns, dc=example,dc=test")
            .with_attr("objectClass", &["idnsConfigObject"])
            .with_attr("idnsAllowDynUpdate", &["TRUE"])
            .with_attr("idnsForwarders", &["192.0.2.53", "192.0.2.54"]);
        let entry = Entry::from_raw(crate::ldap::ChangeType::Modify, raw);

        instance.configure(&entry).unwrap();
        assert!(instance.global_settings.get_bool(keys::DYN_UPDATE).unwrap());
        assert_eq!(
            instance.global_settings.get_str(keys::FORWARDERS).unwrap(),
            "192.0.2.53 192.0.2.54"
        );

        // a config entry without the attribute resumes the config default
        let raw = RawEntry::new("cn=dns, dc=example,dc=test")
            .with_attr("objectClass", &["idnsConfigObject"]);
        let entry = Entry::from_raw(crate::ldap::ChangeType::Modify, raw);
        instance.configure(&entry).unwrap();
        assert!(!instance.global_settings.get_bool(keys::DYN_UPDATE).unwrap());
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let instance = instance("registry");
        register_instance(instance.clone()).unwrap();
        assert!(register_instance(instance.clone()).is_err());

        let found = find_instance("registry").unwrap();
        assert_eq!(found.name(), "registry");

        let removed = unregister_instance("registry").unwrap();
        assert!(removed.exiting());
        assert!(find_instance("registry").is_none());
    }
}
