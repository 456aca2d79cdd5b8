//! Stacked key→value configuration. Reads resolve from the innermost
//! layer outward (per-zone → global → local); writes land in one named
//! layer. Updates driven by a directory entry are atomic per key and can
//! roll back wholesale.

use std::sync::{Arc, RwLock};

use crate::entry::Entry;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Uint(u32),
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Uint(_) => "unsigned integer",
            Value::Bool(_) => "boolean",
        }
    }

    fn same_type(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Parses attribute text with the type of `self` as the template.
    fn parse_as(&self, text: &str) -> Result<Value> {
        let text = text.trim();
        match self {
            Value::Str(_) => Ok(Value::Str(text.to_string())),
            Value::Uint(_) => text
                .parse::<u32>()
                .map(Value::Uint)
                .map_err(|_| error!(UnexpectedToken => "'{}' is not an unsigned integer", text)),
            Value::Bool(_) => match text {
                t if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("yes") => {
                    Ok(Value::Bool(true))
                }
                t if t.eq_ignore_ascii_case("false") || t.eq_ignore_ascii_case("no") => {
                    Ok(Value::Bool(false))
                }
                _ => Err(error!(UnexpectedToken => "'{}' is not a boolean", text)),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    key: &'static str,
    /// Template carrying the slot's type; also the fallback value when the
    /// slot itself counts as optional.
    default: Value,
    has_default: bool,
    value: Option<Value>,
}

/// One layer of the settings stack.
#[derive(Debug)]
pub struct SettingsSet {
    name: String,
    parent: Option<Arc<SettingsSet>>,
    slots: RwLock<Vec<Slot>>,
}

/// Slot specification: key, type template, whether the template doubles as
/// a default value.
pub struct Spec {
    pub key: &'static str,
    pub template: Value,
    pub optional: bool,
}

impl Spec {
    pub fn required(key: &'static str, template: Value) -> Spec {
        Spec {
            key,
            template,
            optional: false,
        }
    }

    pub fn optional(key: &'static str, template: Value) -> Spec {
        Spec {
            key,
            template,
            optional: true,
        }
    }
}

impl SettingsSet {
    pub fn new(name: &str, parent: Option<Arc<SettingsSet>>, specs: &[Spec]) -> Arc<SettingsSet> {
        let slots = specs
            .iter()
            .map(|spec| Slot {
                key: spec.key,
                default: spec.template.clone(),
                has_default: spec.optional,
                value: None,
            })
            .collect();
        Arc::new(SettingsSet {
            name: name.to_string(),
            parent,
            slots: RwLock::new(slots),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves a key, walking the parent chain, falling back to the
    /// innermost default on the way.
    pub fn get(&self, key: &str) -> Result<Value> {
        let mut layer = Some(self);
        let mut default = None;
        while let Some(set) = layer {
            let slots = set.slots.read().expect("settings lock poisoned");
            if let Some(slot) = slots.iter().find(|slot| slot.key == key) {
                if let Some(value) = &slot.value {
                    return Ok(value.clone());
                }
                if slot.has_default && default.is_none() {
                    default = Some(slot.default.clone());
                }
            }
            drop(slots);
            layer = set.parent.as_deref();
        }
        default.ok_or_else(|| error!(NotFound => "setting '{}' is not defined", key))
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        match self.get(key)? {
            Value::Str(v) => Ok(v),
            other => Err(error!(NotImplemented => "'{}' is a {}", key, other.type_name())),
        }
    }

    pub fn get_uint(&self, key: &str) -> Result<u32> {
        match self.get(key)? {
            Value::Uint(v) => Ok(v),
            other => Err(error!(NotImplemented => "'{}' is a {}", key, other.type_name())),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.get(key)? {
            Value::Bool(v) => Ok(v),
            other => Err(error!(NotImplemented => "'{}' is a {}", key, other.type_name())),
        }
    }

    /// Sets a key in this layer; the value type must match the slot type.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut slots = self.slots.write().expect("settings lock poisoned");
        let slot = slots
            .iter_mut()
            .find(|slot| slot.key == key)
            .ok_or_else(|| error!(NotFound => "layer '{}' has no setting '{}'", self.name, key))?;
        if !slot.default.same_type(&value) {
            return Err(error!(NotImplemented =>
                "setting '{}' expects a {}, got a {}",
                key,
                slot.default.type_name(),
                value.type_name()
            ));
        }
        slot.value = Some(value);
        Ok(())
    }

    /// Clears a key in this layer so inheritance resumes.
    pub fn unset(&self, key: &str) -> Result<()> {
        let mut slots = self.slots.write().expect("settings lock poisoned");
        let slot = slots
            .iter_mut()
            .find(|slot| slot.key == key)
            .ok_or_else(|| error!(NotFound => "layer '{}' has no setting '{}'", self.name, key))?;
        slot.value = None;
        Ok(())
    }

    /// Whether every required slot in this layer has an explicit value.
    pub fn is_filled(&self) -> bool {
        let slots = self.slots.read().expect("settings lock poisoned");
        slots
            .iter()
            .all(|slot| slot.has_default || slot.value.is_some())
    }

    /// Applies `(setting, attribute)` mappings from an entry: a present
    /// attribute parses into the slot, an absent one clears it. The layer
    /// is left untouched when any value fails to parse.
    pub fn update_from_entry(&self, entry: &Entry, map: &[(&'static str, &str)]) -> Result<()> {
        let mut slots = self.slots.write().expect("settings lock poisoned");
        let rollback = slots.clone();

        let outcome = (|| {
            for (key, attribute) in map {
                let slot = slots.iter_mut().find(|slot| slot.key == *key).ok_or_else(
                    || error!(NotFound => "layer '{}' has no setting '{}'", self.name, key),
                )?;
                match entry.first(attribute) {
                    Some(text) => slot.value = Some(slot.default.parse_as(text)?),
                    None => slot.value = None,
                }
            }
            Ok(())
        })();

        if outcome.is_err() {
            *slots = rollback;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::ldap::{ChangeType, RawEntry};

    fn stack() -> (Arc<SettingsSet>, Arc<SettingsSet>, Arc<SettingsSet>) {
        let local = SettingsSet::new(
            "local",
            None,
            &[
                Spec::optional("dyn_update", Value::Bool(false)),
                Spec::optional("sync_ptr", Value::Bool(false)),
                Spec::optional("update_policy", Value::Str(String::new())),
                Spec::required("connections", Value::Uint(0)),
            ],
        );
        let global = SettingsSet::new(
            "global",
            Some(local.clone()),
            &[
                Spec::optional("dyn_update", Value::Bool(false)),
                Spec::optional("sync_ptr", Value::Bool(false)),
            ],
        );
        let zone = SettingsSet::new(
            "zone",
            Some(global.clone()),
            &[
                Spec::optional("dyn_update", Value::Bool(false)),
                Spec::optional("sync_ptr", Value::Bool(false)),
                Spec::optional("update_policy", Value::Str(String::new())),
            ],
        );
        (local, global, zone)
    }

    #[test]
    fn get_walks_outward() {
        let (local, global, zone) = stack();
        local.set("dyn_update", Value::Bool(true)).unwrap();
        assert!(zone.get_bool("dyn_update").unwrap());

        global.set("dyn_update", Value::Bool(false)).unwrap();
        assert!(!zone.get_bool("dyn_update").unwrap());

        zone.set("dyn_update", Value::Bool(true)).unwrap();
        assert!(zone.get_bool("dyn_update").unwrap());
    }

    #[test]
    fn unset_resumes_inheritance() {
        let (_, global, zone) = stack();
        global.set("sync_ptr", Value::Bool(true)).unwrap();
        zone.set("sync_ptr", Value::Bool(false)).unwrap();
        assert!(!zone.get_bool("sync_ptr").unwrap());

        zone.unset("sync_ptr").unwrap();
        assert!(zone.get_bool("sync_ptr").unwrap());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let (local, _, _) = stack();
        assert!(local.set("dyn_update", Value::Uint(1)).is_err());
    }

    #[test]
    fn is_filled_tracks_required_slots() {
        let (local, _, _) = stack();
        assert!(!local.is_filled());
        local.set("connections", Value::Uint(2)).unwrap();
        assert!(local.is_filled());
    }

    #[test]
    fn update_from_entry_sets_and_clears() {
        let (_, _, zone) = stack();
        let raw = RawEntry::new("idnsName=example.org., cn=dns, dc=test")
            .with_attr("idnsAllowDynUpdate", &["TRUE"]);
        let entry = Entry::from_raw(ChangeType::Modify, raw);

        zone.update_from_entry(
            &entry,
            &[
                ("dyn_update", "idnsAllowDynUpdate"),
                ("sync_ptr", "idnsAllowSyncPTR"),
            ],
        )
        .unwrap();
        assert!(zone.get_bool("dyn_update").unwrap());
        // absent attribute fell back to the inherited default
        assert!(!zone.get_bool("sync_ptr").unwrap());
    }

    #[test]
    fn update_from_entry_rolls_back_on_parse_error() {
        let (_, _, zone) = stack();
        zone.set("dyn_update", Value::Bool(true)).unwrap();

        let raw = RawEntry::new("idnsName=example.org., cn=dns, dc=test")
            .with_attr("idnsAllowDynUpdate", &["FALSE"])
            .with_attr("idnsAllowSyncPTR", &["maybe"]);
        let entry = Entry::from_raw(ChangeType::Modify, raw);

        let err = zone
            .update_from_entry(
                &entry,
                &[
                    ("dyn_update", "idnsAllowDynUpdate"),
                    ("sync_ptr", "idnsAllowSyncPTR"),
                ],
            )
            .unwrap_err();
        assert!(err.is(crate::error::ErrorKind::UnexpectedToken));
        // the failed update left the earlier value alone
        assert!(zone.get_bool("dyn_update").unwrap());
    }
}
