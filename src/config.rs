use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default zone-data directory, relative to the name-server working
/// directory, with the instance name appended.
pub const BASE_DATA_DIR: &str = "dyndb-ldap";

fn default_connections() -> u32 {
    2
}

fn default_reconnect_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    10
}

/// Instance configuration, parsed from the host configuration blob.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub uri: String,
    pub base: String,

    #[serde(default = "default_connections")]
    pub connections: u32,
    /// Upper bound on the reconnect backoff, in seconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// Per-query timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sasl_mech: Option<String>,
    #[serde(default)]
    pub sasl_user: Option<String>,
    #[serde(default)]
    pub sasl_auth_name: Option<String>,
    #[serde(default)]
    pub sasl_realm: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub krb5_principal: Option<String>,
    #[serde(default)]
    pub krb5_keytab: Option<String>,

    /// Override for the MNAME field of synthesized SOA records.
    #[serde(default)]
    pub fake_mname: Option<String>,
    #[serde(default)]
    pub ldap_hostname: Option<String>,

    #[serde(default)]
    pub sync_ptr: bool,
    #[serde(default)]
    pub dyn_update: bool,
    #[serde(default)]
    pub verbose_checks: bool,

    /// Zone-data directory; defaults to `dyndb-ldap/<instance>/`.
    #[serde(default)]
    pub directory: Option<String>,
}

impl TryFrom<&[u8]> for Config {
    type Error = crate::error::Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let config: Config = serde_yaml::from_slice(value)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.base.is_empty() {
            return Err(error!(Config => "'base' must not be empty"));
        }
        if self.connections < 2 {
            return Err(
                error!(Config => "'connections' must be at least 2, got {}", self.connections),
            );
        }
        match self.auth_method {
            AuthMethod::None => {}
            AuthMethod::Simple => {
                if self.bind_dn.is_none() || self.password.is_none() {
                    return Err(
                        error!(Config => "auth_method 'simple' requires 'bind_dn' and 'password'"),
                    );
                }
            }
            AuthMethod::Sasl => {
                if self.sasl_mech.is_none() {
                    return Err(error!(Config => "auth_method 'sasl' requires 'sasl_mech'"));
                }
            }
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Root of the on-disk zone data for the named instance.
    pub fn data_dir(&self, instance: &str) -> PathBuf {
        match &self.directory {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(BASE_DATA_DIR).join(instance),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    None,
    Simple,
    Sasl,
}
