//! On-disk configuration: the handful of knobs this crate exposes to
//! its host process, loaded once at startup as a JSON file read with
//! `serde_json` and wrapped in an `easy_error`-flavored `Result`.

use easy_error::format_err;
use log::debug;
use serde::Deserialize;
use std::error::Error;
use std::fs::read_to_string;

use crate::command::DEFAULT_MAX_COMMANDS;

fn default_max_commands() -> u32 {
    DEFAULT_MAX_COMMANDS
}

fn default_use_polld() -> bool {
    true
}

fn default_owner_user() -> String {
    "vdsm".to_string()
}

fn default_owner_group() -> String {
    "kvm".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Upper bound on concurrent `lvm` subprocesses.
    #[serde(default = "default_max_commands")]
    pub max_commands: u32,

    /// Whether commands run with `lvmpolld` enabled by default; `pvmove`
    /// always overrides this to `false` regardless of this setting.
    #[serde(default = "default_use_polld")]
    pub use_polld: bool,

    /// Whether `getAllLvs` may answer from the per-VG cache without
    /// revalidating. Off by default.
    #[serde(default)]
    pub cache_lvs: bool,

    /// Ownership applied to a newly activated LV's device node.
    #[serde(default = "default_owner_user")]
    pub owner_user: String,
    #[serde(default = "default_owner_group")]
    pub owner_group: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_commands: default_max_commands(),
            use_polld: default_use_polld(),
            cache_lvs: false,
            owner_user: default_owner_user(),
            owner_group: default_owner_group(),
        }
    }
}

pub fn load(path: String) -> Result<Config, Box<dyn Error>> {
    debug!("trying to read \"{}\"", path);
    let data = read_to_string(&path).map_err(|e| format_err!("cannot read {}: {}", path, e))?;
    let config: Config = serde_json::from_str(&data)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_commands, DEFAULT_MAX_COMMANDS);
        assert!(config.use_polld);
        assert!(!config.cache_lvs);
        assert_eq!(config.owner_user, "vdsm");
        assert_eq!(config.owner_group, "kvm");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"max-commands": 4, "use-polld": false, "cache-lvs": true, "owner-user": "qemu", "owner-group": "qemu"}"#,
        )
        .unwrap();
        assert_eq!(config.max_commands, 4);
        assert!(!config.use_polld);
        assert!(config.cache_lvs);
        assert_eq!(config.owner_user, "qemu");
    }
}
