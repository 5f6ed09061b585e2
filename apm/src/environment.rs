// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Application context, assembled once at startup

use std::{
    env, fmt, io,
    path::{Path, PathBuf},
};

use nix::unistd::Uid;
use serde::Deserialize;
use thiserror::Error;

/// DB batch size for bulk package inserts
pub const DB_BATCH_SIZE: usize = 1000;
/// How long a mutating caller waits on the apt write lock
pub const LOCK_TIMEOUT_SECS: u64 = 300;

const CONFIG_PATH: &str = "/etc/apm/config.yaml";

/// Verbosity / safety gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dev,
    #[default]
    Prod,
}

/// Output transport selected for the invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Json,
    Dbus,
}

/// On-disk configuration, all fields optional and merged over defaults
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    command_prefix: Option<String>,
    environment: Option<Mode>,
    path_log_file: Option<PathBuf>,
    path_db_sql_system: Option<PathBuf>,
    path_db_sql_user: Option<PathBuf>,
    path_db_kv: Option<PathBuf>,
    path_image_file: Option<PathBuf>,
    path_containerfile: Option<PathBuf>,
    path_locales: Option<PathBuf>,
    colors: Option<std::collections::HashMap<String, String>>,
}

/// Shared application context. Built once in `main`, threaded by
/// reference through every component constructor. Transport wrappers
/// clone it to attach a per-call transaction id.
#[derive(Debug, Clone)]
pub struct Env {
    /// Inserted before every privileged child process invocation
    pub command_prefix: Option<String>,
    pub mode: Mode,
    pub format: Format,
    /// Opaque id correlating events and responses across transports
    pub transaction: Option<String>,
    /// Assume yes on every confirmation dialog
    pub assume_yes: bool,
    pub path_log_file: PathBuf,
    pub path_db_system: PathBuf,
    pub path_db_user: PathBuf,
    /// Small key/value store used by external frontends
    pub path_db_kv: PathBuf,
    pub path_image_file: PathBuf,
    pub path_containerfile: PathBuf,
    /// Locale catalogs, consumed by the rendering collaborators
    pub path_locales: PathBuf,
    /// UI palette handed through to frontends untouched
    pub colors: std::collections::HashMap<String, String>,
    /// True iff the atomic-boot tool is present on this host
    pub is_atomic: bool,
    pub exist_stplr: bool,
    pub exist_distrobox: bool,
}

impl Env {
    /// Build the context from the config file (if any) plus capability probes
    pub fn new(format: Format, transaction: Option<String>, assume_yes: bool) -> Result<Self, Error> {
        Self::with_config_path(CONFIG_PATH, format, transaction, assume_yes)
    }

    pub fn with_config_path(
        path: impl AsRef<Path>,
        format: Format,
        transaction: Option<String>,
        assume_yes: bool,
    ) -> Result<Self, Error> {
        let config = read_config(path.as_ref())?;

        Ok(Self {
            command_prefix: config.command_prefix,
            mode: config.environment.unwrap_or_default(),
            format,
            transaction,
            assume_yes,
            path_log_file: config
                .path_log_file
                .unwrap_or_else(|| "/var/log/apm.log".into()),
            path_db_system: config
                .path_db_sql_system
                .unwrap_or_else(|| "/var/lib/apm/apm.db".into()),
            path_db_user: config.path_db_sql_user.unwrap_or_else(user_db_path),
            path_db_kv: config.path_db_kv.unwrap_or_else(|| "/var/lib/apm/kv".into()),
            path_image_file: config
                .path_image_file
                .unwrap_or_else(|| "/etc/apm/image.yaml".into()),
            path_containerfile: config
                .path_containerfile
                .unwrap_or_else(|| "/var/Containerfile".into()),
            path_locales: config
                .path_locales
                .unwrap_or_else(|| "/usr/share/apm/locales".into()),
            colors: config.colors.unwrap_or_default(),
            is_atomic: binary_exists("bootc"),
            exist_stplr: binary_exists("stplr"),
            exist_distrobox: binary_exists("distrobox"),
        })
    }

    pub fn is_root(&self) -> bool {
        Uid::effective().is_root()
    }

    /// The mirror database for the current privilege level
    pub fn db_path(&self) -> &Path {
        if self.is_root() {
            &self.path_db_system
        } else {
            &self.path_db_user
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.mode, if self.is_atomic { "atomic" } else { "classic" })
    }
}

fn read_config(path: &Path) -> Result<FileConfig, Error> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs_err::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

fn user_db_path() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| "/tmp".into())
        .join(".local/share/apm/apm.db")
}

/// Probe $PATH for a binary, the basis of the capability flags
pub fn binary_exists(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),

    #[error("config parse")]
    Parse(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_defaults() {
        let env = Env::with_config_path("/nonexistent/apm.yaml", Format::Text, None, false).unwrap();
        assert_eq!(env.path_containerfile, PathBuf::from("/var/Containerfile"));
        assert_eq!(env.mode, Mode::Prod);
        assert!(env.transaction.is_none());
    }

    #[test]
    fn format_parses() {
        assert_eq!("json".parse::<Format>().unwrap(), Format::Json);
        assert_eq!(Format::default(), Format::Text);
    }
}
