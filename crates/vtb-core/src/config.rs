use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{domain::UserId, errors::Error, Result};

const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 5;
const DEFAULT_DATA_DIR: &str = "data";

/// Typed configuration for the quota/access/metrics core.
///
/// Read once at startup; nothing here changes at runtime. The whitelist only
/// changes through grant/revoke.
#[derive(Clone, Debug)]
pub struct Config {
    // Access control
    pub admin_user_id: UserId,
    pub unlimited_users: Vec<String>,

    // Rate limiting
    pub rate_limit_per_hour: u32,

    // Storage
    pub data_dir: PathBuf,
    pub unlimited_users_file: PathBuf,
    pub rate_limit_file: PathBuf,
    pub metrics_file: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in `load`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Required: a missing admin is fatal. `0` is the historical "unset" value.
        let admin_user_id = match get("ADMIN_USER_ID") {
            Some(raw) if raw.trim() != "0" => UserId::parse(&raw)?,
            _ => {
                return Err(Error::Config(
                    "ADMIN_USER_ID environment variable is required".to_string(),
                ))
            }
        };

        let rate_limit_per_hour = match get("RATE_LIMIT_PER_HOUR") {
            None => DEFAULT_RATE_LIMIT_PER_HOUR,
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                Error::Config(format!(
                    "RATE_LIMIT_PER_HOUR must be a non-negative integer, got {raw:?}"
                ))
            })?,
        };

        let unlimited_users = parse_csv(get("UNLIMITED_USERS"));

        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or(DEFAULT_DATA_DIR.to_string()));
        let path_or = |key: &str, file: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(file))
        };
        let unlimited_users_file = path_or("UNLIMITED_USERS_FILE", "unlimited_users.json");
        let rate_limit_file = path_or("RATE_LIMIT_FILE", "rate_limits.json");
        let metrics_file = path_or("METRICS_FILE", "metrics.json");

        Ok(Self {
            admin_user_id,
            unlimited_users,
            rate_limit_per_hour,
            data_dir,
            unlimited_users_file,
            rate_limit_file,
            metrics_file,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
