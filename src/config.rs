//! Minimal `my.cnf`-style option-group reader.
//!
//! This is deliberately not a general INI parser: it understands exactly the
//! handful of keys the connect options care about (`host`, `user`, `password`,
//! `port`, `socket`, `default-character-set`) inside one named `[group]`
//! section, and ignores everything else. Values read here are defaults;
//! callers that pass an explicit `Opts` field always win (see
//! `Opts::merge_default_file`).

use std::fs;

use crate::error::Error;

#[derive(Debug, Default, Clone)]
pub struct OptionGroup {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub charset: Option<String>,
}

/// Read the named `[group]` section of a `my.cnf`-style file.
///
/// Returns an empty `OptionGroup` (not an error) if the file has no such
/// group, matching `my_print_defaults`' behavior of silently yielding
/// nothing for a missing group.
pub fn read_option_group(path: &str, group: &str) -> Result<OptionGroup, Error> {
    let contents =
        fs::read_to_string(path).map_err(|e| Error::BadConfig(format!("cannot read {path}: {e}")))?;

    let mut result = OptionGroup::default();
    let mut in_group = false;

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            in_group = name.trim() == group;
            continue;
        }

        if !in_group {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');

        match key {
            "host" => result.host = Some(value.to_string()),
            "user" => result.user = Some(value.to_string()),
            "password" => result.password = Some(value.to_string()),
            "port" => result.port = value.parse().ok(),
            "socket" => result.socket = Some(value.to_string()),
            "default-character-set" | "character-set-server" => {
                result.charset = Some(value.to_string())
            }
            _ => {}
        }
    }

    Ok(result)
}
