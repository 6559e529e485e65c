//! Loading prompt configurations from disk or the network
//!
//! Supports JSON (`.json`, `.jsonc`) and TOML (`.toml`), plus `http(s)://`
//! sources parsed as JSON. A configuration may name a parent through `extends`;
//! the child is deep-merged over the parent and every file in the chain is
//! reported in [`Config::file_paths`].

use super::Config;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for fetching remote configurations
const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn is_remote(path: &str) -> bool {
    path.starts_with("https://") || path.starts_with("http://")
}

/// Load the configuration at `path`
///
/// Never fails: an empty path yields the built-in default, and any read or
/// parse error is logged and also yields the default. In both cases `source`
/// is empty, so callers can tell a fallback from the file they asked for.
pub fn load(path: &str) -> Config {
    if path.is_empty() {
        debug!("no config file specified, using default");
        return Config::default_prompt();
    }

    match parse_chain(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("falling back to default config: {}", e);
            Config::default_prompt()
        }
    }
}

fn parse_chain(path: &str) -> Result<Config> {
    let mut hasher = DefaultHasher::new();
    let location = resolve_location(path, None);

    let mut merged = read_value(&location, &mut hasher)?;
    let mut file_paths = vec![location.clone()];
    let mut seen: HashSet<String> = HashSet::from([location.clone()]);
    let mut parent_dir = parent_of(&location);

    while let Some(extends) = take_extends(&mut merged) {
        let base_location = resolve_location(&extends, parent_dir.as_deref());
        if !seen.insert(base_location.clone()) {
            warn!("config include cycle at {}", base_location);
            break;
        }

        let mut base = match read_value(&base_location, &mut hasher) {
            Ok(base) => base,
            Err(e) => {
                warn!("ignoring parent config: {}", e);
                break;
            }
        };

        merge_values(&mut base, merged);
        merged = base;
        file_paths.push(base_location.clone());
        parent_dir = parent_of(&base_location);
    }

    let mut config: Config =
        serde_json::from_value(merged).map_err(|e| Error::config(path, e))?;
    config.source = path.to_string();
    config.file_paths = file_paths;
    config.hash = hasher.finish();

    debug!(
        "loaded config {} ({} files, hash {:x})",
        path,
        config.file_paths.len(),
        config.hash
    );

    Ok(config)
}

fn take_extends(value: &mut Value) -> Option<String> {
    let extends = value.as_object_mut()?.remove("extends")?;
    extends.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

fn parent_of(location: &str) -> Option<PathBuf> {
    if is_remote(location) {
        return None;
    }
    Path::new(location).parent().map(Path::to_path_buf)
}

/// Make a user-supplied config path absolute against the current directory
///
/// Expands `~/`; empty paths and URLs are returned unchanged. Clients call
/// this before sending a path so the daemon never resolves it against its
/// own working directory.
pub fn resolve_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    resolve_location(path, None)
}

/// Turn a user-supplied path into an absolute location (URLs pass through)
fn resolve_location(path: &str, parent: Option<&Path>) -> String {
    if is_remote(path) {
        return path.to_string();
    }

    let expanded = match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    };

    let resolved = if expanded.is_absolute() {
        expanded
    } else if let Some(parent) = parent {
        parent.join(expanded)
    } else {
        std::path::absolute(&expanded).unwrap_or(expanded)
    };

    resolved.to_string_lossy().into_owned()
}

fn read_value(location: &str, hasher: &mut DefaultHasher) -> Result<Value> {
    let data = if is_remote(location) {
        fetch_remote(location)?
    } else {
        fs::read_to_string(location).map_err(|e| Error::config(location, e))?
    };
    hasher.write(data.as_bytes());

    let extension = if is_remote(location) {
        Path::new(location.rsplit('/').next().unwrap_or(""))
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json")
            .to_lowercase()
    } else {
        Path::new(location)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase()
    };

    match extension.as_str() {
        "json" | "jsonc" => {
            serde_json::from_str(&strip_json_comments(&data)).map_err(|e| Error::config(location, e))
        }
        "toml" | "tml" => toml::from_str(&data).map_err(|e| Error::config(location, e)),
        other => Err(Error::config(
            location,
            format!("unsupported config format '{}'", other),
        )),
    }
}

fn fetch_remote(url: &str) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REMOTE_TIMEOUT)
        .build()
        .map_err(|e| Error::config(url, e))?;

    client
        .get(url)
        .send()
        .and_then(|resp| resp.error_for_status())
        .and_then(|resp| resp.text())
        .map_err(|e| Error::config(url, e))
}

/// Deep-merge `overlay` into `base`: objects merge key by key, anything else
/// is replaced by the overlay.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Remove `//` and `/* */` comments outside of string literals
fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            _ => out.push(c),
        }
    }

    out
}
