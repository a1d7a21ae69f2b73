//! Environment for spawned MCP server processes

use std::collections::BTreeMap;

/// Variables a spawned server inherits from the proxy on Unix
pub const UNIX_INHERITED_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Variables a spawned server inherits from the proxy on Windows
pub const WINDOWS_INHERITED_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Safe subset of the proxy's own environment
pub fn default_inherited_env() -> BTreeMap<String, String> {
    let names = if cfg!(windows) {
        WINDOWS_INHERITED_VARS
    } else {
        UNIX_INHERITED_VARS
    };
    inherited_from(names, |name| std::env::var(name).ok())
}

fn inherited_from(
    names: &[&str],
    lookup: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    names
        .iter()
        .filter_map(|name| {
            let value = lookup(name)?;
            // Exported shell functions are not plain values
            if value.starts_with("()") {
                return None;
            }
            Some((name.to_string(), value))
        })
        .collect()
}

/// Merge environment layers; later layers win on key collisions
pub fn merge_env<'a>(
    layers: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_later_layers_win() {
        let inherited = map(&[("PATH", "/usr/bin"), ("HOME", "/home/proxy")]);
        let defaults = map(&[("NODE_ENV", "production"), ("PATH", "/opt/bin")]);
        let overrides = map(&[("PATH", "/custom"), ("API_TOKEN", "t")]);

        let merged = merge_env([&inherited, &defaults, &overrides]);

        assert_eq!(merged["PATH"], "/custom");
        assert_eq!(merged["HOME"], "/home/proxy");
        assert_eq!(merged["NODE_ENV"], "production");
        assert_eq!(merged["API_TOKEN"], "t");
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_inherited_skips_missing_and_functions() {
        let env = inherited_from(&["PATH", "SHELL", "TERM"], |name| match name {
            "PATH" => Some("/usr/bin".to_string()),
            "SHELL" => Some("() { echo hi; }".to_string()),
            _ => None,
        });

        assert_eq!(env, map(&[("PATH", "/usr/bin")]));
    }

    #[test]
    fn test_default_inherited_env_is_allow_listed() {
        let env = default_inherited_env();
        let allowed: &[&str] = if cfg!(windows) {
            WINDOWS_INHERITED_VARS
        } else {
            UNIX_INHERITED_VARS
        };
        assert!(env.keys().all(|key| allowed.contains(&key.as_str())));
    }
}
