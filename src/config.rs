//! Environment configuration with legacy-name compatibility.
//!
//! Every variable is read under its current name first, then the name the
//! project shipped under before the rename; the first one set wins.

use std::path::PathBuf;

pub const API_KEY_VARS: [&str; 2] = ["REACH_API_KEY", "ETPHONEHOME_API_KEY"];
pub const DATA_DIR_VARS: [&str; 2] = ["REACH_DATA_DIR", "ETPHONEHOME_DATA_DIR"];

const DEFAULT_DATA_DIR: &str = ".reach";

/// First-set-wins lookup across current and legacy variable names.
#[must_use]
pub fn env_compat(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
}

#[must_use]
pub fn api_key() -> Option<String> {
    env_compat(&API_KEY_VARS)
}

#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(dir) = env_compat(&DATA_DIR_VARS) {
        return PathBuf::from(dir);
    }

    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(DEFAULT_DATA_DIR),
        Err(_) => PathBuf::from(DEFAULT_DATA_DIR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_name_wins() {
        std::env::set_var("REACH_TEST_COMPAT_NEW", "new-value");
        std::env::set_var("REACH_TEST_COMPAT_OLD", "old-value");

        assert_eq!(
            env_compat(&["REACH_TEST_COMPAT_NEW", "REACH_TEST_COMPAT_OLD"]),
            Some("new-value".to_string())
        );

        std::env::remove_var("REACH_TEST_COMPAT_NEW");
        assert_eq!(
            env_compat(&["REACH_TEST_COMPAT_NEW", "REACH_TEST_COMPAT_OLD"]),
            Some("old-value".to_string())
        );

        std::env::remove_var("REACH_TEST_COMPAT_OLD");
        assert_eq!(
            env_compat(&["REACH_TEST_COMPAT_NEW", "REACH_TEST_COMPAT_OLD"]),
            None
        );
    }

    #[test]
    fn empty_values_do_not_count_as_set() {
        std::env::set_var("REACH_TEST_EMPTY_NEW", "");
        std::env::set_var("REACH_TEST_EMPTY_OLD", "fallback");

        assert_eq!(
            env_compat(&["REACH_TEST_EMPTY_NEW", "REACH_TEST_EMPTY_OLD"]),
            Some("fallback".to_string())
        );

        std::env::remove_var("REACH_TEST_EMPTY_NEW");
        std::env::remove_var("REACH_TEST_EMPTY_OLD");
    }
}
