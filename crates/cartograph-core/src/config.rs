//! Configuration management for Cartograph services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`CARTOGRAPH_` prefix, `__` separator)
//! 2. Config file (`cartograph.toml` by default)
//! 3. Defaults

use serde::de::DeserializeOwned;

use crate::error::CoreError;

/// Environment variable prefix for every Cartograph setting.
pub const ENV_PREFIX: &str = "CARTOGRAPH";

/// Default config file prefix (resolved to `cartograph.toml`, `.yaml`, ...).
pub const DEFAULT_FILE_PREFIX: &str = "cartograph";

/// Build the layered file + environment configuration.
pub fn layered(file_prefix: &str) -> Result<config::Config, CoreError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(cfg)
}

/// Deserialize one top-level section, falling back to `T::default()` when the
/// section is absent. A present but malformed section is an error.
pub fn load_section<T>(file_prefix: &str, section: &str) -> Result<T, CoreError>
where
    T: DeserializeOwned + Default,
{
    let cfg = layered(file_prefix)?;
    match cfg.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => {
            tracing::debug!(section, "Config section not found, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Section {
        #[serde(default)]
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[test]
    fn test_missing_file_and_section_yield_default() {
        let section: Section = load_section("/nonexistent/cartograph-test", "absent").unwrap();
        assert_eq!(section, Section::default());
    }

    #[test]
    fn test_section_read_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[demo]\nname = \"inventory\"\ncount = 3").unwrap();
        let prefix = file.path().to_str().unwrap().trim_end_matches(".toml").to_string();

        let section: Section = load_section(&prefix, "demo").unwrap();
        assert_eq!(section.name, "inventory");
        assert_eq!(section.count, 3);
    }

    #[test]
    fn test_malformed_section_is_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[demo]\ncount = \"many\"").unwrap();
        let prefix = file.path().to_str().unwrap().trim_end_matches(".toml").to_string();

        assert!(load_section::<Section>(&prefix, "demo").is_err());
    }
}
