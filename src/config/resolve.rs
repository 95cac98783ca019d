use super::{Config, PartialConfig};
use anyhow::{Context, Result};
use log::trace;
use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, str::FromStr};

/* Files are merged in this order, later entries winning, then VESSEL_*
 * environment variables override everything. */
fn config_file_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/vessel.toml")];

    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            paths.push(PathBuf::from(home).join(".config/vessel/config.toml"));
        }
    }

    if let Ok(cwd) = env::current_dir() {
        paths.push(cwd.join(".vessel.toml"));
    }

    paths
}

pub fn resolve_config() -> Result<Config> {
    let mut partial = PartialConfig::default();
    let mut sources: HashMap<String, String> = HashMap::new();

    for path in config_file_paths() {
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .context(format!("Failed to read config file {}", path.display()))?;
        let overlay: PartialConfig = toml::from_str(&text)
            .context(format!("Failed to parse config file {}", path.display()))?;
        merge_configs(&mut partial, &mut sources, overlay, &path.display().to_string());
        trace!("Loaded config file: {}", path.display());
    }

    if let Ok(level) = env::var("VESSEL_LOG_LEVEL") {
        let level = log::LevelFilter::from_str(&level)
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", level))?;
        partial.log_level = Some(level);
        sources.insert("log_level".into(), "environment".into());
    }

    if let Ok(verbose) = env::var("VESSEL_LOG_VERBOSE") {
        partial.log_verbose = Some(parse_bool("VESSEL_LOG_VERBOSE", &verbose)?);
        sources.insert("log_verbose".into(), "environment".into());
    }

    if let Ok(tmp_dir) = env::var("VESSEL_TMP_DIR") {
        if !tmp_dir.is_empty() {
            partial.tmp_dir = Some(tmp_dir);
            sources.insert("tmp_dir".into(), "environment".into());
        }
    }

    if let Ok(enabled) = env::var("VESSEL_NETWORK_ENABLED") {
        partial.network_enabled = Some(parse_bool("VESSEL_NETWORK_ENABLED", &enabled)?);
        sources.insert("network_enabled".into(), "environment".into());
    }

    if let Ok(debug) = env::var("VESSEL_NETWORK_DEBUG") {
        partial.network_debug = Some(parse_bool("VESSEL_NETWORK_DEBUG", &debug)?);
        sources.insert("network_debug".into(), "environment".into());
    }

    let defaults = Config::default();
    for key in [
        "log_level",
        "log_verbose",
        "tmp_dir",
        "network_enabled",
        "network_debug",
    ] {
        sources.entry(key.into()).or_insert_with(|| "default".into());
    }

    let config = Config {
        log_level: partial.log_level.unwrap_or(defaults.log_level),
        log_verbose: partial.log_verbose.unwrap_or(defaults.log_verbose),
        tmp_dir: partial
            .tmp_dir
            .map(PathBuf::from)
            .unwrap_or(defaults.tmp_dir),
        network_enabled: partial.network_enabled.unwrap_or(defaults.network_enabled),
        network_debug: partial.network_debug.unwrap_or(defaults.network_debug),
        sources,
    };

    validate_config(&config)?;

    trace!("Scratch dir prefix: {:?}", config.tmp_dir);
    trace!("Networking enabled: {}", config.network_enabled);

    Ok(config)
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    bool::from_str(value)
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", var, value))
}

fn merge_configs(
    base: &mut PartialConfig,
    sources: &mut HashMap<String, String>,
    overlay: PartialConfig,
    source: &str,
) {
    if let Some(log_level) = overlay.log_level {
        base.log_level = Some(log_level);
        sources.insert("log_level".into(), source.into());
    }
    if let Some(log_verbose) = overlay.log_verbose {
        base.log_verbose = Some(log_verbose);
        sources.insert("log_verbose".into(), source.into());
    }
    if let Some(tmp_dir) = overlay.tmp_dir {
        base.tmp_dir = Some(tmp_dir);
        sources.insert("tmp_dir".into(), source.into());
    }
    if let Some(network_enabled) = overlay.network_enabled {
        base.network_enabled = Some(network_enabled);
        sources.insert("network_enabled".into(), source.into());
    }
    if let Some(network_debug) = overlay.network_debug {
        base.network_debug = Some(network_debug);
        sources.insert("network_debug".into(), source.into());
    }
}

fn validate_config(config: &Config) -> Result<()> {
    if !config.tmp_dir.is_absolute() {
        return Err(anyhow::anyhow!(
            "tmp_dir must be absolute: {}",
            config.tmp_dir.display()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_configs() {
        let mut base = PartialConfig::default();
        let mut sources = HashMap::new();

        let overlay = PartialConfig {
            log_level: Some(log::LevelFilter::Debug),
            log_verbose: Some(true),
            tmp_dir: Some("/tmp/vessel".to_string()),
            network_enabled: Some(false),
            network_debug: Some(true),
        };

        merge_configs(&mut base, &mut sources, overlay, "test-config");

        assert_eq!(base.log_level, Some(log::LevelFilter::Debug));
        assert_eq!(base.log_verbose, Some(true));
        assert_eq!(base.tmp_dir, Some("/tmp/vessel".to_string()));
        assert_eq!(base.network_enabled, Some(false));
        assert_eq!(base.network_debug, Some(true));
        assert_eq!(sources.get("tmp_dir"), Some(&"test-config".to_string()));
        assert_eq!(
            sources.get("network_enabled"),
            Some(&"test-config".to_string())
        );
    }

    #[test]
    fn test_partial_from_toml() {
        let partial: PartialConfig = toml::from_str(
            r#"
            log_level = "trace"
            tmp_dir = "/var/tmp/vessel"
            network_enabled = false
            "#,
        )
        .expect("parse");

        assert_eq!(partial.log_level, Some(log::LevelFilter::Trace));
        assert_eq!(partial.tmp_dir, Some("/var/tmp/vessel".to_string()));
        assert_eq!(partial.network_enabled, Some(false));
        assert_eq!(partial.network_debug, None);
    }

    #[test]
    fn test_validate_rejects_relative_tmp_dir() {
        let config = Config {
            tmp_dir: PathBuf::from("relative/tmp"),
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
