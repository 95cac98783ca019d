use super::impls::deserialize_level_filter;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

/// Shape of a single config file. Every field is optional so files can be
/// merged lowest-to-highest precedence.
#[derive(Deserialize, Default)]
pub struct PartialConfig {
    #[serde(deserialize_with = "deserialize_level_filter", default)]
    pub log_level: Option<log::LevelFilter>,
    pub log_verbose: Option<bool>,
    pub tmp_dir: Option<String>,
    pub network_enabled: Option<bool>,
    pub network_debug: Option<bool>,
}

/// Resolved daemon configuration consumed by the launch engine.
#[derive(Clone)]
pub struct Config {
    pub log_level: log::LevelFilter,
    /// Per-arg/env diagnostic tracing in the init before exec.
    pub log_verbose: bool,
    /// Prefix under which created working directories are scratch space
    /// that is removed when the task is dropped.
    pub tmp_dir: PathBuf,
    /// When false the network builder never runs and net_cls drift is
    /// repaired back to the root cgroup.
    pub network_enabled: bool,
    /// Log synthesized veth hardware addresses.
    pub network_debug: bool,
    /// Where each value came from (file path, "environment" or "default").
    pub sources: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_level: log::LevelFilter::Info,
            log_verbose: false,
            tmp_dir: PathBuf::from("/var/lib/vessel/tmp"),
            network_enabled: true,
            network_debug: false,
            sources: HashMap::new(),
        }
    }
}
