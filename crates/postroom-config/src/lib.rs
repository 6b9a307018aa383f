//! Configuration file handling for postroom.
//!
//! Site configuration is a single `postroom.toml` at the site root. Every
//! field has a default, so a missing file yields a fully usable
//! configuration; a malformed file is a fatal startup error.
//!
//! # Example
//!
//! ```
//! use postroom_config::{Config, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new(".")).expect("load config");
//! assert_eq!(config.max_command_lines(), 10);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name
pub const CONFIG_FILE: &str = "postroom.toml";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete site configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem layout
    #[serde(default)]
    dirs: DirsConfig,
    /// Local MTA hookup
    #[serde(default)]
    mta: MtaConfig,
    /// Bounce scoring thresholds
    #[serde(default)]
    bounce: BounceConfig,
    /// Email command processing limits
    #[serde(default)]
    commands: CommandsConfig,
    /// Lock timeouts
    #[serde(default)]
    locks: LocksConfig,
    /// Runner cadence
    #[serde(default)]
    runner: RunnerConfig,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-list state directory root
    pub fn list_data_dir(&self) -> &Path {
        Path::new(&self.dirs.list_data_dir)
    }

    /// Root of the spool directories
    pub fn queue_dir(&self) -> &Path {
        Path::new(&self.dirs.queue_dir)
    }

    /// Directory holding cross-process lock files
    pub fn lock_dir(&self) -> &Path {
        Path::new(&self.dirs.lock_dir)
    }

    /// Generated-data directory (alias maps, pending store)
    pub fn data_dir(&self) -> &Path {
        Path::new(&self.dirs.data_dir)
    }

    /// Site template directory
    pub fn template_dir(&self) -> &Path {
        Path::new(&self.dirs.template_dir)
    }

    /// Event log directory
    pub fn log_dir(&self) -> &Path {
        Path::new(&self.dirs.log_dir)
    }

    /// Site password file
    pub fn site_pw_file(&self) -> &Path {
        Path::new(&self.dirs.site_pw_file)
    }

    /// List-creator password file
    pub fn listcreator_pw_file(&self) -> &Path {
        Path::new(&self.dirs.listcreator_pw_file)
    }

    /// Base URL for pointers in generated mail
    pub fn default_url(&self) -> &str {
        &self.dirs.default_url
    }

    /// LMTP endpoint host the alias map points at
    pub fn lmtp_host(&self) -> &str {
        &self.mta.lmtp_host
    }

    /// LMTP endpoint port
    pub fn lmtp_port(&self) -> u16 {
        self.mta.lmtp_port
    }

    /// Command run over the freshly renamed alias file
    pub fn postfix_map_cmd(&self) -> &str {
        &self.mta.postfix_map_cmd
    }

    /// Days an address must have been bouncing before removal
    pub fn minimum_removal_date(&self) -> u32 {
        self.bounce.minimum_removal_date
    }

    /// Posts since first bounce before removal is considered
    pub fn minimum_post_count_before_removal(&self) -> u32 {
        self.bounce.minimum_post_count_before_removal
    }

    /// Gap (in posts) after which a bounce record is considered stale
    pub fn max_posts_between_bounces(&self) -> u32 {
        self.bounce.max_posts_between_bounces
    }

    /// Maximum body lines scanned for commands
    pub fn max_command_lines(&self) -> usize {
        self.commands.max_lines
    }

    /// Regexp extracting the confirm cookie from a VERP'd To: header
    pub fn verp_confirm_regexp(&self) -> &str {
        &self.commands.verp_confirm_regexp
    }

    /// Autoresponse cap per sender per day
    pub fn max_autoresponses_per_day(&self) -> u32 {
        self.commands.max_autoresponses_per_day
    }

    /// Bounded wait for the per-list lock
    pub fn list_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.locks.list_lock_timeout_secs)
    }

    /// Bounded wait for the global MTA lock
    pub fn mta_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.locks.mta_lock_timeout_secs)
    }

    /// Sleep between empty runner cycles
    pub fn runner_sleep_interval(&self) -> Duration {
        Duration::from_secs(self.runner.sleep_interval_secs)
    }

    /// Entries between list-configuration refresh hooks
    pub fn runner_refresh_every(&self) -> u32 {
        self.runner.refresh_every
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    #[serde(default = "default_list_data_dir")]
    pub list_data_dir: String,
    #[serde(default = "default_queue_dir")]
    pub queue_dir: String,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_site_pw_file")]
    pub site_pw_file: String,
    #[serde(default = "default_listcreator_pw_file")]
    pub listcreator_pw_file: String,
    #[serde(default = "default_url")]
    pub default_url: String,
}

fn default_list_data_dir() -> String {
    "lists".to_string()
}
fn default_queue_dir() -> String {
    "qfiles".to_string()
}
fn default_lock_dir() -> String {
    "locks".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_template_dir() -> String {
    "templates".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_site_pw_file() -> String {
    "data/adm.pw".to_string()
}
fn default_listcreator_pw_file() -> String {
    "data/creator.pw".to_string()
}
fn default_url() -> String {
    "http://localhost/postroom/".to_string()
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            list_data_dir: default_list_data_dir(),
            queue_dir: default_queue_dir(),
            lock_dir: default_lock_dir(),
            data_dir: default_data_dir(),
            template_dir: default_template_dir(),
            log_dir: default_log_dir(),
            site_pw_file: default_site_pw_file(),
            listcreator_pw_file: default_listcreator_pw_file(),
            default_url: default_url(),
        }
    }
}

/// Local MTA hookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtaConfig {
    #[serde(default = "default_lmtp_host")]
    pub lmtp_host: String,
    #[serde(default = "default_lmtp_port")]
    pub lmtp_port: u16,
    #[serde(default = "default_postfix_map_cmd")]
    pub postfix_map_cmd: String,
}

fn default_lmtp_host() -> String {
    "127.0.0.1".to_string()
}
fn default_lmtp_port() -> u16 {
    8024
}
fn default_postfix_map_cmd() -> String {
    "/usr/sbin/postmap".to_string()
}

impl Default for MtaConfig {
    fn default() -> Self {
        Self {
            lmtp_host: default_lmtp_host(),
            lmtp_port: default_lmtp_port(),
            postfix_map_cmd: default_postfix_map_cmd(),
        }
    }
}

/// Bounce scoring thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceConfig {
    /// Minimum days bouncing before removal
    #[serde(default = "default_minimum_removal_date")]
    pub minimum_removal_date: u32,
    /// Minimum posts since first bounce before removal
    #[serde(default = "default_minimum_post_count")]
    pub minimum_post_count_before_removal: u32,
    /// Post gap after which an old record is stale
    #[serde(default = "default_max_posts_between_bounces")]
    pub max_posts_between_bounces: u32,
}

fn default_minimum_removal_date() -> u32 {
    5
}
fn default_minimum_post_count() -> u32 {
    10
}
fn default_max_posts_between_bounces() -> u32 {
    5
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            minimum_removal_date: default_minimum_removal_date(),
            minimum_post_count_before_removal: default_minimum_post_count(),
            max_posts_between_bounces: default_max_posts_between_bounces(),
        }
    }
}

/// Email command processing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Body lines scanned for commands; the rest is reported as ignored
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Named-group regexp; group `cookie` is the confirm token
    #[serde(default = "default_verp_confirm_regexp")]
    pub verp_confirm_regexp: String,
    /// Autoresponses to one sender in a single day
    #[serde(default = "default_max_autoresponses")]
    pub max_autoresponses_per_day: u32,
}

fn default_max_lines() -> usize {
    10
}
fn default_verp_confirm_regexp() -> String {
    r"^[^+]+\+confirm\.(?P<cookie>[0-9a-f]+)@".to_string()
}
fn default_max_autoresponses() -> u32 {
    10
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            verp_confirm_regexp: default_verp_confirm_regexp(),
            max_autoresponses_per_day: default_max_autoresponses(),
        }
    }
}

/// Lock timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_list_lock_timeout")]
    pub list_lock_timeout_secs: u64,
    #[serde(default = "default_mta_lock_timeout")]
    pub mta_lock_timeout_secs: u64,
}

fn default_list_lock_timeout() -> u64 {
    30
}
fn default_mta_lock_timeout() -> u64 {
    60
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            list_lock_timeout_secs: default_list_lock_timeout(),
            mta_lock_timeout_secs: default_mta_lock_timeout(),
        }
    }
}

/// Runner cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Seconds to sleep when a queue is empty
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval_secs: u64,
    /// Entries processed between refresh-hook invocations
    #[serde(default = "default_refresh_every")]
    pub refresh_every: u32,
}

fn default_sleep_interval() -> u64 {
    1
}
fn default_refresh_every() -> u32 {
    100
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sleep_interval_secs: default_sleep_interval(),
            refresh_every: default_refresh_every(),
        }
    }
}

/// Load configuration from a directory
pub fn load_config(dir: &Path) -> Result<Config> {
    load_config_from_file(&config_path(dir))
}

/// Load configuration from a specific file path
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}
