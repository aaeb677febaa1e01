use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config and data dirs.
const APP_DIR: &str = "ble-coordinator";

/// Where and how much the coordinator logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Filter directives, e.g. "info" or "ble_coordinator=debug,warn".
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    /// Rolling file output; off when unset.
    #[serde(default)]
    pub file: Option<LogFileSettings>,
    /// Adds source location and thread ids to every record.
    #[serde(default = "default_false")]
    pub verbose_records: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: default_true(),
            file: None,
            verbose_records: default_false(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogFileSettings {
    /// Defaults to `<local data dir>/ble-coordinator/logs`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub rotation: LogRotation,
}

impl LogFileSettings {
    pub fn resolved_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let mut dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine local data directory"))?;
        dir.push(APP_DIR);
        dir.push("logs");
        Ok(dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_prefix() -> String {
    "coordinator.log".to_string()
}

/// Timing knobs for the coordinator. All durations are milliseconds on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Auto-stop delay for a non-continuous scan.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Discoveries older than this are pruned by the sweeper.
    #[serde(default = "default_absence_interval_ms")]
    pub absence_interval_ms: u64,
    /// Keep scanning until `stop_scan` is called.
    #[serde(default = "default_false")]
    pub continuous_scan: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_enumerate_timeout_ms")]
    pub enumerate_timeout_ms: u64,
    /// Deadline for a write-with-response acknowledgement.
    #[serde(default = "default_send_data_timeout_ms")]
    pub send_data_timeout_ms: u64,
    /// No coordinator deadline on reads when unset.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    /// No coordinator deadline on subscribe acknowledgements when unset.
    #[serde(default)]
    pub subscribe_timeout_ms: Option<u64>,
    /// How often the absence sweeper runs.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Buffered notifications per observer before the slowest one lags.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            absence_interval_ms: default_absence_interval_ms(),
            continuous_scan: default_false(),
            connect_timeout_ms: default_connect_timeout_ms(),
            enumerate_timeout_ms: default_enumerate_timeout_ms(),
            send_data_timeout_ms: default_send_data_timeout_ms(),
            read_timeout_ms: None,
            subscribe_timeout_ms: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

fn default_scan_interval_ms() -> u64 {
    10_000
}
fn default_absence_interval_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_enumerate_timeout_ms() -> u64 {
    10_000
}
fn default_send_data_timeout_ms() -> u64 {
    5_000
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_notification_capacity() -> usize {
    64
}

impl CoordinatorSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn absence_interval(&self) -> Duration {
        Duration::from_millis(self.absence_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn enumerate_timeout(&self) -> Duration {
        Duration::from_millis(self.enumerate_timeout_ms)
    }

    pub fn send_data_timeout(&self) -> Duration {
        Duration::from_millis(self.send_data_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn subscribe_timeout(&self) -> Option<Duration> {
        self.subscribe_timeout_ms.map(Duration::from_millis)
    }

    /// Never zero, `tokio::time::interval` panics on a zero period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Loads from an explicit file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR);
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
