use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use dirs;
use crate::downloader::quality::{PriorityTable, TieBreak};
use crate::errors::{AppError, Result};

/// Which backend receives resolved downloads
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DownloadType {
    Aria2,
    IwaraDownloader,
    Browser,
    Others,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PriorityEntry {
    pub label: String,
    pub weight: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub api_base: String,
    pub site_base: String,
    pub authorization: Option<String>,
    pub refresh_token: Option<String>,
    pub cookies: String,
    pub signature_secret: String,
    pub download_type: DownloadType,
    pub download_path: String,
    pub download_proxy: String,
    pub aria2_path: String,
    pub aria2_token: String,
    pub iwara_downloader_path: String,
    pub iwara_downloader_token: String,
    pub priority: Vec<PriorityEntry>,
    pub preferred_quality: String,
    pub tie_break: TieBreak,
    pub check_priority_source: bool,
    pub check_download_link: bool,
    pub auto_follow: bool,
    pub auto_like: bool,
    pub request_timeout_secs: u64,
    pub comment_concurrency: usize,
    pub stall_speed_threshold: u64,
    pub reconcile_interval_secs: u64,
    pub native_download_enabled: bool,
    pub native_allowed_extensions: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.iwara.tv".to_string(),
            site_base: "https://www.iwara.tv".to_string(),
            authorization: None,
            refresh_token: None,
            cookies: String::new(),
            signature_secret: "5nFp9kmbNnHdAFhaqMvt".to_string(),
            download_type: DownloadType::Others,
            download_path: "/Iwara/%#AUTHOR#%/%#TITLE#%[%#ID#%].mp4".to_string(),
            download_proxy: String::new(),
            aria2_path: "http://127.0.0.1:6800/jsonrpc".to_string(),
            aria2_token: String::new(),
            iwara_downloader_path: "http://127.0.0.1:6800/jsonrpc".to_string(),
            iwara_downloader_token: String::new(),
            priority: vec![
                PriorityEntry { label: "Source".to_string(), weight: 100 },
                PriorityEntry { label: "540".to_string(), weight: 2 },
                PriorityEntry { label: "360".to_string(), weight: 1 },
            ],
            preferred_quality: "Source".to_string(),
            tie_break: TieBreak::Random,
            check_priority_source: true,
            check_download_link: true,
            auto_follow: false,
            auto_like: false,
            request_timeout_secs: 30,
            comment_concurrency: 8,
            stall_speed_threshold: 1024,
            reconcile_interval_secs: 60,
            native_download_enabled: true,
            native_allowed_extensions: vec![
                "mp4".to_string(),
                "webm".to_string(),
                "mkv".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Layers defaults, the JSON file at `config_path` and `IWARA_DL_*` environment variables
    ///
    /// `IWARA_DL_COMMENT_CONCURRENCY=4` sets `comment_concurrency`; `__` separates nested keys.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        Self::load_layered(config_path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("IWARA_DL")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_layered(config_path: &Path, environment: config::Environment) -> Result<Self> {
        if !config_path.exists() {
            AppConfig::default().save_to(config_path)?;
        }

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(
                config::File::from(config_path.to_path_buf())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(environment)
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::get_app_dir(dirs::config_dir())?.join("config.json"))
    }

    pub fn get_data_dir() -> Result<PathBuf> {
        Self::get_app_dir(dirs::data_dir())
    }

    fn get_app_dir(base: Option<PathBuf>) -> Result<PathBuf> {
        let base = base.ok_or_else(|| {
            AppError::Config(config::ConfigError::Message(
                "Could not find config directory".to_string(),
            ))
        })?;
        Ok(base.join("iwara-dl"))
    }

    pub fn priority_table(&self) -> PriorityTable {
        PriorityTable::new(
            self.priority
                .iter()
                .map(|entry| (entry.label.clone(), entry.weight)),
        )
    }
}

pub type ConfigListener = Box<dyn Fn(&str, &AppConfig) + Send + Sync>;

/// Shared configuration with change listeners.
///
/// Every field modified through [`ConfigStore::update`] or [`ConfigStore::set_field`]
/// is persisted and then reported to each registered listener, in registration order,
/// before the call returns.
pub struct ConfigStore {
    config: RwLock<AppConfig>,
    listeners: Mutex<Vec<ConfigListener>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(config: AppConfig, path: Option<PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            listeners: Mutex::new(Vec::new()),
            path,
        }
    }

    pub fn snapshot(&self) -> AppConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self, listener: ConfigListener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    /// Applies `change` and returns the names of the fields that actually changed
    pub fn update<F>(&self, change: F) -> Result<Vec<String>>
    where
        F: FnOnce(&mut AppConfig),
    {
        let (before, after) = {
            let mut guard = self
                .config
                .write()
                .map_err(|_| AppError::Validation("configuration lock poisoned".to_string()))?;
            let before = serde_json::to_value(&*guard)?;
            change(&mut guard);
            (before, guard.clone())
        };

        let changed = changed_fields(&before, &serde_json::to_value(&after)?);
        if changed.is_empty() {
            return Ok(changed);
        }

        if let Some(path) = &self.path {
            after.save_to(path)?;
        }

        if let Ok(listeners) = self.listeners.lock() {
            for field in &changed {
                for listener in listeners.iter() {
                    listener(field, &after);
                }
            }
        }

        Ok(changed)
    }

    /// Sets one field by name; `raw` is parsed as JSON and falls back to a plain string
    pub fn set_field(&self, field: &str, raw: &str) -> Result<Vec<String>> {
        let mut value = serde_json::to_value(self.snapshot())?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| AppError::Validation("configuration is not an object".to_string()))?;
        if !object.contains_key(field) {
            return Err(AppError::Validation(format!("Unknown configuration field: {}", field)));
        }

        let parsed = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        object.insert(field.to_string(), parsed);

        let updated: AppConfig = serde_json::from_value(value)
            .map_err(|e| AppError::Validation(format!("Invalid value for {}: {}", field, e)))?;
        self.update(|config| *config = updated)
    }
}

fn changed_fields(before: &serde_json::Value, after: &serde_json::Value) -> Vec<String> {
    match (before.as_object(), after.as_object()) {
        (Some(before), Some(after)) => after
            .iter()
            .filter(|(key, value)| before.get(key.as_str()) != Some(value))
            .map(|(key, _)| key.clone())
            .collect(),
        _ => Vec::new(),
    }
}
