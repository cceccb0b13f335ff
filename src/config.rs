use crate::resolver::ResolverOptions;
use anyhow::{anyhow, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = ".calendar_chat";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// false の場合はローカルのキーワード解釈のみを使う
    #[serde(default)]
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: Option<String>,
    pub timezone: Option<String>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub roll_month_day_to_next_year: bool,
    pub implicit_afternoon_until: Option<u32>,
    /// 時刻のない追加を終日ではなくこの時刻にする（"HH:MM"）
    pub default_time: Option<String>,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: Some("https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: Some("gemini-2.5-flash".to_string()),
            temperature: Some(0.2),
            max_tokens: Some(500),
            timeout_secs: Some(5),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            timezone: Some("Asia/Seoul".to_string()),
            verbose: Some(false),
        }
    }
}

impl Config {
    pub fn timezone(&self) -> Result<Tz> {
        let name = self.app.timezone.as_deref().unwrap_or("Asia/Seoul");
        name.parse::<Tz>()
            .map_err(|e| anyhow!("Unknown timezone '{}': {}", name, e))
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            roll_month_day_to_next_year: self.resolver.roll_month_day_to_next_year,
            implicit_afternoon_until: self.resolver.implicit_afternoon_until,
        }
    }

    pub fn default_time(&self) -> Result<Option<NaiveTime>> {
        match self.resolver.default_time.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => NaiveTime::parse_from_str(raw, "%H:%M")
                .map(Some)
                .map_err(|e| anyhow!("Invalid resolver.default_time '{}': {}", raw, e)),
        }
    }

    pub fn delegation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.llm.timeout_secs.unwrap_or(5))
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_directory()?;
        Self::with_dir(config_dir)
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();
        let config_file = config_dir.join("config.toml");

        // 設定ディレクトリが存在しない場合は作成
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }

        Ok(Self {
            config_dir,
            config_file,
        })
    }

    pub fn load_config(&self) -> Result<Config> {
        // 1. 設定ファイルから読み込み
        let mut config = if self.config_file.exists() {
            self.load_from_file(&self.config_file)?
        } else {
            let default_config = Config::default();
            self.save_config(&default_config)?;
            default_config
        };

        // 2. 環境変数で上書き
        self.override_with_env_vars(&mut config);

        Ok(config)
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        let toml_content = toml::to_string_pretty(config)?;
        fs::write(&self.config_file, toml_content)?;
        Ok(())
    }

    pub fn create_sample_config(&self) -> Result<PathBuf> {
        let sample_file = self.config_dir.join("config.sample.toml");
        fs::write(&sample_file, Self::sample_config_content())?;
        Ok(sample_file)
    }

    fn load_from_file(&self, file_path: &Path) -> Result<Config> {
        let content = fs::read_to_string(file_path)?;

        match file_path.extension().and_then(|s| s.to_str()) {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| anyhow!("JSON parse error: {}", e))
            }
            _ => toml::from_str(&content).map_err(|e| anyhow!("TOML parse error: {}", e)),
        }
    }

    fn override_with_env_vars(&self, config: &mut Config) {
        if let Ok(api_key) = env::var("GEMINI_API_KEY") {
            config.llm.api_key = Some(api_key);
        }
        if let Ok(api_key) = env::var("LLM_API_KEY") {
            config.llm.api_key = Some(api_key);
        }
        if let Ok(base_url) = env::var("LLM_BASE_URL") {
            config.llm.base_url = Some(base_url);
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm.model = Some(model);
        }
        if let Ok(timezone) = env::var("CALENDAR_TIMEZONE") {
            config.app.timezone = Some(timezone);
        }
        if let Ok(data_dir) = env::var("CALENDAR_DATA_DIR") {
            config.app.data_dir = Some(data_dir);
        }
    }

    fn sample_config_content() -> &'static str {
        r#"# Calendar Chat Agent Configuration File
# Copy this to config.toml and customize as needed.

[llm]
# Delegate command interpretation to an external model (default: false)
# enabled = true

# API key (or set GEMINI_API_KEY / LLM_API_KEY)
# api_key = "your-api-key-here"

# base_url = "https://generativelanguage.googleapis.com/v1beta"
# model = "gemini-2.5-flash"
# temperature = 0.2
# max_tokens = 500

# Seconds to wait for the model before answering "please retry" (default: 5)
# timeout_secs = 5

[app]
# data_dir = "~/.calendar_chat"
# timezone = "Asia/Seoul"
# verbose = false

[resolver]
# Move an already-passed "M월 D일" to next year (default: false)
# roll_month_day_to_next_year = false

# Read hours 1..=N without 오전/오후 as afternoon, e.g. 7 makes "3시" 15:00
# implicit_afternoon_until = 7

# Time for added events without a time; unset means all-day
# default_time = "09:00"
"#
    }

    fn get_config_directory() -> Result<PathBuf> {
        let home_dir =
            dirs::home_dir().ok_or_else(|| anyhow!("홈 디렉터리를 찾을 수 없습니다"))?;

        Ok(home_dir.join(APP_DIR_NAME))
    }

    pub fn get_config_directory_path(&self) -> &Path {
        &self.config_dir
    }

    pub fn get_config_file_path(&self) -> &Path {
        &self.config_file
    }

    /// `app.data_dir` があればそれを、なければ設定ディレクトリをデータ置き場にする
    pub fn data_directory(&self, config: &Config) -> PathBuf {
        match config.app.data_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => self.config_dir.clone(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = ConfigManager::with_dir(dir.path())?;

        let config = manager.load_config()?;
        assert!(manager.get_config_file_path().exists());
        assert!(!config.llm.enabled);
        assert_eq!(config.llm.timeout_secs, Some(5));
        assert_eq!(config.timezone()?, chrono_tz::Asia::Seoul);
        assert_eq!(config.default_time()?, None);
        Ok(())
    }

    #[test]
    fn test_partial_config_fills_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = ConfigManager::with_dir(dir.path())?;
        fs::write(
            manager.get_config_file_path(),
            "[resolver]\nroll_month_day_to_next_year = true\ndefault_time = \"09:00\"\n",
        )?;

        let config = manager.load_from_file(manager.get_config_file_path())?;
        assert!(config.resolver.roll_month_day_to_next_year);
        assert_eq!(config.default_time()?, NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(config.llm.model.as_deref(), Some("gemini-2.5-flash"));
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let mut config = Config::default();
        config.app.timezone = Some("Mars/Olympus".to_string());
        config.resolver.default_time = Some("nine".to_string());
        assert!(config.timezone().is_err());
        assert!(config.default_time().is_err());
    }

    #[test]
    fn test_sample_config_is_valid_toml() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = ConfigManager::with_dir(dir.path())?;
        let sample = manager.create_sample_config()?;
        let parsed: Config = toml::from_str(&fs::read_to_string(sample)?)?;
        assert!(!parsed.llm.enabled);
        Ok(())
    }
}
