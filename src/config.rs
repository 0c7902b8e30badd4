use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub banks: Vec<PictureBankConfig>,
}

/// External tool used to identify pictures and render thumbnails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageTool {
    /// Decode in process with the `image` crate.
    #[default]
    Builtin,
    /// Shell out to ImageMagick's `identify` and `convert`.
    Magick,
}

/// Identity and tuning of a single picture bank.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PictureBankConfig {
    pub picture_bank_id: u32,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_picture_root")]
    pub picture_root: PathBuf,

    #[serde(default = "default_thumbnail_root")]
    pub thumbnail_root: PathBuf,

    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    /// Minimum time between a picture modification and its write-back.
    #[serde(default = "default_write_delay_seconds")]
    pub write_delay_seconds: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_identify: usize,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_other: usize,

    /// Longest side of generated thumbnails, in pixels.
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    /// Depth limit for directory imports. Unlimited when absent.
    #[serde(default)]
    pub max_directory_depth: Option<usize>,

    #[serde(default)]
    pub image_tool: ImageTool,
}

fn default_bank_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picbank")
        .join("default")
}

fn default_db_path() -> PathBuf {
    default_bank_dir().join("picbank.db")
}

fn default_picture_root() -> PathBuf {
    default_bank_dir().join("pictures")
}

fn default_thumbnail_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("picbank/default/thumbnails")
}

fn default_index_dir() -> PathBuf {
    default_bank_dir().join("index")
}

fn default_write_delay_seconds() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    2
}

fn default_thumbnail_size() -> u32 {
    128
}

impl PictureBankConfig {
    /// Lay out a bank entirely under `base`.
    pub fn in_dir(picture_bank_id: u32, base: &Path) -> Self {
        Self {
            picture_bank_id,
            name: format!("bank-{}", picture_bank_id),
            db_path: base.join("picbank.db"),
            picture_root: base.join("pictures"),
            thumbnail_root: base.join("thumbnails"),
            index_dir: base.join("index"),
            write_delay_seconds: default_write_delay_seconds(),
            max_concurrent_identify: default_max_concurrent(),
            max_concurrent_other: default_max_concurrent(),
            thumbnail_size: default_thumbnail_size(),
            max_directory_depth: None,
            image_tool: ImageTool::default(),
        }
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_seconds.saturating_mul(1000))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        if let Ok(path) = std::env::var("PICBANK_CONFIG_DIR") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("picbank")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_minimal_bank_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[banks]]
            picture_bank_id = 7
            db_path = "/tmp/bank7/picbank.db"
            "#,
        )
        .unwrap();

        let bank = &config.banks[0];
        assert_eq!(bank.picture_bank_id, 7);
        assert_eq!(bank.db_path, PathBuf::from("/tmp/bank7/picbank.db"));
        assert_eq!(bank.write_delay_seconds, 5);
        assert_eq!(bank.write_delay(), Duration::from_millis(5000));
        assert_eq!(bank.max_concurrent_identify, 2);
        assert_eq!(bank.thumbnail_size, 128);
        assert_eq!(bank.image_tool, ImageTool::Builtin);
        assert_eq!(bank.max_directory_depth, None);
    }

    #[test]
    fn test_image_tool_is_lowercase() {
        let bank: PictureBankConfig = toml::from_str(
            r#"
            picture_bank_id = 1
            image_tool = "magick"
            "#,
        )
        .unwrap();
        assert_eq!(bank.image_tool, ImageTool::Magick);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            banks: vec![
                PictureBankConfig::in_dir(1, &dir.path().join("one")),
                PictureBankConfig::in_dir(2, &dir.path().join("two")),
            ],
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.banks, config.banks);
    }
}
