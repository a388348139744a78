use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, Environment, File};
use serde::Deserialize;
use serde::de::{self, Visitor};

use crate::cli::{Cli, LogFormat};
use crate::util::{parse_byte_size, parse_flexible_duration};

/// Short-form environment variables kept for compatibility with existing
/// deployments; each maps onto a dotted configuration key.
const ENV_SHORTCUTS: [(&str, &str); 13] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("IMAGES_BASE_DIR", "storage.base_dir"),
    ("CACHE_DIR", "storage.cache_dir"),
    ("MAX_WIDTH", "resize.max_width"),
    ("MAX_HEIGHT", "resize.max_height"),
    ("JPG_QUALITY", "resize.jpg_quality"),
    ("WEBP_QUALITY", "resize.webp_quality"),
    ("AVIF_QUALITY", "resize.avif_quality"),
    ("PNG_COMPRESSION", "resize.png_compression"),
    ("AVIF_SPEED", "resize.avif_speed"),
    ("TTL", "cache.ttl"),
    ("CLEANUP_INTERVAL", "cache.cleanup_interval"),
];

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_base_dir() -> String {
    "/data/base".to_string()
}

fn default_cache_dir() -> String {
    "/data/cache".to_string()
}

fn default_max_dimension() -> u32 {
    2000
}

fn default_jpg_quality() -> u8 {
    80
}

fn default_webp_quality() -> u8 {
    75
}

fn default_avif_quality() -> u8 {
    75
}

fn default_png_compression() -> u8 {
    6
}

fn default_avif_speed() -> u8 {
    8
}

fn default_ttl() -> HumanDuration {
    HumanDuration(Duration::from_secs(30 * 86_400))
}

fn default_cleanup_interval() -> HumanDuration {
    HumanDuration(Duration::from_secs(86_400))
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub resize: ResizeSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResizeSettings {
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    #[serde(default = "default_jpg_quality")]
    pub jpg_quality: u8,
    #[serde(default = "default_webp_quality")]
    pub webp_quality: u8,
    #[serde(default = "default_avif_quality")]
    pub avif_quality: u8,
    #[serde(default = "default_png_compression")]
    pub png_compression: u8,
    #[serde(default = "default_avif_speed")]
    pub avif_speed: u8,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            jpg_quality: default_jpg_quality(),
            webp_quality: default_webp_quality(),
            avif_quality: default_avif_quality(),
            png_compression: default_png_compression(),
            avif_speed: default_avif_speed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl")]
    pub ttl: HumanDuration,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: HumanDuration,
    #[serde(default)]
    pub memory_cache_size: ByteSize,
    #[serde(default)]
    pub max_memory_chunk: ByteSize,
    #[serde(default)]
    pub storage_hot_cache_size: ByteSize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            cleanup_interval: default_cleanup_interval(),
            memory_cache_size: ByteSize::default(),
            max_memory_chunk: ByteSize::default(),
            storage_hot_cache_size: ByteSize::default(),
        }
    }
}

/// Ordered regex rewrite; the first matching rule wins.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub replacement: String,
}

/// Duration configured as a human-friendly string (`30d`, `12h30m`, `45s`);
/// `0` disables the feature it guards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct HumanDurationVisitor;

        impl Visitor<'_> for HumanDurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string such as '30d' or '12h30m'")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                let trimmed = value.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                    return Ok(HumanDuration(Duration::ZERO));
                }
                parse_flexible_duration(trimmed)
                    .map(HumanDuration)
                    .map_err(|err| E::custom(err.to_string()))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(HumanDuration(Duration::from_secs(value)))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom("duration must be non-negative"));
                }
                Ok(HumanDuration(Duration::from_secs(value as u64)))
            }
        }

        deserializer.deserialize_any(HumanDurationVisitor)
    }
}

/// Capacity configured as a human-friendly string (`512kb`, `2mb`, `1gib`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte size such as '512kb' or '2mb'")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                let trimmed = value.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                    return Ok(ByteSize(0));
                }
                parse_byte_size(trimmed)
                    .map(ByteSize)
                    .map_err(|err| E::custom(err.to_string()))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(ByteSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom("size must be non-negative"));
                }
                Ok(ByteSize(value as u64))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

impl Settings {
    /// Loads configuration from the optional YAML file, then applies
    /// `FARS_<SECTION>__<KEY>` scoped environment overrides and the
    /// short-form aliases, then validates.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix("FARS").separator("__"));
        for (variable, key) in ENV_SHORTCUTS {
            if let Ok(value) = std::env::var(variable)
                && !value.trim().is_empty()
            {
                builder = builder
                    .set_override(key, value)
                    .with_context(|| format!("apply environment override {variable}"))?;
            }
        }
        let settings: Settings = builder
            .build()
            .context("load configuration")?
            .try_deserialize()
            .context("decode configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.server.host.trim().is_empty(),
            "server.host must be set"
        );
        ensure!(self.server.port > 0, "server.port must be between 1 and 65535");
        ensure!(
            !self.storage.base_dir.trim().is_empty(),
            "storage.base_dir must be set"
        );
        ensure!(
            !self.storage.cache_dir.trim().is_empty(),
            "storage.cache_dir must be set"
        );
        ensure_dir_exists(&self.storage.base_dir)
            .context("validate storage.base_dir")?;
        ensure_dir_exists(&self.storage.cache_dir)
            .context("validate storage.cache_dir")?;
        ensure!(
            self.resize.max_width > 0 && self.resize.max_height > 0,
            "resize max dimensions must be positive"
        );
        ensure!(
            (1..=100).contains(&self.resize.jpg_quality),
            "resize.jpg_quality must be within 1-100, got {}",
            self.resize.jpg_quality
        );
        ensure!(
            self.resize.webp_quality <= 100,
            "resize.webp_quality must be within 0-100, got {}",
            self.resize.webp_quality
        );
        ensure!(
            self.resize.avif_quality <= 100,
            "resize.avif_quality must be within 0-100, got {}",
            self.resize.avif_quality
        );
        ensure!(
            self.resize.png_compression <= 9,
            "resize.png_compression must be within 0-9, got {}",
            self.resize.png_compression
        );
        ensure!(
            self.resize.avif_speed <= 8,
            "resize.avif_speed must be within 0-8, got {}",
            self.resize.avif_speed
        );
        if self.cache.memory_cache_size.0 > 0 && self.cache.max_memory_chunk.0 > 0 {
            ensure!(
                self.cache.max_memory_chunk.0 <= self.cache.memory_cache_size.0,
                "cache.max_memory_chunk must not exceed cache.memory_cache_size"
            );
        }
        for (index, rule) in self.rewrites.iter().enumerate() {
            if rule.pattern.trim().is_empty() {
                bail!("rewrite rule {index} has empty pattern");
            }
            regex::Regex::new(&rule.pattern)
                .with_context(|| format!("compile rewrite rule {index}"))?;
        }
        Ok(())
    }
}

fn ensure_dir_exists(path: &str) -> Result<()> {
    let sanitized = path.trim();
    ensure!(!sanitized.is_empty(), "path cannot be empty");
    let path = Path::new(sanitized);
    match std::fs::metadata(path) {
        Ok(info) => {
            ensure!(info.is_dir(), "path {sanitized} is not a directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).with_context(|| format!("create dir {sanitized}"))
        }
        Err(err) => Err(err.into()),
    }
}
