//! Configuration file support for Weft CLI tools

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;
use weft_client::{SchedulerConfig, SegmentLayout, SessionConfig};
use weft_protocol::{
    BufferControlConfig, BufferParams, EncoderConfig, MinRateConfig, TimelineConfig,
};
use weft_server::RegistryConfig;

/// Minimum-rate padding settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaddingConfig {
    /// Sliding window in milliseconds
    #[serde(default = "default_padding_window")]
    pub window_ms: u64,
    /// Minimum average rate in bytes per second
    pub min_bytes_per_sec: u64,
}

fn default_padding_window() -> u64 {
    1000
}

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Source path patterns; the first match gives the stream index and its
    /// capture groups the interleave key
    pub patterns: Vec<String>,
    /// Directory the interleave files are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Interleave file name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Bytes read from a source at a time
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    /// Minimum gap between timestamped chunks in milliseconds
    #[serde(default = "default_timestamp_interval")]
    pub timestamp_interval_ms: u64,
    /// Pace input to this rate (bytes per second per source)
    pub pace_bytes_per_sec: Option<u64>,
    /// Keep a debug checksum of each interleave
    #[serde(default)]
    pub checksum: bool,
    pub padding: Option<PaddingConfig>,
}

fn default_output_dir() -> String {
    ".".to_string()
}

fn default_prefix() -> String {
    "interleaved".to_string()
}

fn default_read_size() -> usize {
    1316
}

fn default_timestamp_interval() -> u64 {
    100
}

/// Player configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory URL holding the stream files
    pub base_url: String,
    /// Stream number in file names
    #[serde(default)]
    pub stream: u32,
    /// Fetch `interleaved{N}-*` instead of `chunk-stream{N}-*.m4s`
    #[serde(default)]
    pub interleaved: bool,
    /// Number of logical streams carried by the interleave
    #[serde(default = "default_streams")]
    pub streams: usize,
    /// Directory the received media is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Buffer parameters JSON; `params` is used when absent
    pub params_url: Option<String>,
    #[serde(default = "default_segment_duration")]
    pub segment_duration_ms: u64,
    #[serde(default = "default_pre_availability")]
    pub pre_availability_ms: u64,
    #[serde(default = "default_margin")]
    pub margin_ms: u64,
    /// Re-fetch the descriptor after this many segments
    #[serde(default = "default_refresh_every")]
    pub refresh_every: u64,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub buffer_control: BufferControlConfig,
    #[serde(default)]
    pub params: BufferParams,
}

fn default_streams() -> usize {
    1
}

fn default_segment_duration() -> u64 {
    1000
}

fn default_pre_availability() -> u64 {
    1000
}

fn default_margin() -> u64 {
    50
}

fn default_refresh_every() -> u64 {
    10
}

fn default_stats_interval() -> u64 {
    1
}

/// Combined configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mux: Option<MuxConfig>,
    pub client: Option<ClientConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example multiplexer configuration
    pub fn example_mux() -> Self {
        Config {
            mux: Some(MuxConfig {
                patterns: vec![
                    r"angle(\d+)/video\.ts$".to_string(),
                    r"angle(\d+)/audio\.aac$".to_string(),
                ],
                output_dir: "out".to_string(),
                prefix: default_prefix(),
                read_size: default_read_size(),
                timestamp_interval_ms: default_timestamp_interval(),
                pace_bytes_per_sec: Some(250_000),
                checksum: false,
                padding: Some(PaddingConfig {
                    window_ms: 1000,
                    min_bytes_per_sec: 16_000,
                }),
            }),
            client: None,
        }
    }

    /// Create example player configuration
    pub fn example_client() -> Self {
        Config {
            mux: None,
            client: Some(ClientConfig {
                base_url: "http://localhost:8080/live/".to_string(),
                stream: 0,
                interleaved: true,
                streams: 2,
                output_dir: "received".to_string(),
                params_url: None,
                segment_duration_ms: default_segment_duration(),
                pre_availability_ms: default_pre_availability(),
                margin_ms: default_margin(),
                refresh_every: default_refresh_every(),
                stats_interval_secs: default_stats_interval(),
                buffer_control: BufferControlConfig::default(),
                params: BufferParams::default(),
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            patterns: Vec::new(),
            output_dir: default_output_dir(),
            prefix: default_prefix(),
            read_size: default_read_size(),
            timestamp_interval_ms: default_timestamp_interval(),
            pace_bytes_per_sec: None,
            checksum: false,
            padding: None,
        }
    }
}

impl MuxConfig {
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            timestamp_interval: Duration::from_millis(self.timestamp_interval_ms),
            min_rate: self.padding.map(|p| {
                MinRateConfig::new(Duration::from_millis(p.window_ms), p.min_bytes_per_sec)
            }),
            checksum: self.checksum,
        }
    }

    pub fn registry_config(&self) -> Result<RegistryConfig, ConfigError> {
        if self.patterns.is_empty() {
            return Err(ConfigError::Invalid("no source patterns".to_string()));
        }
        if self.read_size == 0 {
            return Err(ConfigError::Invalid("read_size must be positive".to_string()));
        }
        Ok(RegistryConfig {
            patterns: self.patterns.clone(),
            encoder: self.encoder_config(),
        })
    }
}

impl ClientConfig {
    pub fn layout(&self) -> SegmentLayout {
        if self.interleaved {
            SegmentLayout::Interleaved {
                stream: self.stream,
            }
        } else {
            SegmentLayout::Plain {
                stream: self.stream,
            }
        }
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        if self.streams == 0 {
            return Err(ConfigError::Invalid("streams must be positive".to_string()));
        }
        if !self.interleaved && self.streams != 1 {
            return Err(ConfigError::Invalid(
                "plain segments carry exactly one stream".to_string(),
            ));
        }

        let mut scheduler = SchedulerConfig::new(Url::parse(&self.base_url)?, self.layout());
        scheduler.timeline = TimelineConfig {
            segment_duration: self.segment_duration(),
            pre_availability: Duration::from_millis(self.pre_availability_ms),
            margin: Duration::from_millis(self.margin_ms),
        };
        scheduler.refresh_every = self.refresh_every.max(1);

        Ok(SessionConfig {
            scheduler,
            buffer_control: self.buffer_control,
            params: self.params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_configs() {
        let mux = Config::example_mux();
        assert!(mux.mux.is_some());

        let client = Config::example_client();
        assert!(client.client.is_some());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::example_client();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        let client = parsed.client.unwrap();
        assert_eq!(client.streams, 2);
        assert_eq!(client.params, BufferParams::default());
    }

    #[test]
    fn test_client_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            base_url = "http://cdn.test/live"
            "#,
        )
        .unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.segment_duration_ms, 1000);
        assert_eq!(client.refresh_every, 10);
        assert_eq!(client.buffer_control, BufferControlConfig::default());

        let session = client.session_config().unwrap();
        assert_eq!(session.scheduler.layout, SegmentLayout::Plain { stream: 0 });
        assert_eq!(session.scheduler.timeline.margin, Duration::from_millis(50));
    }

    #[test]
    fn test_client_validation() {
        let mut client = Config::example_client().client.unwrap();
        client.interleaved = false;
        assert!(matches!(
            client.session_config(),
            Err(ConfigError::Invalid(_))
        ));

        client.interleaved = true;
        client.base_url = "not a url".to_string();
        assert!(matches!(client.session_config(), Err(ConfigError::Url(_))));
    }

    #[test]
    fn test_mux_encoder_config() {
        let mux = Config::example_mux().mux.unwrap();
        let encoder = mux.encoder_config();
        assert_eq!(encoder.timestamp_interval, Duration::from_millis(100));
        assert_eq!(
            encoder.min_rate.map(|c| c.evaluation_period()),
            Some(Duration::from_millis(500))
        );
        assert_eq!(mux.registry_config().unwrap().patterns.len(), 2);
    }
}
