//! Configuration for the audio output core
//!
//! Loaded once from TOML at startup; pipelines read it at creation time only.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (applied by the binary on top of the file)
//! 2. `SONANCE_CONFIG` environment variable naming a config file
//! 3. Per-user config file (`~/.config/sonance/config.toml` on Linux)
//! 4. Built-in defaults (code constants below)
//!
//! ```toml
//! [output]
//! rate = 48000
//! channels = "stereo"
//! encoding = "s16l"
//! backend = "wav"
//! wav_path = "out.wav"
//!
//! [mixer]
//! float = true
//! normalization = "sum"
//!
//! [input]
//! pts_tolerance_us = 40000
//! ```

use crate::error::{AoutError, Result};
use crate::filter::DriftParams;
use crate::format::{AudioSampleFormat, ChannelMask, SampleEncoding};
use crate::mixer::MixPolicy;
use serde::Deserialize;
use sonance_common::config::{load_toml_file, resolve_config_path};
use sonance_common::timing::Mtime;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "SONANCE_CONFIG";

/// Directory name under the OS config dir
pub const APP_NAME: &str = "sonance";

/// Complete configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AoutConfig {
    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub mixer: MixerConfig,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Output backend and format request
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Requested output sample rate
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Layout name: mono, stereo, 3.0, quad, 5.0, 5.1, 6.1, 7.1
    #[serde(default = "default_channels")]
    pub channels: String,

    #[serde(default = "default_encoding")]
    pub encoding: SampleEncoding,

    /// Frames per mixed buffer
    #[serde(default = "default_samples_per_buffer")]
    pub samples_per_buffer: usize,

    /// How far ahead of the clock the output fifo is kept filled
    #[serde(default = "default_latency_us")]
    pub latency_us: Mtime,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_wav_path")]
    pub wav_path: PathBuf,

    /// Channel permutation applied last (output channel i takes channel remap[i])
    #[serde(default)]
    pub remap: Option<Vec<usize>>,
}

/// Which backend drives the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Discard everything
    Null,
    /// Simulated sound card writing a WAV file
    #[default]
    Wav,
}

/// Mixer behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct MixerConfig {
    /// Mix in fl32 (allows a software volume multiplier); s16l otherwise
    #[serde(default = "default_true")]
    pub float: bool,

    #[serde(default)]
    pub normalization: MixPolicy,

    /// Produce silence when no input has data; skip the cycle otherwise
    #[serde(default = "default_true")]
    pub produce_silence: bool,

    /// Initial software gain (float mixer only)
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
}

/// Per-input tunables
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Caching delay added to every input date
    #[serde(default)]
    pub caching_us: Mtime,

    /// User audio desynchronization added to every input date
    #[serde(default)]
    pub desync_us: Mtime,

    /// Drift tolerated before resampling kicks in
    #[serde(default = "default_pts_tolerance_us")]
    pub pts_tolerance_us: Mtime,

    /// Drift beyond which the input fifo is flushed instead of corrected
    #[serde(default = "default_max_drift_us")]
    pub max_drift_us: Mtime,

    /// Drift correction ramp per buffer, in Hz
    #[serde(default = "default_resampler_step_hz")]
    pub resampler_step_hz: i32,

    /// Drift correction cap, in percent of the rate
    #[serde(default = "default_resampler_max_percent")]
    pub resampler_max_percent: u32,

    /// Consecutive buffer failures before the input is marked in error
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_rate() -> u32 {
    44_100
}

fn default_channels() -> String {
    "stereo".to_string()
}

fn default_encoding() -> SampleEncoding {
    SampleEncoding::S16L
}

fn default_samples_per_buffer() -> usize {
    1024
}

fn default_latency_us() -> Mtime {
    100_000
}

fn default_wav_path() -> PathBuf {
    PathBuf::from("sonance-out.wav")
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> f32 {
    1.0
}

fn default_pts_tolerance_us() -> Mtime {
    40_000
}

fn default_max_drift_us() -> Mtime {
    120_000
}

fn default_resampler_step_hz() -> i32 {
    2
}

fn default_resampler_max_percent() -> u32 {
    1
}

fn default_error_threshold() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            channels: default_channels(),
            encoding: default_encoding(),
            samples_per_buffer: default_samples_per_buffer(),
            latency_us: default_latency_us(),
            backend: BackendKind::default(),
            wav_path: default_wav_path(),
            remap: None,
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            float: true,
            normalization: MixPolicy::default(),
            produce_silence: true,
            multiplier: default_multiplier(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            caching_us: 0,
            desync_us: 0,
            pts_tolerance_us: default_pts_tolerance_us(),
            max_drift_us: default_max_drift_us(),
            resampler_step_hz: default_resampler_step_hz(),
            resampler_max_percent: default_resampler_max_percent(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AoutConfig {
    /// Resolve and load the config file, falling back to defaults
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path, CONFIG_ENV_VAR, APP_NAME) {
            Some(path) => {
                info!("Loading config from {}", path.display());
                let config: Self = load_toml_file(&path)?;
                config.validate()?;
                Ok(config)
            }
            None => {
                info!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values no pipeline can run with
    pub fn validate(&self) -> Result<()> {
        self.output_format()?.validate()?;
        if self.output.samples_per_buffer == 0 {
            return Err(AoutError::Format("samples_per_buffer must be > 0".to_string()));
        }
        if !self.mixer.multiplier.is_finite() || self.mixer.multiplier < 0.0 {
            return Err(AoutError::Format(format!(
                "invalid mixer multiplier {}",
                self.mixer.multiplier
            )));
        }
        if self.input.pts_tolerance_us < 0 || self.input.max_drift_us < self.input.pts_tolerance_us {
            return Err(AoutError::Format(
                "max_drift_us must be >= pts_tolerance_us >= 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Output format requested from the backend
    pub fn output_format(&self) -> Result<AudioSampleFormat> {
        let channels = ChannelMask::from_layout_name(&self.output.channels).ok_or_else(|| {
            AoutError::Format(format!("unknown channel layout '{}'", self.output.channels))
        })?;
        Ok(AudioSampleFormat::new(
            self.output.encoding,
            channels,
            self.output.rate,
        ))
    }

    /// Drift correction parameters at `rate`
    pub fn drift_params(&self, rate: u32) -> DriftParams {
        DriftParams::for_rate(
            rate,
            self.input.pts_tolerance_us,
            self.input.resampler_step_hz,
            self.input.resampler_max_percent,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AoutConfig::default();
        assert_eq!(config.output.rate, 44_100);
        assert_eq!(config.output.backend, BackendKind::Wav);
        assert!(config.mixer.float);
        assert!(config.mixer.produce_silence);
        assert_eq!(config.input.pts_tolerance_us, 40_000);
        assert!(config.validate().is_ok());

        let format = config.output_format().unwrap();
        assert_eq!(format.nb_channels(), 2);
        assert_eq!(format.encoding(), SampleEncoding::S16L);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AoutConfig = toml::from_str(
            r#"
            [output]
            rate = 48000
            channels = "5.1"
            encoding = "fl32"
            backend = "null"
            remap = [1, 0, 2, 3, 4, 5]

            [mixer]
            float = false
            normalization = "average"
            "#,
        )
        .unwrap();

        assert_eq!(config.output.rate, 48_000);
        assert_eq!(config.output.backend, BackendKind::Null);
        assert_eq!(config.output.samples_per_buffer, 1024);
        assert_eq!(config.output_format().unwrap().nb_channels(), 6);
        assert_eq!(config.output.remap.as_deref(), Some(&[1, 0, 2, 3, 4, 5][..]));
        assert!(!config.mixer.float);
        assert_eq!(config.mixer.normalization, MixPolicy::Average);
        assert_eq!(config.input.max_drift_us, 120_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AoutConfig::default();
        config.output.channels = "9.2".to_string();
        assert!(config.validate().is_err());

        let mut config = AoutConfig::default();
        config.mixer.multiplier = -1.0;
        assert!(config.validate().is_err());

        let mut config = AoutConfig::default();
        config.input.max_drift_us = 1_000;
        assert!(config.validate().is_err());
    }
}
