//! Configuration management for deej-gw
//!
//! Handles loading, parsing, and hot-reloading of the YAML configuration file.

pub mod watcher;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::fs;
use tracing::{debug, warn};

use crate::link::PortSettings;
use crate::protocol::{DecoderOptions, NoiseReduction};
use crate::session::MASTER_TARGET;

pub use watcher::ConfigWatcher;

/// Lowest and highest allowed per-slider volume ceiling, in percent
pub const MIN_CEILING: i64 = 1;
pub const MAX_CEILING: i64 = 100;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    /// Slider index to one or more target specifiers
    #[serde(default = "default_slider_mapping")]
    pub slider_mapping: BTreeMap<usize, TargetList>,

    /// Named groups of process names, usable as a target
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,

    /// Processes kept out of `deej.unmapped`
    #[serde(default)]
    pub ignore_unmapped: Vec<String>,

    /// Per-slider volume ceiling in percent
    #[serde(default)]
    pub slider_max_volume: BTreeMap<usize, i64>,

    #[serde(default)]
    pub slider_names: Option<SliderNames>,

    #[serde(default)]
    pub invert_sliders: bool,

    #[serde(default = "default_com_port")]
    pub com_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default)]
    pub noise_reduction: NoiseReduction,
}

/// A single target or a list of targets for one slider
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TargetList {
    One(String),
    Many(Vec<String>),
}

impl TargetList {
    pub fn targets(&self) -> &[String] {
        match self {
            TargetList::One(target) => std::slice::from_ref(target),
            TargetList::Many(targets) => targets,
        }
    }
}

/// Slider labels: `"a|b|c"`, a list, or a map from index to label
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SliderNames {
    Joined(String),
    List(Vec<String>),
    Indexed(BTreeMap<usize, String>),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            slider_mapping: default_slider_mapping(),
            groups: HashMap::new(),
            ignore_unmapped: Vec::new(),
            slider_max_volume: BTreeMap::new(),
            slider_names: None,
            invert_sliders: false,
            com_port: default_com_port(),
            baud_rate: default_baud_rate(),
            noise_reduction: NoiseReduction::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::parse(&contents)
            .with_context(|| format!("Invalid config file: {}", path))?;

        debug!(
            sliders = config.slider_mapping.len(),
            com_port = %config.com_port,
            baud_rate = config.baud_rate,
            invert_sliders = config.invert_sliders,
            noise_reduction = %config.noise_reduction,
            "Loaded config"
        );

        Ok(config)
    }

    /// Parse, normalize, and validate YAML text
    pub fn parse(contents: &str) -> Result<Self> {
        // An empty file is a valid, all-defaults config
        let mut config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.normalize();
        config.validate()?;

        Ok(config)
    }

    /// Replace out-of-range values with usable ones, warning about each
    fn normalize(&mut self) {
        if self.com_port.trim().is_empty() {
            warn!(default = %default_com_port(), "Empty com_port specified, using default value");
            self.com_port = default_com_port();
        }

        if self.baud_rate == 0 {
            warn!(default = default_baud_rate(), "Invalid baud_rate specified, using default value");
            self.baud_rate = default_baud_rate();
        }

        for (slider, ceiling) in self.slider_max_volume.iter_mut() {
            if *ceiling < MIN_CEILING {
                warn!(slider, value = *ceiling, "Max volume too low, setting to {}", MIN_CEILING);
                *ceiling = MIN_CEILING;
            } else if *ceiling > MAX_CEILING {
                warn!(slider, value = *ceiling, "Max volume too high, setting to {}", MAX_CEILING);
                *ceiling = MAX_CEILING;
            }
        }
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        for (slider, targets) in &self.slider_mapping {
            for target in targets.targets() {
                if target.trim().is_empty() {
                    anyhow::bail!("Slider {} has an empty target name", slider);
                }
            }
        }

        for (group, members) in &self.groups {
            if group.trim().is_empty() {
                anyhow::bail!("Group name cannot be empty");
            }
            if members.is_empty() {
                anyhow::bail!("Group '{}' has no members", group);
            }
            if members.iter().any(|m| m.trim().is_empty()) {
                anyhow::bail!("Group '{}' has an empty member name", group);
            }
        }

        if self.ignore_unmapped.iter().any(|p| p.trim().is_empty()) {
            anyhow::bail!("ignore_unmapped cannot contain empty process names");
        }

        Ok(())
    }

    /// Options for the line decoder
    pub fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            invert_sliders: self.invert_sliders,
            noise_reduction: self.noise_reduction,
        }
    }

    /// Serial port and baud rate for the device link
    pub fn port_settings(&self) -> PortSettings {
        PortSettings::new(self.com_port.clone(), self.baud_rate)
    }

    /// Volume ceiling for a slider, in percent
    pub fn max_volume(&self, slider: usize) -> u8 {
        self.slider_max_volume
            .get(&slider)
            .map(|c| (*c).clamp(MIN_CEILING, MAX_CEILING) as u8)
            .unwrap_or(MAX_CEILING as u8)
    }

    /// Members of a group, looked up case-insensitively
    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|(group, _)| group.eq_ignore_ascii_case(name))
            .map(|(_, members)| members.as_slice())
    }

    /// Slider labels in index order; gaps in an indexed map become empty labels
    pub fn slider_names_list(&self) -> Vec<String> {
        match &self.slider_names {
            None => Vec::new(),
            Some(SliderNames::Joined(joined)) if joined.is_empty() => Vec::new(),
            Some(SliderNames::Joined(joined)) => joined.split('|').map(str::to_string).collect(),
            Some(SliderNames::List(names)) => names.clone(),
            Some(SliderNames::Indexed(map)) => {
                let len = map.keys().next_back().map_or(0, |last| last + 1);
                let mut names = vec![String::new(); len];
                for (index, name) in map {
                    names[*index] = name.clone();
                }
                names
            },
        }
    }
}

// Default value functions
fn default_slider_mapping() -> BTreeMap<usize, TargetList> {
    BTreeMap::from([(0, TargetList::One(MASTER_TARGET.to_string()))])
}
fn default_com_port() -> String { "COM4".to_string() }
fn default_baud_rate() -> u32 { 9600 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
slider_mapping:
  0: master
  1: chrome.exe
  2:
    - spotify.exe
    - games
  3: deej.unmapped
  4: mic

groups:
  games:
    - game.exe
    - launcher.exe

ignore_unmapped:
  - discord.exe

slider_max_volume:
  1: 50
  2: 250
  3: 0

slider_names: "Master|Chrome|Music|Other|Mic"
invert_sliders: true
com_port: COM7
baud_rate: 115200
noise_reduction: high
"#;

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::parse(FULL_CONFIG).unwrap();

        assert_eq!(config.slider_mapping.len(), 5);
        assert_eq!(config.slider_mapping[&1].targets(), ["chrome.exe"]);
        assert_eq!(config.slider_mapping[&2].targets(), ["spotify.exe", "games"]);
        assert_eq!(config.group("GAMES").unwrap(), ["game.exe", "launcher.exe"]);
        assert_eq!(config.ignore_unmapped, vec!["discord.exe"]);
        assert!(config.invert_sliders);
        assert_eq!(config.noise_reduction, NoiseReduction::High);

        let port = config.port_settings();
        assert_eq!(port.port, "COM7");
        assert_eq!(port.baud_rate, 115200);
    }

    #[test]
    fn test_max_volume_is_clamped() {
        let config = AppConfig::parse(FULL_CONFIG).unwrap();

        assert_eq!(config.max_volume(0), 100);
        assert_eq!(config.max_volume(1), 50);
        assert_eq!(config.max_volume(2), 100);
        assert_eq!(config.max_volume(3), 1);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::parse("").unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.slider_mapping[&0].targets(), ["master"]);
        assert_eq!(config.com_port, "COM4");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.noise_reduction, NoiseReduction::Default);
        assert!(config.slider_names_list().is_empty());
    }

    #[test]
    fn test_connection_fallbacks() {
        let config = AppConfig::parse("com_port: \"\"\nbaud_rate: 0\n").unwrap();

        assert_eq!(config.com_port, "COM4");
        assert_eq!(config.baud_rate, 9600);
    }

    #[test]
    fn test_slider_names_formats() {
        let joined = AppConfig::parse("slider_names: \"A|B|C\"").unwrap();
        assert_eq!(joined.slider_names_list(), vec!["A", "B", "C"]);

        let list = AppConfig::parse("slider_names: [A, B]").unwrap();
        assert_eq!(list.slider_names_list(), vec!["A", "B"]);

        let indexed = AppConfig::parse("slider_names:\n  0: A\n  2: C\n").unwrap();
        assert_eq!(indexed.slider_names_list(), vec!["A", "", "C"]);
    }

    #[test]
    fn test_decoder_options() {
        let config = AppConfig::parse("invert_sliders: true\nnoise_reduction: low\n").unwrap();
        let options = config.decoder_options();

        assert!(options.invert_sliders);
        assert_eq!(options.noise_reduction, NoiseReduction::Low);
    }

    #[test]
    fn test_validation_rejects_empty_names() {
        assert!(AppConfig::parse("slider_mapping:\n  0: \"\"\n").is_err());
        assert!(AppConfig::parse("groups:\n  empty: []\n").is_err());
        assert!(AppConfig::parse("ignore_unmapped: [\"\"]\n").is_err());
    }

    #[test]
    fn test_unknown_noise_level_is_rejected() {
        assert!(AppConfig::parse("noise_reduction: extreme\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, FULL_CONFIG)?;

        let config = AppConfig::load(&path.to_string_lossy()).await?;
        assert_eq!(config.com_port, "COM7");

        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = AppConfig::load("/nonexistent/deej-gw/config.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
