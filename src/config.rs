//! Persisted server configuration.
//!
//! Mirrors the options MOC reads from `config` (see spec §6): sound driver
//! selection, buffering knobs, queue/playlist behavior and the tags cache
//! size. Loaded once at startup from a TOML file in the per-user config
//! directory (located with `etcetera`, same as the teacher's `System::new`).

use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::Context};
use etcetera::BaseStrategy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    /// Name of the preferred output driver; the first one whose `init`
    /// succeeds wins (spec §4.5). Empty string means "try all in order".
    pub sound_driver: String,
    /// Output ring buffer capacity in kilobytes (spec §3, `OutputBuffer`).
    pub output_buffer_kb: u32,
    /// KB of network stream data to prebuffer before decoding (spec §4.1/§4.6).
    pub prebuffering_kb: u32,
    /// Force every output open to this sample rate; 0 means "use the
    /// decoded rate, let the driver/conversion layer sort it out".
    pub force_sample_rate: u32,
    pub allow_24bit_output: bool,
    pub shuffle: bool,
    pub repeat: bool,
    pub auto_next: bool,
    pub precache: bool,
    pub sync_playlist: bool,
    pub read_tags: bool,
    pub show_stream_errors: bool,
    pub on_song_change: Option<String>,
    pub on_stop: Option<String>,
    pub repeat_song_change: bool,
    /// Ordered extension/MIME -> decoder preferences (spec §4.4).
    pub preferred_decoders: Vec<String>,
    pub tags_cache_size: u32,
    pub music_dir: Option<Utf8PathBuf>,
    pub moc_dir: Option<Utf8PathBuf>,
    pub queue_next_song_return: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sound_driver: String::new(),
            output_buffer_kb: 512,
            prebuffering_kb: 64,
            force_sample_rate: 0,
            allow_24bit_output: false,
            shuffle: false,
            repeat: false,
            auto_next: true,
            precache: true,
            sync_playlist: true,
            read_tags: true,
            show_stream_errors: false,
            on_song_change: None,
            on_stop: None,
            repeat_song_change: false,
            preferred_decoders: Vec::new(),
            tags_cache_size: 256,
            music_dir: None,
            moc_dir: None,
            queue_next_song_return: false,
        }
    }
}

impl Options {
    pub fn output_buffer_bytes(&self) -> usize {
        self.output_buffer_kb as usize * 1024
    }

    pub fn prebuffering_bytes(&self) -> usize {
        self.prebuffering_kb as usize * 1024
    }

    pub fn prebuffering_duration_hint(&self) -> Duration {
        // Used only for logging/backoff; the real gate is byte-based (spec §4.6 step 1).
        Duration::from_millis(200)
    }

    /// Resolve (and create if missing) the directory holding the socket,
    /// pid file, tags cache and `eqsets/`.
    pub fn moc_dir(&self) -> Result<Utf8PathBuf> {
        if let Some(dir) = &self.moc_dir {
            return Ok(dir.clone());
        }
        let dirs = etcetera::choose_base_strategy().wrap_err("Could not resolve HOME")?;
        Utf8PathBuf::from_path_buf(dirs.config_dir().join("mocrs"))
            .map_err(|p| color_eyre::eyre::eyre!("Config dir is not valid UTF-8: {p:?}"))
    }

    pub fn eqsets_dir(&self) -> Result<Utf8PathBuf> {
        Ok(self.moc_dir()?.join("eqsets"))
    }

    pub fn load(path: &Utf8PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read config file at {path}"))?;
        toml::from_str(&text).wrap_err_with(|| format!("Could not parse config file at {path}"))
    }

    pub fn save(&self, path: &Utf8PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Could not create config dir {parent}"))?;
        }
        let text = toml::to_string_pretty(self).wrap_err("Could not serialize config")?;
        std::fs::write(path, text).wrap_err_with(|| format!("Could not write config to {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_moc_documented_behavior() {
        let opts = Options::default();
        assert!(opts.auto_next);
        assert!(!opts.shuffle);
        assert!(!opts.repeat);
        assert_eq!(opts.output_buffer_bytes(), 512 * 1024);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut opts = Options::default();
        opts.shuffle = true;
        opts.tags_cache_size = 42;
        let text = toml::to_string_pretty(&opts).unwrap();
        let back: Options = toml::from_str(&text).unwrap();
        assert_eq!(back.shuffle, true);
        assert_eq!(back.tags_cache_size, 42);
    }
}
