//! Output driver interface and the cpal-backed implementation (spec §4.5,
//! component C5).
//!
//! MOC's drivers are `dlopen`'d against libao/ALSA/JACK/OSS; cpal already
//! gives a single cross-platform device abstraction, so there is one
//! concrete driver here instead of one per backend. Device enumeration
//! silences the stderr chatter cpal's host backends emit on some platforms
//! the same way the teacher's driver listing does.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use color_eyre::{Result, eyre::Context, eyre::eyre};

use crate::conversion::{AudioParams, SampleFormat};
use crate::output_buffer::OutputBuffer;

/// Mirrors `struct hw_funcs` in `audio.h` (spec §4.5): `init`/`shutdown` run
/// once per process, `open`/`close` bracket one playback session.
pub trait OutputDriver: Send {
    fn open(&mut self, params: AudioParams) -> Result<()>;
    fn close(&mut self);
    /// Pushes decoded audio into the driver, returning bytes accepted.
    fn play(&mut self, buf: &OutputBuffer) -> Result<()>;
    fn read_mixer(&self) -> i32;
    fn set_mixer(&mut self, value: i32);
    fn get_buff_fill(&self) -> usize;
    fn reset(&mut self);
    fn get_rate(&self) -> u32;
    fn toggle_mixer_channel(&mut self);
    fn get_mixer_channel_name(&self) -> &'static str;
    /// `CMD_TOGGLE_SOFTMIXER`: the soft mixer applies its own gain curve on
    /// top of whatever the hardware/OS mixer is doing; some setups want
    /// volume controlled purely by the hardware mixer instead (spec §4.5).
    fn toggle_softmixer(&mut self);
    fn is_softmixer_enabled(&self) -> bool;
}

/// Scores a `cpal` device's default config against the requested params,
/// the same device/config scoring approach used for picking an output
/// device by sample-rate/channel closeness before falling back to
/// resampling.
fn score_config(config: &cpal::SupportedStreamConfigRange, wanted: AudioParams) -> i64 {
    let rate_ok = (wanted.rate as u32) >= config.min_sample_rate().0
        && (wanted.rate as u32) <= config.max_sample_rate().0;
    let mut score = 0i64;
    if rate_ok {
        score += 1000;
    } else {
        let nearest = config
            .min_sample_rate()
            .0
            .max(config.max_sample_rate().0.min(wanted.rate));
        score -= (wanted.rate as i64 - nearest as i64).abs();
    }
    if config.channels() as u8 == wanted.channels {
        score += 100;
    }
    score
}

pub struct CpalDriver {
    device: cpal::Device,
    stream: Option<cpal::Stream>,
    shared_samples: Option<Arc<Mutex<Vec<f32>>>>,
    rate: Arc<AtomicU32>,
    mixer_volume: Arc<AtomicU32>,
    mixer_channel_is_master: bool,
    softmixer_enabled: Arc<AtomicBool>,
    buff_fill: Arc<AtomicU32>,
    /// Sample format the player is actually feeding `play()` with, set by
    /// the most recent `open()` call (spec §4.5: the driver must decode
    /// bytes in whatever format it was opened for, not a fixed one).
    sample_format: SampleFormat,
}

impl CpalDriver {
    /// Picks the preferred device by name (empty string means "default"),
    /// silencing host backend stderr output while enumerating, the same
    /// way the teacher's output-listing path does for ALSA/CoreAudio.
    pub fn open_named(preferred_name: &str) -> Result<Self> {
        let host = cpal::default_host();
        let device = {
            let _quiet = gag::Gag::stderr().ok();
            if preferred_name.is_empty() {
                host.default_output_device()
            } else {
                host.output_devices()
                    .wrap_err("Could not enumerate output devices")?
                    .find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false))
            }
        }
        .ok_or_else(|| eyre!("No output device named {preferred_name:?} found"))?;

        Ok(Self {
            device,
            stream: None,
            shared_samples: None,
            rate: Arc::new(AtomicU32::new(44100)),
            mixer_volume: Arc::new(AtomicU32::new(100)),
            mixer_channel_is_master: true,
            softmixer_enabled: Arc::new(AtomicBool::new(true)),
            buff_fill: Arc::new(AtomicU32::new(0)),
            sample_format: SampleFormat::S16,
        })
    }
}

impl OutputDriver for CpalDriver {
    fn open(&mut self, params: AudioParams) -> Result<()> {
        let supported = self
            .device
            .supported_output_configs()
            .wrap_err("Could not query device output configs")?;
        let best = supported
            .max_by_key(|c| score_config(c, params))
            .ok_or_else(|| eyre!("Device exposes no output configs"))?;

        let sample_rate = params.rate.clamp(best.min_sample_rate().0, best.max_sample_rate().0);
        let config = best.with_sample_rate(cpal::SampleRate(sample_rate)).config();
        self.rate.store(sample_rate, Ordering::SeqCst);
        self.sample_format = params.format;

        let shared_buf: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let fill_counter = Arc::clone(&self.buff_fill);
        let producer = Arc::clone(&shared_buf);

        let err_fn = |err| tracing::error!(%err, "cpal output stream error");
        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    let mut buf = producer.lock().unwrap();
                    let n = data.len().min(buf.len());
                    data[..n].copy_from_slice(&buf[..n]);
                    data[n..].fill(0.0);
                    buf.drain(..n);
                    fill_counter.store(buf.len() as u32, Ordering::SeqCst);
                },
                err_fn,
                None,
            )
            .wrap_err("Could not build cpal output stream")?;
        stream.play().wrap_err("Could not start cpal output stream")?;
        self.stream = Some(stream);
        self.shared_samples = Some(shared_buf);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn play(&mut self, buf: &OutputBuffer) -> Result<()> {
        let bytes = buf.get(8192, std::time::Duration::from_millis(200));
        if bytes.is_empty() {
            return Ok(());
        }
        let mut samples = crate::conversion::to_f32(&bytes, self.sample_format);
        // The soft mixer runs last, on audio already in the driver's
        // native format, per spec §4.3 (conversion happens upstream in
        // the player; volume scaling happens here where the hardware
        // mixer channel would otherwise live). Disabling it leaves volume
        // entirely to the hardware/OS mixer.
        if self.softmixer_enabled.load(Ordering::SeqCst) {
            crate::conversion::apply_softmix(&mut samples, self.read_mixer() as f64);
        }
        if let Some(shared) = &self.shared_samples {
            shared.lock().unwrap().extend(samples);
        }
        Ok(())
    }

    fn read_mixer(&self) -> i32 {
        self.mixer_volume.load(Ordering::SeqCst) as i32
    }

    fn set_mixer(&mut self, value: i32) {
        self.mixer_volume.store(value.clamp(0, 100) as u32, Ordering::SeqCst);
    }

    fn get_buff_fill(&self) -> usize {
        self.buff_fill.load(Ordering::SeqCst) as usize
    }

    fn reset(&mut self) {
        if let Some(shared) = &self.shared_samples {
            shared.lock().unwrap().clear();
        }
    }

    fn get_rate(&self) -> u32 {
        self.rate.load(Ordering::SeqCst)
    }

    fn toggle_mixer_channel(&mut self) {
        self.mixer_channel_is_master = !self.mixer_channel_is_master;
    }

    fn get_mixer_channel_name(&self) -> &'static str {
        if self.mixer_channel_is_master {
            "Master"
        } else {
            "PCM"
        }
    }

    fn toggle_softmixer(&mut self) {
        self.softmixer_enabled.fetch_xor(true, Ordering::SeqCst);
    }

    fn is_softmixer_enabled(&self) -> bool {
        self.softmixer_enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: u32, max: u32, channels: u16) -> cpal::SupportedStreamConfigRange {
        cpal::SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Range { min: 64, max: 4096 },
            cpal::SampleFormat::F32,
        )
    }

    #[test]
    fn scores_exact_rate_and_channel_match_highest() {
        let wanted = AudioParams {
            rate: 44100,
            channels: 2,
            format: SampleFormat::S16,
        };
        let exact = range(44100, 44100, 2);
        let mismatched = range(48000, 48000, 1);
        assert!(score_config(&exact, wanted) > score_config(&mismatched, wanted));
    }
}
