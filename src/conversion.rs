//! Sample format/rate/channel conversion, the parametric equalizer and the
//! soft-volume mixer (spec §4.3, component C3).
//!
//! Conversion only happens when the decoded stream doesn't already match
//! what the output driver asked for (spec §4.3's threshold table); the
//! equalizer and soft mixer, when enabled, always run last so they see
//! audio already in the driver's native format.

use std::f64::consts::{E, PI};

use rubato::Resampler;

/// PCM sample format the decoder produced or the driver wants (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S8,
    S16,
    S32,
    Float,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::Float => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioParams {
    pub rate: u32,
    pub channels: u8,
    pub format: SampleFormat,
}

/// Whether `from -> to` needs any conversion stage at all (spec §4.3: "only
/// run a stage when the decoded and requested parameters actually differ").
pub fn needs_conversion(from: AudioParams, to: AudioParams) -> bool {
    from.rate != to.rate || from.channels != to.channels || from.format != to.format
}

/// Converts interleaved samples of `from.format` to `f32` in `[-1.0, 1.0]`,
/// the common currency for resampling/EQ/mixing.
pub fn to_f32(data: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::U8 => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        SampleFormat::S8 => data.iter().map(|&b| b as i8 as f32 / 128.0).collect(),
        SampleFormat::S16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect(),
        SampleFormat::S32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / i32::MAX as f32)
            .collect(),
        SampleFormat::Float => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

/// Inverse of [`to_f32`]: packs `f32` samples back into `format`, clipping
/// rather than wrapping on overflow.
pub fn from_f32(samples: &[f32], format: SampleFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * format.bytes_per_sample());
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        match format {
            SampleFormat::U8 => out.push(((clamped * 128.0) + 128.0) as u8),
            SampleFormat::S8 => out.push((clamped * 127.0) as i8 as u8),
            SampleFormat::S16 => out.extend_from_slice(&((clamped * i16::MAX as f32) as i16).to_le_bytes()),
            SampleFormat::S32 => out.extend_from_slice(&((clamped * i32::MAX as f32) as i32).to_le_bytes()),
            SampleFormat::Float => out.extend_from_slice(&clamped.to_le_bytes()),
        }
    }
    out
}

/// Interleaved mono/stereo channel up/downmix (spec §4.3).
pub fn convert_channels(samples: &[f32], from: u8, to: u8) -> Vec<f32> {
    if from == to {
        return samples.to_vec();
    }
    match (from, to) {
        (1, 2) => samples.iter().flat_map(|&s| [s, s]).collect(),
        (2, 1) => samples.chunks_exact(2).map(|c| (c[0] + c[1]) / 2.0).collect(),
        (from_n, to_n) => {
            // General case: round-robin duplicate/average across channel
            // sets, which is adequate for the rare >2-channel sources MOC
            // can encounter (e.g. surround FLAC) without claiming to be a
            // proper downmix matrix.
            let from_n = from_n as usize;
            let to_n = to_n as usize;
            let frames = samples.len() / from_n;
            let mut out = Vec::with_capacity(frames * to_n);
            for frame in samples.chunks_exact(from_n) {
                for ch in 0..to_n {
                    out.push(frame[ch % frame.len()]);
                }
            }
            out
        }
    }
}

/// Resamples interleaved `f32` audio from `from_rate` to `to_rate` using a
/// sinc-interpolated resampler (spec §4.3's rate-conversion stage).
pub fn resample(
    samples: &[f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
) -> color_eyre::Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let params = rubato::SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: rubato::WindowFunction::BlackmanHarris2,
    };
    let frames = samples.len() / channels;
    let mut deinterleaved: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            deinterleaved[ch].push(s);
        }
    }

    let mut resampler = rubato::SincFixedIn::<f32>::new(ratio, 2.0, params, frames, channels)?;
    let output = resampler.process(&deinterleaved, None)?;

    let out_frames = output.first().map_or(0, Vec::len);
    let mut interleaved = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        for ch_data in &output {
            interleaved.push(ch_data[i]);
        }
    }
    Ok(interleaved)
}

pub fn swap_endian_16(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(2) {
        chunk.swap(0, 1);
    }
}

pub fn swap_endian_32(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.swap(0, 3);
        chunk.swap(1, 2);
    }
}

/// One peaking-EQ cookbook biquad per band (spec §4.3's equalizer, grounded
/// on the RBJ Audio EQ Cookbook formula used by the original `equalizer.c`).
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

#[derive(Debug, Clone, Copy)]
struct BiquadCoeffs {
    a0: f64,
    a1: f64,
    a2: f64,
    b0: f64,
    b1: f64,
    b2: f64,
}

impl BiquadCoeffs {
    /// `center_freq`/`bandwidth` in Hz, `db_gain` in decibels, computed for
    /// the given sample rate per the RBJ peaking-EQ formula.
    fn peaking(sample_rate: f64, center_freq: f64, bandwidth: f64, db_gain: f64) -> Self {
        let a = 10f64.powf(db_gain / 40.0);
        let w0 = 2.0 * PI * center_freq / sample_rate;
        let alpha = (w0.sin()) * ((2f64.ln() / 2.0 * bandwidth * w0 / w0.sin()).sinh());
        let (cos_w0, sin_alpha_a, sin_alpha_over_a) = (w0.cos(), alpha * a, alpha / a);

        let b0 = 1.0 + sin_alpha_a;
        let b1 = -2.0 * cos_w0;
        let b2 = 1.0 - sin_alpha_a;
        let a0 = 1.0 + sin_alpha_over_a;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - sin_alpha_over_a;

        Self {
            a0: b0 / a0,
            a1: b1 / a0,
            a2: b2 / a0,
            b0: a1 / a0,
            b1: a2 / a0,
            b2: 0.0,
        }
    }
}

/// One equalizer band: center frequency (Hz), bandwidth (octaves), gain
/// (dB). A `center_freq` of `0.0` is the preamp band (spec §7 EQSET format).
#[derive(Debug, Clone, Copy)]
pub struct EqBand {
    pub center_freq: f64,
    pub bandwidth: f64,
    pub gain_db: f64,
}

pub struct Equalizer {
    sample_rate: u32,
    channels: usize,
    preamp_db: f64,
    /// Dry/wet mix factor (spec §4.3 "Mixin"): `1.0` is fully dry (filter
    /// bypassed), `0.0` is fully wet (fully filtered).
    mixin: f64,
    bands: Vec<(BiquadCoeffs, Vec<BiquadState>)>,
}

impl Equalizer {
    pub fn new(sample_rate: u32, channels: usize, mixin: f64, bands: &[EqBand]) -> Self {
        let mut preamp_db = 0.0;
        let mut coeffs = Vec::new();
        for band in bands {
            if band.center_freq == 0.0 {
                preamp_db = band.gain_db;
                continue;
            }
            let c = BiquadCoeffs::peaking(
                sample_rate as f64,
                band.center_freq,
                band.bandwidth,
                band.gain_db,
            );
            coeffs.push((c, vec![BiquadState::default(); channels]));
        }
        Self {
            sample_rate,
            channels,
            preamp_db,
            mixin: mixin.clamp(0.0, 1.0),
            bands: coeffs,
        }
    }

    /// Recreated whenever the stream's rate/channel count changes
    /// mid-playback (spec §4.3 "the equalizer resets its biquad state on a
    /// parameter change" edge case), since biquad coefficients are
    /// rate-dependent.
    pub fn matches(&self, sample_rate: u32, channels: usize) -> bool {
        self.sample_rate == sample_rate && self.channels == channels
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        let dry = samples.to_vec();
        let preamp = 10f64.powf(self.preamp_db / 20.0) as f32;
        for s in samples.iter_mut() {
            *s *= preamp;
        }
        for (coeffs, states) in &mut self.bands {
            for frame in samples.chunks_exact_mut(self.channels) {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let state = &mut states[ch];
                    let x0 = *sample as f64;
                    let y0 = coeffs.a0 * x0 + coeffs.a1 * state.x1 + coeffs.a2 * state.x2
                        - coeffs.b0 * state.y1
                        - coeffs.b1 * state.y2;
                    state.x2 = state.x1;
                    state.x1 = x0;
                    state.y2 = state.y1;
                    state.y1 = y0;
                    *sample = y0 as f32;
                }
            }
        }
        if self.mixin > 0.0 {
            let mixin = self.mixin as f32;
            for (sample, &raw) in samples.iter_mut().zip(dry.iter()) {
                *sample = mixin * raw + (1.0 - mixin) * *sample;
            }
        }
    }
}

/// Shared equalizer configuration (spec §4.3), polled by the decode loop
/// once per chunk so toggling it or switching presets takes effect
/// without restarting playback. `version` bumps on every edit so the
/// player knows to rebuild its [`Equalizer`] even when sample rate and
/// channel count haven't changed.
#[derive(Debug, Clone, Default)]
pub struct EqConfig {
    pub enabled: bool,
    pub mixin: f64,
    pub bands: Vec<EqBand>,
    pub version: u64,
}

/// Perceptual volume curve used by the soft mixer, matching the original
/// `(exp(vol/100)-1)/(e-1)` gain shaping in `jack.c` rather than a linear
/// scale, so the middle of the slider doesn't sound silent.
pub fn softmix_gain(volume_percent: f64) -> f64 {
    let vol = volume_percent.clamp(0.0, 100.0) / 100.0;
    (vol.exp() - 1.0) / (E - 1.0)
}

pub fn apply_softmix(samples: &mut [f32], volume_percent: f64) {
    let gain = softmix_gain(volume_percent) as f32;
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmix_gain_endpoints() {
        assert!((softmix_gain(0.0)).abs() < 1e-9);
        assert!((softmix_gain(100.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn softmix_gain_is_monotonic() {
        let mut prev = -1.0;
        for vol in (0..=100).step_by(10) {
            let g = softmix_gain(vol as f64);
            assert!(g > prev);
            prev = g;
        }
    }

    #[test]
    fn u8_roundtrip_is_close() {
        let data = vec![0u8, 64, 128, 192, 255];
        let samples = to_f32(&data, SampleFormat::U8);
        let back = from_f32(&samples, SampleFormat::U8);
        for (a, b) in data.iter().zip(back.iter()) {
            assert!((*a as i16 - *b as i16).abs() <= 1);
        }
    }

    #[test]
    fn s16_roundtrip_is_close() {
        let original: i16 = 12345;
        let data = original.to_le_bytes().to_vec();
        let samples = to_f32(&data, SampleFormat::S16);
        let back = from_f32(&samples, SampleFormat::S16);
        let got = i16::from_le_bytes([back[0], back[1]]);
        assert!((got - original).abs() <= 1);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let mono = vec![0.5, -0.5];
        let stereo = convert_channels(&mono, 1, 2);
        assert_eq!(stereo, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let stereo = vec![1.0, 0.0, -1.0, 1.0];
        let mono = convert_channels(&stereo, 2, 1);
        assert_eq!(mono, vec![0.5, 0.0]);
    }

    #[test]
    fn equalizer_preamp_only_is_near_identity_at_unity_gain() {
        let bands = [EqBand {
            center_freq: 0.0,
            bandwidth: 0.0,
            gain_db: 0.0,
        }];
        let mut eq = Equalizer::new(44100, 1, 0.0, &bands);
        let mut samples = vec![0.1, -0.2, 0.3];
        let original = samples.clone();
        eq.process(&mut samples);
        for (a, b) in samples.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn equalizer_fully_dry_mixin_is_identity() {
        let bands = [EqBand {
            center_freq: 1000.0,
            bandwidth: 1.0,
            gain_db: 12.0,
        }];
        let mut eq = Equalizer::new(44100, 1, 1.0, &bands);
        let mut samples = vec![0.1, -0.2, 0.3, 0.05];
        let original = samples.clone();
        eq.process(&mut samples);
        for (a, b) in samples.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn needs_conversion_detects_rate_mismatch() {
        let a = AudioParams {
            rate: 44100,
            channels: 2,
            format: SampleFormat::S16,
        };
        let b = AudioParams { rate: 48000, ..a };
        assert!(needs_conversion(a, b));
        assert!(!needs_conversion(a, a));
    }
}
