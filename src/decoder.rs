//! Decoder plugin interface and the symphonia-backed implementation (spec
//! §4.4, component C4).
//!
//! MOC loads decoders as `dlopen`'d plugins selected by extension/MIME
//! preference lists; this crate has a closed set of formats so the same
//! selection algorithm runs over a fixed registry of [`Decoder`]
//! implementations instead of dynamic libraries.

use std::sync::Arc;

use camino::Utf8Path;

use crate::conversion::AudioParams;
use crate::error::DecoderError;
use crate::io_stream::IoStream;

/// One decoded chunk, handed to the player's decode loop (spec §4.6).
pub struct DecodedChunk {
    pub data: Vec<u8>,
    pub params: AudioParams,
}

/// A currently-open decoder instance bound to one stream (spec §4.4's
/// `struct decoder` contract: `init`, `decode`, `seek`, `close` plus the
/// read-only `info`/`duration`/`tags` accessors).
pub trait DecoderInstance: Send {
    /// Decodes the next chunk. Returns `Ok(None)` at end of stream.
    /// Recoverable errors are reported via `last_error` and the loop
    /// continues; fatal ones also return `Ok(None)`.
    fn decode(&mut self) -> Result<Option<DecodedChunk>, DecoderError>;

    /// Seeks to `seconds`; returns the actual position landed on. Formats
    /// without sample-accurate seeking (e.g. some streamed MP3s) may only
    /// approximate this (spec §4.4 edge case).
    fn seek(&mut self, seconds: f64) -> Option<f64>;

    fn current_time(&self) -> f64;

    /// `None` for streams of unknown/unbounded length (e.g. live radio).
    fn duration(&self) -> Option<f64>;

    fn bitrate(&self) -> Option<u32>;

    fn last_error(&self) -> DecoderError {
        DecoderError::OK
    }
}

/// One entry in the decoder registry (spec §4.4): which extensions/MIME
/// types it claims, and a constructor.
pub struct DecoderPlugin {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub mime_types: &'static [&'static str],
    /// `true` for the wildcard "all other registered decoders" fallback
    /// entry, which only ever gets tried last (spec §4.4 selection rule).
    pub catch_all: bool,
    pub open: fn(Arc<IoStream>) -> Result<Box<dyn DecoderInstance>, DecoderError>,
}

/// Fixed registry of available decoders. A real plugin system would use
/// `inventory` or similar dynamic registration, but the small, closed
/// format set here is simpler as a plain static slice built once.
fn registry() -> &'static [DecoderPlugin] {
    use std::sync::OnceLock;
    static REGISTRY: OnceLock<Vec<DecoderPlugin>> = OnceLock::new();
    REGISTRY.get_or_init(|| vec![symphonia_decoder::PLUGIN])
}

/// Returns the registry in priority order, honoring `preferred_decoders`
/// (an ordered list of extensions/MIME types from config, spec §4.4): any
/// decoder named there is tried before the rest, in the order given, and
/// the catch-all entry always comes last.
pub fn ordered_plugins(preferred: &[String]) -> Vec<&'static DecoderPlugin> {
    let mut plugins: Vec<&DecoderPlugin> = registry().iter().collect();
    plugins.sort_by_key(|p| p.catch_all);
    if preferred.is_empty() {
        return plugins;
    }
    let mut ordered = Vec::with_capacity(plugins.len());
    for want in preferred {
        if let Some(pos) = plugins.iter().position(|p| p.name == want) {
            ordered.push(plugins.remove(pos));
        }
    }
    ordered.extend(plugins);
    ordered
}

/// Picks and opens the first decoder, in preference order, whose
/// extension/MIME claim matches `path`/`mime`, per spec §4.4.
pub fn select_and_open(
    path: &Utf8Path,
    mime: Option<&str>,
    preferred: &[String],
    stream: Arc<IoStream>,
) -> Result<(&'static str, Box<dyn DecoderInstance>), DecoderError> {
    let ext = path.extension().map(str::to_ascii_lowercase);
    let candidates: Vec<&DecoderPlugin> = ordered_plugins(preferred)
        .into_iter()
        .filter(|p| {
            p.catch_all
                || ext.as_deref().is_some_and(|e| p.extensions.contains(&e))
                || mime.is_some_and(|m| p.mime_types.iter().any(|claimed| m.starts_with(claimed)))
        })
        .collect();

    let mut last_err = DecoderError::fatal("No decoder claims this file");
    for plugin in candidates {
        match (plugin.open)(Arc::clone(&stream)) {
            Ok(instance) => return Ok((plugin.name, instance)),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Symphonia-backed decoder covering everything symphonia's `all` feature
/// set supports (FLAC, MP3, Vorbis, WAV, AAC, ALAC, ...). MOC's per-format
/// plugins collapse into a single symphonia probe+decode pipeline here.
mod symphonia_decoder {
    use std::io::{Read, Seek, SeekFrom};
    use std::sync::Arc;

    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::{MediaSource, MediaSourceStream};
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    use super::{DecodedChunk, DecoderInstance, DecoderPlugin};
    use crate::conversion::{AudioParams, SampleFormat};
    use crate::error::DecoderError;
    use crate::io_stream::IoStream;

    pub const PLUGIN: DecoderPlugin = DecoderPlugin {
        name: "symphonia",
        extensions: &["mp3", "flac", "ogg", "wav", "aac", "m4a", "alac"],
        mime_types: &["audio/"],
        catch_all: true,
        open: open,
    };

    /// Adapts our [`IoStream`] to symphonia's [`MediaSource`]. AAC and
    /// other streamed formats don't report exact sample counts up front,
    /// so `duration()` on those decoders is a bitrate-based approximation
    /// (spec §9 Open Question: AAC duration-approximation, `aac_seek`
    /// unsupported).
    struct IoStreamMediaSource(Arc<IoStream>);

    impl Read for IoStreamMediaSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let data = self.0.read(buf.len())?;
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }
    }

    impl Seek for IoStreamMediaSource {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            let (offset, whence) = match pos {
                SeekFrom::Start(p) => (p as i64, crate::io_stream::SeekWhence::Start),
                SeekFrom::Current(p) => (p, crate::io_stream::SeekWhence::Current),
                SeekFrom::End(p) => (p, crate::io_stream::SeekWhence::End),
            };
            self.0
                .seek(offset, whence)
                .ok_or_else(|| std::io::Error::other("stream not seekable"))
        }
    }

    impl MediaSource for IoStreamMediaSource {
        fn is_seekable(&self) -> bool {
            self.0.seekable()
        }

        fn byte_len(&self) -> Option<u64> {
            self.0.size()
        }
    }

    fn open(stream: Arc<IoStream>) -> Result<Box<dyn DecoderInstance>, DecoderError> {
        let seekable = stream.seekable();
        let source = Box::new(IoStreamMediaSource(stream));
        let mss = MediaSourceStream::new(source, Default::default());

        let mut hint = Hint::new();
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| DecoderError::fatal(format!("Could not probe format: {e}")))?;

        let mut format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecoderError::fatal("No decodable audio track found"))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecoderError::fatal(format!("Unsupported codec: {e}")))?;

        let duration = codec_params.n_frames.and_then(|frames| {
            codec_params
                .sample_rate
                .map(|rate| frames as f64 / rate as f64)
        });

        Ok(Box::new(SymphoniaInstance {
            format,
            decoder,
            track_id,
            sample_rate: codec_params.sample_rate.unwrap_or(44100),
            channels: codec_params.channels.map_or(2, |c| c.count() as u8),
            duration,
            seekable,
            current_time: 0.0,
            last_error: DecoderError::OK,
            last_bitrate: None,
        }))
    }

    struct SymphoniaInstance {
        format: Box<dyn symphonia::core::formats::FormatReader>,
        decoder: Box<dyn symphonia::core::codecs::Decoder>,
        track_id: u32,
        sample_rate: u32,
        channels: u8,
        duration: Option<f64>,
        seekable: bool,
        current_time: f64,
        last_error: DecoderError,
        /// Instantaneous bitrate of the most recently decoded packet, kbps
        /// (spec §3 bitrate timeline / §4.6 step 2): `data.len() * 8` bits
        /// over the packet's own duration, so it tracks variable-bitrate
        /// streams rather than reporting one fixed average.
        last_bitrate: Option<u32>,
    }

    impl DecoderInstance for SymphoniaInstance {
        fn decode(&mut self) -> Result<Option<DecodedChunk>, DecoderError> {
            loop {
                let packet = match self.format.next_packet() {
                    Ok(p) => p,
                    Err(symphonia::core::errors::Error::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(None);
                    }
                    Err(e) => return Err(DecoderError::fatal(format!("Demux error: {e}"))),
                };
                if packet.track_id() != self.track_id {
                    continue;
                }
                self.current_time = packet.ts() as f64 / self.sample_rate as f64;

                let packet_secs = packet.dur() as f64 / self.sample_rate as f64;
                if packet_secs > 0.0 {
                    let kbps = (packet.data.len() as f64 * 8.0 / packet_secs / 1000.0).round();
                    self.last_bitrate = Some(kbps as u32);
                }

                match self.decoder.decode(&packet) {
                    Ok(decoded) => {
                        let spec = *decoded.spec();
                        let mut sample_buf =
                            SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                        sample_buf.copy_interleaved_ref(decoded);
                        let data = crate::conversion::from_f32(sample_buf.samples(), SampleFormat::Float);
                        return Ok(Some(DecodedChunk {
                            data,
                            params: AudioParams {
                                rate: spec.rate,
                                channels: spec.channels.count() as u8,
                                format: SampleFormat::Float,
                            },
                        }));
                    }
                    Err(symphonia::core::errors::Error::DecodeError(msg)) => {
                        self.last_error = DecoderError::stream(msg);
                        continue;
                    }
                    Err(e) => return Err(DecoderError::fatal(format!("Decode error: {e}"))),
                }
            }
        }

        fn seek(&mut self, seconds: f64) -> Option<f64> {
            if !self.seekable {
                return None;
            }
            let ts = symphonia::core::units::Time::from(seconds);
            match self.format.seek(
                symphonia::core::formats::SeekMode::Accurate,
                symphonia::core::formats::SeekTo::Time {
                    time: ts,
                    track_id: Some(self.track_id),
                },
            ) {
                Ok(seeked) => {
                    self.current_time = seeked.actual_ts as f64 / self.sample_rate as f64;
                    Some(self.current_time)
                }
                Err(_) => None,
            }
        }

        fn current_time(&self) -> f64 {
            self.current_time
        }

        fn duration(&self) -> Option<f64> {
            self.duration
        }

        fn bitrate(&self) -> Option<u32> {
            self.last_bitrate
        }

        fn last_error(&self) -> DecoderError {
            self.last_error.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(name: &'static str, catch_all: bool) -> DecoderPlugin {
        DecoderPlugin {
            name,
            extensions: &[],
            mime_types: &[],
            catch_all,
            open: |_| Err(DecoderError::fatal("test stub")),
        }
    }

    #[test]
    fn catch_all_always_sorts_last() {
        let plugins = [plugin("wildcard", true), plugin("specific", false)];
        let mut refs: Vec<&DecoderPlugin> = plugins.iter().collect();
        refs.sort_by_key(|p| p.catch_all);
        assert_eq!(refs[0].name, "specific");
        assert_eq!(refs[1].name, "wildcard");
    }
}
