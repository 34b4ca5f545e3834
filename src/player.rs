//! Decode loop: pulls packets from a [`DecoderInstance`], runs them through
//! conversion/equalizer/soft-mixer, and feeds the output driver's ring
//! buffer (spec §4.6, component C6).
//!
//! Runs on its own OS thread, not a tokio task: decoding blocks on I/O and
//! the ring buffer's `Condvar`, which is exactly the coroutine-like
//! dedicated-thread model spec §9's Design Notes call for ("no async
//! runtime is needed" for this half of the server).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use camino::Utf8Path;

use crate::conversion::{self, AudioParams, EqConfig, Equalizer, SampleFormat};
use crate::decoder::{self, DecoderInstance};
use crate::error::DecoderError;
use crate::io_stream::IoStream;
use crate::output_buffer::OutputBuffer;
use crate::precache::{PrecacheSlot, Precached};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerRequest {
    None,
    Stop,
    Seek(i64),
    Pause,
    Unpause,
}

/// Shared, lock-light state the controller polls/pokes while the decode
/// loop runs (spec §4.6): current time, bitrate, and whether playback has
/// hit a fatal error, all behind atomics rather than a mutex so status
/// queries never block on the decode thread.
pub struct PlayerStatus {
    pub current_time_millis: AtomicU64,
    pub bitrate: AtomicU64,
    pub finished: AtomicBool,
    pub failed: AtomicBool,
    request: Mutex<PlayerRequest>,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            current_time_millis: AtomicU64::new(0),
            bitrate: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            request: Mutex::new(PlayerRequest::None),
        }
    }
}

impl PlayerStatus {
    pub fn current_time(&self) -> f64 {
        self.current_time_millis.load(Ordering::SeqCst) as f64 / 1000.0
    }

    pub fn request(&self, req: PlayerRequest) {
        *self.request.lock().unwrap() = req;
    }

    fn take_request(&self) -> PlayerRequest {
        std::mem::replace(&mut *self.request.lock().unwrap(), PlayerRequest::None)
    }
}

/// MD5 digest of the decoded audio, used to detect a bit-identical replay
/// (spec §4.6's "digest invalidated on seek/stop/error/param change"
/// edge case: it's only meaningful across a single uninterrupted play
/// from start to finish).
#[derive(Default)]
pub struct AudioDigest {
    context: Option<md5::Context>,
}

impl AudioDigest {
    pub fn feed(&mut self, data: &[u8]) {
        self.context.get_or_insert_with(md5::Context::new).consume(data);
    }

    pub fn invalidate(&mut self) {
        self.context = None;
    }

    pub fn finalize(&mut self) -> Option<[u8; 16]> {
        self.context.take().map(|ctx| ctx.compute().0)
    }
}

/// Ordered `(decode_time_seconds, bitrate_kbps)` FIFO (spec §3 "Bitrate
/// timeline"): appended whenever the decoder's instantaneous bitrate
/// changes, queried by wall-clock play position rather than decode
/// position so the reported bitrate matches what's audible right now, not
/// what the decoder happens to be chewing on several seconds ahead.
#[derive(Default)]
pub struct BitrateTimeline {
    nodes: VecDeque<(f64, u32)>,
}

impl BitrateTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_if_changed(&mut self, decode_time: f64, kbps: u32) {
        if self.nodes.back().map(|&(_, last)| last) != Some(kbps) {
            self.nodes.push_back((decode_time, kbps));
        }
    }

    /// The bitrate in effect at `play_time`, discarding any nodes that
    /// have fallen behind the playback position (spec §3: "nodes older
    /// than the current play position are discarded").
    pub fn bitrate_at(&mut self, play_time: f64) -> Option<u32> {
        while self.nodes.len() > 1 && self.nodes[1].0 <= play_time {
            self.nodes.pop_front();
        }
        self.nodes.front().map(|&(_, kbps)| kbps)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct Player {
    pub status: Arc<PlayerStatus>,
    output_buffer: Arc<OutputBuffer>,
    target_params: AudioParams,
    preferred_decoders: Vec<String>,
    allow_24bit_output: bool,
    /// Shared equalizer configuration, polled once per decode iteration so
    /// `CMD_TOGGLE_EQUALIZER`/band changes take effect without restarting
    /// playback (spec §4.3).
    eq_config: Arc<Mutex<EqConfig>>,
    precache: Arc<PrecacheSlot>,
    /// Filename of the item that will play next, so the decode loop knows
    /// what to precache on approach to EOF (spec §4.6 step 7); `None` when
    /// there's nothing to look ahead to (last item, no successor yet).
    next_path: Mutex<Option<camino::Utf8PathBuf>>,
    auto_next: bool,
    precache_enabled: bool,
}

impl Player {
    pub fn new(
        output_buffer: Arc<OutputBuffer>,
        target_params: AudioParams,
        preferred_decoders: Vec<String>,
        allow_24bit_output: bool,
        eq_config: Arc<Mutex<EqConfig>>,
        precache: Arc<PrecacheSlot>,
        auto_next: bool,
        precache_enabled: bool,
    ) -> Self {
        Self {
            status: Arc::new(PlayerStatus::default()),
            output_buffer,
            target_params,
            preferred_decoders,
            allow_24bit_output,
            eq_config,
            precache,
            next_path: Mutex::new(None),
            auto_next,
            precache_enabled,
        }
    }

    /// Sets which local file, if any, should be precached once this play
    /// reaches the tail of its stream (spec §4.6 step 7). The controller
    /// calls this right after spawning the player, once it knows (or can
    /// peek) the successor.
    pub fn set_next_path(&self, path: Option<camino::Utf8PathBuf>) {
        *self.next_path.lock().unwrap() = path;
    }

    /// Runs the full decode loop for one file to completion (or until
    /// stopped). Intended to be spawned on a dedicated `std::thread`; the
    /// controller talks to it only through `status`/`output_buffer`.
    ///
    /// If `inherited` is `Some`, this resumes from a precached decoder
    /// instead of opening `path` fresh (spec §4.6 step 7: "inherit its
    /// decoder state, scratch buffer, and bitrate timeline atomically").
    pub fn play_file(&self, path: &Utf8Path, mime: Option<&str>) -> Result<(), DecoderError> {
        self.play_file_inner(path, mime, None)
    }

    pub fn play_file_with_precache(
        &self,
        path: &Utf8Path,
        mime: Option<&str>,
        inherited: Precached,
    ) -> Result<(), DecoderError> {
        self.play_file_inner(path, mime, Some(inherited))
    }

    fn play_file_inner(
        &self,
        path: &Utf8Path,
        mime: Option<&str>,
        inherited: Option<Precached>,
    ) -> Result<(), DecoderError> {
        self.status.finished.store(false, Ordering::SeqCst);
        self.status.failed.store(false, Ordering::SeqCst);
        self.status.current_time_millis.store(0, Ordering::SeqCst);

        let output_format = if self.allow_24bit_output {
            SampleFormat::S32
        } else {
            SampleFormat::S16
        };
        self.output_buffer.set_bytes_per_second(
            self.target_params.rate as usize
                * self.target_params.channels as usize
                * output_format.bytes_per_sample(),
        );
        self.output_buffer.time_set(0.0);

        let mut equalizer: Option<Equalizer> = None;
        let mut eq_version = 0u64;
        let mut digest = AudioDigest::default();
        let mut bitrate_timeline = BitrateTimeline::new();
        let mut precache_started = false;

        let (mut instance, pending_scratch, pending_scratch_params) = if let Some(precached) = inherited {
            bitrate_timeline = precached.bitrate_timeline;
            (precached.decoder, precached.scratch, precached.scratch_params)
        } else {
            let stream = if let Some(rest) = path
                .as_str()
                .strip_prefix("http://")
                .or_else(|| path.as_str().strip_prefix("https://"))
            {
                let _ = rest;
                Arc::new(
                    IoStream::open_url(path.as_str())
                        .map_err(|e| DecoderError::fatal(e.to_string()))?,
                )
            } else {
                Arc::new(
                    IoStream::open_file(path, true).map_err(|e| DecoderError::fatal(e.to_string()))?,
                )
            };

            let (_name, instance) = decoder::select_and_open(
                path,
                mime,
                &self.preferred_decoders,
                Arc::clone(&stream),
            )?;
            (instance, Vec::new(), None)
        };

        // Run the precached scratch through the exact same
        // conversion/equalizer pipeline as every other decoded chunk
        // (spec §4.6 step 7: precache skips reopening the file, not the
        // rest of the pipeline) before falling into the regular loop.
        if let (false, Some(params)) = (pending_scratch.is_empty(), pending_scratch_params) {
            if !self.convert_and_emit(
                &pending_scratch,
                params,
                &mut equalizer,
                &mut eq_version,
                &mut digest,
                output_format,
            )? {
                self.status.finished.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        loop {
            match self.status.take_request() {
                PlayerRequest::Stop => {
                    self.output_buffer.stop();
                    digest.invalidate();
                    break;
                }
                PlayerRequest::Seek(offset) => {
                    // `req_seek` is relative to current position; clamp
                    // the result, not the raw request, to zero (spec §9
                    // Open Question on where this clamp belongs).
                    let current = instance.current_time();
                    let target = (current + offset as f64).max(0.0);
                    if let Some(actual) = instance.seek(target) {
                        self.output_buffer.reset();
                        self.output_buffer.time_set(actual);
                        digest.invalidate();
                        bitrate_timeline.clear();
                    }
                }
                PlayerRequest::Pause => self.output_buffer.pause(),
                PlayerRequest::Unpause => self.output_buffer.unpause(),
                PlayerRequest::None => {}
            }

            let chunk = match instance.decode() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    self.status.failed.store(true, Ordering::SeqCst);
                    digest.invalidate();
                    return Err(e);
                }
                Err(_) => {
                    // Recoverable stream error: skip this iteration, same
                    // as the original player loop ignoring a single bad
                    // frame (spec §4.6 edge case).
                    digest.invalidate();
                    continue;
                }
            };

            let decode_time = instance.current_time();
            self.status
                .current_time_millis
                .store((decode_time * 1000.0) as u64, Ordering::SeqCst);
            if let Some(bitrate) = instance.bitrate() {
                bitrate_timeline.push_if_changed(decode_time, bitrate);
            }
            if let Some(bitrate) = bitrate_timeline.bitrate_at(self.output_buffer.time_get()) {
                self.status.bitrate.store(bitrate as u64, Ordering::SeqCst);
            }

            // Approaching EOF: start precaching the next item once we're
            // within one output buffer's worth of the end of a known
            // duration (spec §4.6 step 7). Only fires once per play.
            if !precache_started && self.auto_next && self.precache_enabled {
                if let (Some(duration), Some(next)) =
                    (instance.duration(), self.next_path.lock().unwrap().clone())
                {
                    let remaining = duration - decode_time;
                    let lookahead_secs = self.output_buffer.capacity_bytes() as f64
                        / (self.target_params.rate as f64
                            * self.target_params.channels as f64
                            * output_format.bytes_per_sample() as f64)
                            .max(1.0);
                    if remaining <= lookahead_secs {
                        precache_started = true;
                        self.precache.start(next, self.output_buffer.capacity_bytes());
                    }
                }
            }

            if !self.convert_and_emit(
                &chunk.data,
                chunk.params,
                &mut equalizer,
                &mut eq_version,
                &mut digest,
                output_format,
            )? {
                break;
            }
        }

        self.status.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Runs one chunk of decoded audio through channel/rate conversion,
    /// the equalizer (rebuilt from the shared [`EqConfig`] when its
    /// version or the target params change), and emits it to the output
    /// buffer in the driver's sample format. Shared between the main
    /// decode loop and the one-shot flush of an inherited precache's
    /// scratch buffer so both take identical audio through identical
    /// processing. Returns `false` if the output buffer was stopped.
    fn convert_and_emit(
        &self,
        data: &[u8],
        params: AudioParams,
        equalizer: &mut Option<Equalizer>,
        eq_version: &mut u64,
        digest: &mut AudioDigest,
        output_format: SampleFormat,
    ) -> Result<bool, DecoderError> {
        let mut samples = conversion::to_f32(data, params.format);

        if conversion::needs_conversion(params, self.target_params) {
            if params.channels != self.target_params.channels {
                samples = conversion::convert_channels(&samples, params.channels, self.target_params.channels);
            }
            if params.rate != self.target_params.rate {
                samples = conversion::resample(
                    &samples,
                    self.target_params.channels as usize,
                    params.rate,
                    self.target_params.rate,
                )
                .map_err(|e| DecoderError::fatal(e.to_string()))?;
            }
        }

        {
            let config = self.eq_config.lock().unwrap().clone();
            if !config.enabled {
                *equalizer = None;
            } else {
                let needs_rebuild = *eq_version != config.version
                    || match equalizer {
                        Some(eq) => !eq.matches(self.target_params.rate, self.target_params.channels as usize),
                        None => true,
                    };
                if needs_rebuild {
                    *eq_version = config.version;
                    *equalizer = Some(Equalizer::new(
                        self.target_params.rate,
                        self.target_params.channels as usize,
                        config.mixin,
                        &config.bands,
                    ));
                }
            }
        }
        if let Some(eq) = equalizer {
            eq.process(&mut samples);
        }

        let out_bytes = conversion::from_f32(&samples, output_format);
        digest.feed(&out_bytes);
        Ok(self.output_buffer.put(&out_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_across_identical_feeds() {
        let mut a = AudioDigest::default();
        let mut b = AudioDigest::default();
        a.feed(b"hello world");
        b.feed(b"hello world");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn digest_invalidate_resets_state() {
        let mut digest = AudioDigest::default();
        digest.feed(b"some audio");
        digest.invalidate();
        assert!(digest.finalize().is_none());
    }

    #[test]
    fn status_current_time_reads_millis_as_seconds() {
        let status = PlayerStatus::default();
        status.current_time_millis.store(2500, Ordering::SeqCst);
        assert!((status.current_time() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn bitrate_timeline_dedups_repeated_values() {
        let mut timeline = BitrateTimeline::new();
        timeline.push_if_changed(0.0, 128);
        timeline.push_if_changed(1.0, 128);
        timeline.push_if_changed(2.0, 128);
        assert_eq!(timeline.bitrate_at(5.0), Some(128));
        // Only one node was ever stored, so the first two pushes were no-ops.
        timeline.push_if_changed(3.0, 192);
        assert_eq!(timeline.bitrate_at(2.5), Some(128));
        assert_eq!(timeline.bitrate_at(3.0), Some(192));
    }

    #[test]
    fn bitrate_timeline_discards_stale_nodes_as_play_time_advances() {
        let mut timeline = BitrateTimeline::new();
        timeline.push_if_changed(0.0, 128);
        timeline.push_if_changed(10.0, 256);
        timeline.push_if_changed(20.0, 320);
        assert_eq!(timeline.bitrate_at(5.0), Some(128));
        assert_eq!(timeline.bitrate_at(15.0), Some(256));
        assert_eq!(timeline.bitrate_at(25.0), Some(320));
    }

    #[test]
    fn bitrate_timeline_empty_reports_none() {
        let mut timeline = BitrateTimeline::new();
        assert!(timeline.is_empty());
        assert_eq!(timeline.bitrate_at(0.0), None);
    }
}
