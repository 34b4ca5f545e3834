//! Lookahead decode of the next playlist item, to eliminate the gap
//! between tracks (spec §4.6 step 7, glossary "Precache").
//!
//! Modeled as the explicit `Idle | Running | Ready` slot spec §9's Design
//! Notes call for, owned by [`crate::controller::AudioController`] and
//! shared across successive `Player` instances: one precache thread runs
//! at a time, opens the next local file's decoder, decodes up to one
//! output buffer's worth into a private scratch buffer, and parks in
//! `Ready` until the controller's next `play()` call either inherits it
//! (if the requested path matches) or discards it.

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::conversion::AudioParams;
use crate::decoder::{self, DecoderInstance};
use crate::io_stream::IoStream;
use crate::player::BitrateTimeline;

/// A decoder opened and primed ahead of time, ready to be spliced into a
/// fresh decode loop without reopening the file or re-reading its first
/// buffer's worth of audio.
///
/// `scratch` holds the raw, not-yet-converted bytes the decoder itself
/// produced (always [`crate::conversion::SampleFormat::Float`], per
/// `decoder.rs`'s symphonia backend) together with the params they were
/// decoded at, since the inheriting `Player` still has to run them
/// through its own conversion/resample/equalizer pipeline exactly like
/// any other chunk — precache skips re-opening the file, not conversion.
pub struct Precached {
    pub path: Utf8PathBuf,
    pub decoder: Box<dyn DecoderInstance>,
    pub scratch: Vec<u8>,
    pub scratch_params: Option<AudioParams>,
    pub bitrate_timeline: BitrateTimeline,
}

pub enum PrecacheState {
    Idle,
    Running,
    Ready(Precached),
}

/// Single-slot, mutex-guarded precache handle. `take_if_matches` is the
/// only way out of `Ready`, so a mismatched precache (the user jumped
/// somewhere else before the lookahead finished) is simply dropped,
/// closing its decoder along with it.
pub struct PrecacheSlot {
    state: std::sync::Mutex<PrecacheState>,
}

impl PrecacheSlot {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(PrecacheState::Idle),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), PrecacheState::Idle)
    }

    /// Starts a precache thread for `path`, scratch-decoding up to
    /// `scratch_target_bytes` of audio (one output buffer's worth, spec
    /// §4.6 step 7). No-ops if a precache is already running or ready.
    pub fn start(self: &Arc<Self>, path: Utf8PathBuf, scratch_target_bytes: usize) {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, PrecacheState::Idle) {
                return;
            }
            *state = PrecacheState::Running;
        }
        let slot = Arc::clone(self);
        std::thread::spawn(move || {
            let result = precache_one(&path, scratch_target_bytes);
            let mut state = slot.state.lock().unwrap();
            *state = match result {
                Some(precached) => PrecacheState::Ready(precached),
                None => PrecacheState::Idle,
            };
        });
    }

    /// Takes the precached decoder if it matches `wanted_path`; otherwise
    /// returns `None` and drops whatever was there (a stale `Ready` for a
    /// path that's no longer about to play, or a still-`Running` lookahead
    /// that hasn't produced anything yet).
    pub fn take_if_matches(&self, wanted_path: &camino::Utf8Path) -> Option<Precached> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, PrecacheState::Idle) {
            PrecacheState::Ready(precached) if precached.path == wanted_path => Some(precached),
            _ => None,
        }
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = PrecacheState::Idle;
    }
}

fn precache_one(path: &camino::Utf8Path, scratch_target_bytes: usize) -> Option<Precached> {
    if path.as_str().starts_with("http://") || path.as_str().starts_with("https://") {
        // Precache only ever targets local SOUND files (spec §4.6 step 7);
        // network streams aren't candidates.
        return None;
    }
    let stream = Arc::new(IoStream::open_file(path, true).ok()?);
    let (_name, mut decoder) = decoder::select_and_open(path, None, &[], stream).ok()?;

    let mut scratch = Vec::new();
    let mut scratch_params = None;
    let mut bitrate_timeline = BitrateTimeline::new();
    while scratch.len() < scratch_target_bytes {
        match decoder.decode() {
            Ok(Some(chunk)) => {
                if let Some(bitrate) = decoder.bitrate() {
                    bitrate_timeline.push_if_changed(decoder.current_time(), bitrate);
                }
                // A track's decoded format doesn't change mid-stream, so
                // the first chunk's params describe every chunk in
                // `scratch`.
                scratch_params.get_or_insert(chunk.params);
                scratch.extend_from_slice(&chunk.data);
            }
            Ok(None) => break,
            Err(e) if e.is_fatal() => return None,
            Err(_) => continue,
        }
    }

    Some(Precached {
        path: path.to_owned(),
        decoder,
        scratch,
        scratch_params,
        bitrate_timeline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_slot_is_idle() {
        let slot = PrecacheSlot::new();
        assert!(slot.is_idle());
    }

    #[test]
    fn take_on_idle_returns_none() {
        let slot = PrecacheSlot::new();
        assert!(slot.take_if_matches(camino::Utf8Path::new("a.mp3")).is_none());
    }

    #[test]
    fn unsupported_url_path_is_not_precached() {
        assert!(precache_one(camino::Utf8Path::new("http://example/stream.mp3"), 4096).is_none());
    }
}
