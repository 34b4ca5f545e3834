//! Audio controller: owns the playlist/queue and drives the player through
//! play/pause/seek/next transitions (spec §4.7, component C7).
//!
//! This is the one piece of server state every client command eventually
//! touches, so it's a single `Mutex<ControllerState>` guarding the
//! playlist/queue/player-handle, with playback itself happening on the
//! decode thread spawned per `play()` call.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;

use crate::config::Options;
use crate::conversion::{AudioParams, EqConfig};
use crate::eqset::EqPreset;
use crate::events::{Event, EventBus, PlayerState};
use crate::output::OutputDriver;
use crate::output_buffer::OutputBuffer;
use crate::player::{Player, PlayerRequest, PlayerStatus};
use crate::playlist::Playlist;
use crate::precache::PrecacheSlot;

/// Mirrors the controller's state machine (spec §4.7's table): `Stop` and
/// `Pause` both mean no audio thread is actively filling the buffer, but
/// `Pause` remembers where to resume. A URL stream that gets paused is
/// treated as stopped instead (spec §4.7 edge case: network streams can't
/// be meaningfully paused since the server side keeps fetching).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stop,
    Play,
    Pause,
}

struct ControllerState {
    /// The user-visible playlist (spec §4.7's `playlist`).
    playlist: Playlist,
    /// Serial order of `playlist`, re-derived whenever shuffle is toggled
    /// or the playlist is reshuffled; not itself the "queue" (spec §4.7
    /// keeps three distinct lists: `playlist`, `shuffled_plist`, `queue`).
    play_order: Vec<u64>,
    /// The fast-forward queue: items requested out of band that play
    /// before the playlist resumes (spec §4.7, §2 C7, scenario S2).
    queue: Vec<u64>,
    current: Option<u64>,
    /// Set when the currently playing item came from `queue` and wasn't
    /// already set; restored into `current` once the queue drains and
    /// `QueueNextSongReturn` is on (spec §4.7 `go_to_another_file`).
    before_queue: Option<u64>,
    playback_state: PlaybackState,
    shuffle: bool,
    repeat: bool,
    player_handle: Option<std::thread::JoinHandle<()>>,
    player_status: Option<Arc<PlayerStatus>>,
    /// Index into the sorted `eqsets/` directory listing, for
    /// `CMD_EQUALIZER_{PREV,NEXT}` cycling (spec §4.9/§6).
    eq_preset_index: Option<usize>,
}

pub struct AudioController {
    state: Mutex<ControllerState>,
    output_buffer: Arc<OutputBuffer>,
    events: Arc<EventBus>,
    options: Options,
    /// Shared equalizer configuration, polled by whichever `Player` is
    /// currently decoding (spec §4.3); surviving across tracks so an
    /// enabled EQ/preset doesn't need re-enabling on every `play()`.
    eq_config: Arc<Mutex<EqConfig>>,
    precache: Arc<PrecacheSlot>,
    /// The output driver, shared so mixer/device commands can reach it
    /// without going through the player (spec §4.5); `None` in tests that
    /// don't stand up a real device.
    driver: Option<Arc<Mutex<Box<dyn OutputDriver>>>>,
}

impl AudioController {
    pub fn new(options: Options, output_buffer: Arc<OutputBuffer>, events: Arc<EventBus>) -> Self {
        Self::with_driver(options, output_buffer, events, None)
    }

    pub fn with_driver(
        options: Options,
        output_buffer: Arc<OutputBuffer>,
        events: Arc<EventBus>,
        driver: Option<Arc<Mutex<Box<dyn OutputDriver>>>>,
    ) -> Self {
        let shuffle = options.shuffle;
        let repeat = options.repeat;
        Self {
            state: Mutex::new(ControllerState {
                playlist: Playlist::new(),
                play_order: Vec::new(),
                queue: Vec::new(),
                current: None,
                before_queue: None,
                playback_state: PlaybackState::Stop,
                shuffle,
                repeat,
                player_handle: None,
                player_status: None,
                eq_preset_index: None,
            }),
            output_buffer,
            events,
            options,
            eq_config: Arc::new(Mutex::new(EqConfig::default())),
            precache: Arc::new(PrecacheSlot::new()),
            driver,
        }
    }

    pub fn set_playlist(&self, playlist: Playlist) {
        let mut state = self.state.lock().unwrap();
        state.play_order = playlist.order(state.shuffle);
        state.playlist = playlist;
        self.events.publish(Event::PlistClear);
    }

    /// Adds a single item to the live playlist (spec §4.7 `CMD_PLIST_ADD`).
    pub fn add(&self, path: Utf8PathBuf) -> u64 {
        let mut state = self.state.lock().unwrap();
        let serial = state.playlist.add(path.clone(), Default::default());
        state.play_order.push(serial);
        self.events.publish(Event::PlistAdd { serial, path });
        serial
    }

    /// Appends an item to the fast-forward queue (spec §4.7, `CMD_QUEUE_ADD`).
    /// The queue is drained ahead of the playlist's own successor on every
    /// end-of-track/`Next` as long as it's non-empty (scenario S2).
    pub fn queue_add(&self, path: Utf8PathBuf) -> u64 {
        let mut state = self.state.lock().unwrap();
        let serial = state.playlist.add(path.clone(), Default::default());
        state.queue.push(serial);
        self.events.publish(Event::PlistAdd { serial, path });
        serial
    }

    pub fn queue_clear(&self) {
        self.state.lock().unwrap().queue.clear();
    }

    /// `CMD_PLIST_DEL`: tombstones the item rather than physically
    /// removing it (spec §3). Returns `false` if `serial` was unknown or
    /// already deleted.
    pub fn delete(&self, serial: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let removed = state.playlist.delete(serial);
        if removed {
            state.play_order.retain(|s| *s != serial);
            state.queue.retain(|s| *s != serial);
            self.events.publish(Event::PlistDel { serial });
        }
        removed
    }

    /// `shuffle` toggling reshuffles immediately, keeping the currently
    /// playing item at the front so it isn't interrupted (spec §4.7 edge
    /// case, same rule `Playlist::reshuffle`'s `swap_first_fname` exists
    /// for).
    pub fn set_shuffle(&self, shuffle: bool) {
        let mut state = self.state.lock().unwrap();
        state.shuffle = shuffle;
        let current_path = state
            .current
            .and_then(|serial| state.playlist.get(serial))
            .map(|item| item.path.clone());
        if shuffle {
            state.playlist.reshuffle(current_path.as_deref());
        }
        state.play_order = state.playlist.order(shuffle);
        self.events.publish(Event::OptionsChanged);
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.state.lock().unwrap().repeat = repeat;
        self.events.publish(Event::OptionsChanged);
    }

    fn target_params(&self) -> AudioParams {
        AudioParams {
            rate: if self.options.force_sample_rate != 0 {
                self.options.force_sample_rate
            } else {
                44100
            },
            channels: 2,
            format: crate::conversion::SampleFormat::S16,
        }
    }

    /// Starts (or restarts) playback of `serial`, spawning a fresh decode
    /// thread (spec §4.7 `play()`). Any previously running player is
    /// stopped first.
    pub fn play(self: &Arc<Self>, serial: u64) {
        let path = {
            let state = self.state.lock().unwrap();
            state.playlist.get(serial).map(|item| item.path.clone())
        };
        let Some(path) = path else { return };

        self.stop_locked();

        let mut state = self.state.lock().unwrap();
        state.current = Some(serial);
        state.playback_state = PlaybackState::Play;
        self.output_buffer.reset();

        // If the last track's precache thread finished and produced a
        // decoder for exactly this file, inherit it instead of reopening
        // from scratch (spec §4.6 step 7).
        let precached = self.precache.take_if_matches(&path);
        let next_hint = self.peek_next_path(&state);

        let player = Arc::new(Player::new(
            Arc::clone(&self.output_buffer),
            self.target_params(),
            self.options.preferred_decoders.clone(),
            self.options.allow_24bit_output,
            Arc::clone(&self.eq_config),
            Arc::clone(&self.precache),
            self.options.auto_next,
            self.options.precache,
        ));
        player.set_next_path(next_hint);
        state.player_status = Some(Arc::clone(&player.status));
        let events = Arc::clone(&self.events);
        let controller = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            events.publish(Event::AudioStart);
            events.publish(Event::StateChanged(PlayerState::Play));
            let result = match precached {
                Some(inherited) => player.play_file_with_precache(&path, None, inherited),
                None => player.play_file(&path, None),
            };
            let _ = result;
            events.publish(Event::AudioStop);
            if player.status.failed.load(Ordering::SeqCst) {
                events.publish(Event::StatusMsg("Playback failed".into()));
            }
            if player.status.finished.load(Ordering::SeqCst) {
                // `advance_after_finish` calls `play()`, which calls
                // `stop_locked()` to join whatever `player_handle` is
                // currently stored — and that's *this very thread*, still
                // running at this point. Joining it from inside itself
                // would deadlock, so the advance runs on a separate,
                // freshly spawned thread instead; this thread then returns
                // and becomes joinable normally.
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || controller.advance_after_finish());
            }
        });
        state.player_handle = Some(handle);
    }

    /// Best-effort preview of what `go_to_another_file` would pick next,
    /// without mutating `queue`/`before_queue` (spec §4.6 step 7: the
    /// player needs to know the next filename well before end-of-track to
    /// start precaching it). Purely advisory: if the queue/options change
    /// before the track actually ends, the real selection at end-of-track
    /// may differ, in which case the precache is simply discarded.
    fn peek_next_path(&self, state: &ControllerState) -> Option<Utf8PathBuf> {
        if let Some(&serial) = state.queue.first() {
            return state.playlist.get(serial).map(|item| item.path.clone());
        }
        let base = state.before_queue.or(state.current);
        let pos = base.and_then(|c| state.play_order.iter().position(|s| *s == c));
        match pos {
            Some(pos) if pos + 1 < state.play_order.len() => {
                state.playlist.get(state.play_order[pos + 1]).map(|i| i.path.clone())
            }
            _ if state.repeat => state
                .play_order
                .first()
                .and_then(|s| state.playlist.get(*s))
                .map(|i| i.path.clone()),
            _ => None,
        }
    }

    /// Called (from a dedicated thread, never from the decode thread that
    /// just finished — see the spawn site in `play()`) once a file finishes
    /// naturally, to pick the next item (spec §4.7 `go_to_another_file`).
    fn advance_after_finish(self: &Arc<Self>) {
        if let Some(next) = self.go_to_another_file() {
            self.play(next);
        } else {
            let mut state = self.state.lock().unwrap();
            state.playback_state = PlaybackState::Stop;
            state.current = None;
            self.events.publish(Event::StateChanged(PlayerState::Stop));
        }
    }

    /// Picks the next item to play (spec §4.7 `go_to_another_file`):
    ///
    /// 1. If the queue is non-empty, its head wins, remembering the
    ///    pre-queue item so the playlist can resume there afterwards
    ///    (scenario S2).
    /// 2. Otherwise, once the queue has just drained and
    ///    `QueueNextSongReturn` is set, resume from the remembered item's
    ///    *successor* rather than the remembered item itself.
    /// 3. Otherwise advance within `play_order` (the shuffled or serial
    ///    view, per `shuffle`); on running off the end, wrap if `Repeat`
    ///    is set, reshuffling first when shuffle is on (scenario S3).
    fn go_to_another_file(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();

        if !state.queue.is_empty() {
            if state.before_queue.is_none() {
                state.before_queue = state.current;
            }
            return Some(state.queue.remove(0));
        }

        let resume_from = state.before_queue.take();
        let base = if self.options.queue_next_song_return {
            resume_from.or(state.current)
        } else {
            state.current
        };

        if state.play_order.is_empty() {
            state.play_order = state.playlist.order(state.shuffle);
        }
        let pos = base.and_then(|c| state.play_order.iter().position(|s| *s == c));
        match pos {
            Some(pos) if pos + 1 < state.play_order.len() => Some(state.play_order[pos + 1]),
            _ if state.repeat => {
                if state.shuffle {
                    state.playlist.reshuffle(None);
                    state.play_order = state.playlist.order(true);
                }
                state.play_order.first().copied()
            }
            _ => None,
        }
    }

    fn stop_locked(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            self.output_buffer.stop();
            state.player_status = None;
            state.player_handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn stop(&self) {
        self.stop_locked();
        // An explicit stop abandons whatever was being precached for a
        // natural advance that's no longer happening (spec §4.6 step 7 is
        // only meaningful across an uninterrupted end-of-track).
        self.precache.reset();
        let mut state = self.state.lock().unwrap();
        state.playback_state = PlaybackState::Stop;
        state.current = None;
        self.events.publish(Event::StateChanged(PlayerState::Stop));
    }

    /// Pausing a URL stream is treated as a stop (spec §4.7 edge case):
    /// there is no paused network buffer to resume from sensibly.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        let is_url = state
            .current
            .and_then(|serial| state.playlist.get(serial))
            .is_some_and(|item| item.path.as_str().starts_with("http"));
        if is_url {
            drop(state);
            self.stop();
            return;
        }
        self.output_buffer.pause();
        state.playback_state = PlaybackState::Pause;
        self.events.publish(Event::StateChanged(PlayerState::Pause));
    }

    pub fn unpause(&self) {
        self.output_buffer.unpause();
        self.state.lock().unwrap().playback_state = PlaybackState::Play;
        self.events.publish(Event::StateChanged(PlayerState::Play));
    }

    pub fn seek(&self, offset_secs: i64) {
        // Forwarded to the player through its request slot; the player
        // clamps the result to `[0, duration]` itself (spec §9 Open
        // Question: seek clamping lives in the player, not the
        // controller, since only the player has the decoder's duration).
        if let Some(status) = self.state.lock().unwrap().player_status.clone() {
            status.request(PlayerRequest::Seek(offset_secs));
        }
    }

    pub fn jump_to(self: &Arc<Self>, serial: u64) {
        self.play(serial);
    }

    /// `CMD_NEXT`: advances immediately instead of waiting for natural
    /// end-of-track, using the same selection rules as end-of-track (spec
    /// §4.7 `go_to_another_file`).
    pub fn next(self: &Arc<Self>) {
        match self.go_to_another_file() {
            Some(next) => self.play(next),
            None => self.stop(),
        }
    }

    /// `CMD_PREV`: goes to the predecessor in `play_order`, wrapping to
    /// the last item on `Repeat` (spec §4.7's `play_prev` branch of
    /// `go_to_another_file`, split out since it never touches the queue).
    pub fn previous(self: &Arc<Self>) {
        if let Some(prev) = self.go_to_previous_file() {
            self.play(prev);
        }
    }

    fn go_to_previous_file(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.play_order.is_empty() {
            state.play_order = state.playlist.order(state.shuffle);
        }
        let pos = state.current.and_then(|c| state.play_order.iter().position(|s| *s == c));
        match pos {
            Some(pos) if pos > 0 => Some(state.play_order[pos - 1]),
            _ if state.repeat => state.play_order.last().copied(),
            _ => None,
        }
    }

    /// `CMD_QUEUE_DEL`: removes `serial` from the fast-forward queue only
    /// (the playlist entry itself survives, same as `CMD_PLIST_DEL` being
    /// a separate operation).
    pub fn queue_del(&self, serial: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.queue.len();
        state.queue.retain(|s| *s != serial);
        state.queue.len() != before
    }

    /// `CMD_QUEUE_MOVE` / `CMD_PLIST_MOVE`: reposition `serial` within the
    /// queue or the current play order. The playlist's own serial-keyed
    /// storage (spec §4.10) never reorders; only the playback order does,
    /// which is all either command actually needs to affect.
    pub fn queue_move(&self, serial: u64, new_position: usize) -> bool {
        Self::move_within(&mut self.state.lock().unwrap().queue, serial, new_position)
    }

    pub fn plist_move(&self, serial: u64, new_position: usize) -> bool {
        let moved = Self::move_within(&mut self.state.lock().unwrap().play_order, serial, new_position);
        if moved {
            self.events.publish(Event::PlistMove { serial, new_position });
        }
        moved
    }

    fn move_within(list: &mut Vec<u64>, serial: u64, new_position: usize) -> bool {
        let Some(pos) = list.iter().position(|s| *s == serial) else {
            return false;
        };
        let item = list.remove(pos);
        list.insert(new_position.min(list.len()), item);
        true
    }

    /// `CMD_SET_MIXER`/`CMD_GET_MIXER`: volume is a property of the output
    /// driver (spec §4.5), not of the controller's own state, so these
    /// just forward to whichever driver `System` wired in.
    pub fn set_mixer(&self, value: i32) {
        if let Some(driver) = &self.driver {
            driver.lock().unwrap().set_mixer(value);
        }
        self.events.publish(Event::MixerChange(value));
    }

    pub fn get_mixer(&self) -> i32 {
        self.driver
            .as_ref()
            .map_or(100, |driver| driver.lock().unwrap().read_mixer())
    }

    pub fn toggle_mixer_channel(&self) {
        if let Some(driver) = &self.driver {
            driver.lock().unwrap().toggle_mixer_channel();
        }
    }

    pub fn mixer_channel_name(&self) -> String {
        self.driver
            .as_ref()
            .map_or_else(|| "Master".to_string(), |driver| driver.lock().unwrap().get_mixer_channel_name().to_string())
    }

    /// `CMD_TOGGLE_SOFTMIXER`: see [`OutputDriver::toggle_softmixer`].
    pub fn toggle_softmixer(&self) {
        if let Some(driver) = &self.driver {
            driver.lock().unwrap().toggle_softmixer();
        }
        self.events.publish(Event::OptionsChanged);
    }

    pub fn is_softmixer_enabled(&self) -> bool {
        self.driver
            .as_ref()
            .map_or(true, |driver| driver.lock().unwrap().is_softmixer_enabled())
    }

    /// `CMD_TOGGLE_EQUALIZER`: flips the shared [`EqConfig`] the currently
    /// (or next) playing `Player` polls once per decode iteration (spec
    /// §4.3), so it takes effect without interrupting playback.
    pub fn toggle_equalizer(&self) {
        let mut config = self.eq_config.lock().unwrap();
        config.enabled = !config.enabled;
        config.version += 1;
        self.events.publish(Event::OptionsChanged);
    }

    pub fn is_equalizer_enabled(&self) -> bool {
        self.eq_config.lock().unwrap().enabled
    }

    /// `CMD_EQUALIZER_REFRESH`: re-applies the currently selected preset
    /// (e.g. after it was edited on disk), by bumping the config version
    /// without changing bands itself — the player rebuilds on the next
    /// iteration regardless of whether the bands array actually changed.
    pub fn equalizer_refresh(&self) {
        self.eq_config.lock().unwrap().version += 1;
        self.events.publish(Event::OptionsChanged);
    }

    pub fn equalizer_next(&self) -> color_eyre::Result<()> {
        self.cycle_equalizer_preset(1)
    }

    pub fn equalizer_prev(&self) -> color_eyre::Result<()> {
        self.cycle_equalizer_preset(-1)
    }

    fn cycle_equalizer_preset(&self, delta: i64) -> color_eyre::Result<()> {
        let dir = self.options.eqsets_dir()?;
        let names = crate::eqset::list_presets(&dir)?;
        if names.is_empty() {
            return Ok(());
        }
        let len = names.len() as i64;
        let next_index = {
            let mut state = self.state.lock().unwrap();
            let next_index = match state.eq_preset_index {
                Some(i) => (i as i64 + delta).rem_euclid(len) as usize,
                None if delta >= 0 => 0,
                None => (len - 1) as usize,
            };
            state.eq_preset_index = Some(next_index);
            next_index
        };
        let preset = EqPreset::load(&dir.join(format!("{}.eqset", names[next_index])))?;
        let mut config = self.eq_config.lock().unwrap();
        config.bands = preset.bands;
        config.version += 1;
        self.events.publish(Event::OptionsChanged);
        Ok(())
    }

    /// `CMD_GET_BITRATE`: the bitrate audible right now (spec §3's bitrate
    /// timeline, queried by wall-clock position, already folded into
    /// `PlayerStatus::bitrate` by the decode loop). `None` when nothing's
    /// playing or no bitrate has been observed yet.
    pub fn current_bitrate_kbps(&self) -> Option<u32> {
        let status = self.state.lock().unwrap().player_status.clone()?;
        match status.bitrate.load(Ordering::SeqCst) {
            0 => None,
            kbps => Some(kbps as u32),
        }
    }

    pub fn current_rate(&self) -> u32 {
        self.target_params().rate
    }

    pub fn current_channels(&self) -> u8 {
        self.target_params().channels
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.state.lock().unwrap().playback_state
    }

    pub fn current(&self) -> Option<u64> {
        self.state.lock().unwrap().current
    }

    /// `CMD_GET_CTIME`: the currently playing item's audible position in
    /// seconds. Read from the output buffer's drained-bytes tracking
    /// (spec §3 `time_get`), not the decoder's raw read position, so a
    /// buffered-but-unheard tail doesn't make playback appear ahead of
    /// what's actually audible; not to be confused with `current()`'s
    /// playlist serial.
    pub fn current_time_secs(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.playback_state == PlaybackState::Stop {
            return 0.0;
        }
        self.output_buffer.time_get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_controller() -> Arc<AudioController> {
        let buf = Arc::new(OutputBuffer::new(4096));
        let events = Arc::new(EventBus::new());
        Arc::new(AudioController::new(Options::default(), buf, events))
    }

    #[test]
    fn initial_state_is_stop() {
        let controller = test_controller();
        assert_eq!(controller.playback_state(), PlaybackState::Stop);
        assert!(controller.current().is_none());
    }

    #[test]
    fn current_time_is_zero_with_nothing_playing() {
        let controller = test_controller();
        assert_eq!(controller.current_time_secs(), 0.0);
    }

    #[test]
    fn add_grows_playlist_and_play_order() {
        let controller = test_controller();
        let serial = controller.add(Utf8PathBuf::from("a.mp3"));
        let state = controller.state.lock().unwrap();
        assert_eq!(state.playlist.len(), 1);
        assert_eq!(state.play_order, vec![serial]);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn set_repeat_publishes_options_changed() {
        let controller = test_controller();
        let mut rx = controller.events.subscribe();
        controller.set_repeat(true);
        assert!(controller.state.lock().unwrap().repeat);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::OptionsChanged));
    }

    /// Scenario S1: sequential advance through the playlist with no queue
    /// and `Repeat` off stops once the last item is reached.
    #[test]
    fn go_to_another_file_advances_sequentially_then_stops() {
        let controller = test_controller();
        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let b = controller.add(Utf8PathBuf::from("b.mp3"));
        let c = controller.add(Utf8PathBuf::from("c.mp3"));
        controller.state.lock().unwrap().current = Some(a);

        assert_eq!(controller.go_to_another_file(), Some(b));
        controller.state.lock().unwrap().current = Some(b);
        assert_eq!(controller.go_to_another_file(), Some(c));
        controller.state.lock().unwrap().current = Some(c);
        assert_eq!(controller.go_to_another_file(), None);
    }

    /// Scenario S2: queue interleaving. With `current == A` and a
    /// non-empty queue, the queue head wins; once it drains and
    /// `QueueNextSongReturn` is set, playback resumes at `A`'s successor.
    #[test]
    fn go_to_another_file_drains_queue_then_resumes_playlist() {
        let mut options = Options::default();
        options.queue_next_song_return = true;
        let buf = Arc::new(OutputBuffer::new(4096));
        let events = Arc::new(EventBus::new());
        let controller = Arc::new(AudioController::new(options, buf, events));

        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let b = controller.add(Utf8PathBuf::from("b.mp3"));
        let q1 = controller.queue_add(Utf8PathBuf::from("q1.mp3"));
        let q2 = controller.queue_add(Utf8PathBuf::from("q2.mp3"));
        controller.state.lock().unwrap().current = Some(a);

        assert_eq!(controller.go_to_another_file(), Some(q1));
        controller.state.lock().unwrap().current = Some(q1);
        assert_eq!(controller.go_to_another_file(), Some(q2));
        controller.state.lock().unwrap().current = Some(q2);
        // Queue is now empty; resumes from A's successor, B.
        assert_eq!(controller.go_to_another_file(), Some(b));
    }

    /// Scenario S3: with `Repeat` on, running off the end of `play_order`
    /// wraps back to the first item instead of stopping.
    #[test]
    fn go_to_another_file_wraps_on_repeat() {
        let controller = test_controller();
        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let _b = controller.add(Utf8PathBuf::from("b.mp3"));
        let c = controller.add(Utf8PathBuf::from("c.mp3"));
        controller.set_repeat(true);
        controller.state.lock().unwrap().current = Some(c);
        assert_eq!(controller.go_to_another_file(), Some(a));
    }

    #[test]
    fn go_to_previous_file_steps_back_then_stops() {
        let controller = test_controller();
        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let b = controller.add(Utf8PathBuf::from("b.mp3"));
        controller.state.lock().unwrap().current = Some(b);
        assert_eq!(controller.go_to_previous_file(), Some(a));
        controller.state.lock().unwrap().current = Some(a);
        assert_eq!(controller.go_to_previous_file(), None);
    }

    #[test]
    fn go_to_previous_file_wraps_on_repeat() {
        let controller = test_controller();
        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let _b = controller.add(Utf8PathBuf::from("b.mp3"));
        let c = controller.add(Utf8PathBuf::from("c.mp3"));
        controller.set_repeat(true);
        controller.state.lock().unwrap().current = Some(a);
        assert_eq!(controller.go_to_previous_file(), Some(c));
    }

    #[test]
    fn queue_del_removes_only_from_queue() {
        let controller = test_controller();
        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let q1 = controller.queue_add(Utf8PathBuf::from("q1.mp3"));
        assert!(controller.queue_del(q1));
        assert!(!controller.queue_del(q1), "second delete of the same serial fails");
        let state = controller.state.lock().unwrap();
        assert!(state.queue.is_empty());
        assert_eq!(state.playlist.len(), 2);
        let _ = a;
    }

    #[test]
    fn queue_move_repositions_within_queue() {
        let controller = test_controller();
        let q1 = controller.queue_add(Utf8PathBuf::from("q1.mp3"));
        let q2 = controller.queue_add(Utf8PathBuf::from("q2.mp3"));
        let q3 = controller.queue_add(Utf8PathBuf::from("q3.mp3"));
        assert!(controller.queue_move(q3, 0));
        assert_eq!(controller.state.lock().unwrap().queue, vec![q3, q1, q2]);
    }

    #[test]
    fn plist_move_repositions_play_order_and_publishes_event() {
        let controller = test_controller();
        let a = controller.add(Utf8PathBuf::from("a.mp3"));
        let b = controller.add(Utf8PathBuf::from("b.mp3"));
        let mut rx = controller.events.subscribe();
        assert!(controller.plist_move(b, 0));
        assert_eq!(controller.state.lock().unwrap().play_order, vec![b, a]);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::PlistMove { .. }));
    }

    #[test]
    fn mixer_without_driver_reports_full_volume_and_master_channel() {
        let controller = test_controller();
        assert_eq!(controller.get_mixer(), 100);
        assert_eq!(controller.mixer_channel_name(), "Master");
        controller.set_mixer(42); // no driver wired up; must not panic
        controller.toggle_mixer_channel();
    }

    #[test]
    fn toggle_equalizer_flips_enabled_and_bumps_version() {
        let controller = test_controller();
        assert!(!controller.is_equalizer_enabled());
        controller.toggle_equalizer();
        assert!(controller.is_equalizer_enabled());
        let version_after_toggle = controller.eq_config.lock().unwrap().version;
        controller.equalizer_refresh();
        assert!(controller.eq_config.lock().unwrap().version > version_after_toggle);
    }

    #[test]
    fn current_bitrate_is_none_with_nothing_playing() {
        let controller = test_controller();
        assert!(controller.current_bitrate_kbps().is_none());
    }
}
