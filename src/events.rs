//! Server-side event queue: per-client broadcast of player/playlist state
//! changes (spec §4.9, component C9).
//!
//! The player/controller/tags cache run on plain OS threads; the
//! client-facing dispatch loop is the one async part of this crate (spec
//! §9 Design Notes). Each client's queue is therefore a bounded
//! `tokio::sync::mpsc` channel rather than the original's per-client
//! non-blocking ring drained with `EAGAIN` retries: an async `recv().await`
//! gives the same "don't block the rest of the server on one slow client"
//! property without a polling loop.

use camino::Utf8PathBuf;
use tokio::sync::broadcast;

use crate::playlist::ItemTags;

/// Mirrors the `EV_*` constants in `protocol.h` (spec §4.9).
#[derive(Debug, Clone)]
pub enum Event {
    PlistAdd { serial: u64, path: Utf8PathBuf },
    PlistDel { serial: u64 },
    PlistClear,
    PlistMove { serial: u64, new_position: usize },
    StatusMsg(String),
    Busy,
    CtimeChanged(f64),
    StateChanged(PlayerState),
    ExitOnEof,
    TagsChanged { serial: u64, tags: ItemTags },
    OptionsChanged,
    MixerChange(i32),
    AudioStart,
    AudioStop,
    AveragedBitrate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Play,
    Stop,
    Pause,
}

impl Event {
    /// Mirrors the `EV_*` wire tags (spec §4.9/§6): every event variant
    /// gets its own non-zero tag, so a client reading an unsolicited frame
    /// off the control socket can tell which event it is before decoding
    /// the event's own payload, rather than every event collapsing to the
    /// same content-free marker.
    pub fn wire_tag(&self) -> i32 {
        match self {
            Event::AudioStart => 1,
            Event::AudioStop => 2,
            Event::PlistClear => 3,
            Event::PlistAdd { .. } => 4,
            Event::PlistDel { .. } => 5,
            Event::PlistMove { .. } => 6,
            Event::StatusMsg(_) => 7,
            Event::Busy => 8,
            Event::CtimeChanged(_) => 9,
            Event::StateChanged(_) => 10,
            Event::ExitOnEof => 11,
            Event::TagsChanged { .. } => 12,
            Event::OptionsChanged => 13,
            Event::MixerChange(_) => 14,
            Event::AveragedBitrate(_) => 15,
        }
    }
}

/// One broadcast sender shared by the controller/player, fanned out to
/// per-client queues. New clients subscribe and get every event from that
/// point on; a client that falls behind its queue capacity sees
/// `RecvError::Lagged` and should resync from a fresh status query rather
/// than replay, which mirrors the original dropping stale events for a
/// slow client instead of blocking the server on it.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No receivers yet (e.g. no clients connected) is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::PlistClear);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::PlistClear));
    }

    #[test]
    fn wire_tags_are_all_distinct() {
        let samples = [
            Event::AudioStart,
            Event::AudioStop,
            Event::PlistClear,
            Event::PlistAdd { serial: 0, path: Utf8PathBuf::from("a") },
            Event::PlistDel { serial: 0 },
            Event::PlistMove { serial: 0, new_position: 0 },
            Event::StatusMsg(String::new()),
            Event::Busy,
            Event::CtimeChanged(0.0),
            Event::StateChanged(PlayerState::Play),
            Event::ExitOnEof,
            Event::TagsChanged { serial: 0, tags: ItemTags::default() },
            Event::OptionsChanged,
            Event::MixerChange(0),
            Event::AveragedBitrate(0),
        ];
        let mut tags: Vec<i32> = samples.iter().map(Event::wire_tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), samples.len());
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_events() {
        let bus = EventBus::new();
        bus.publish(Event::PlistClear);
        let mut rx = bus.subscribe();
        bus.publish(Event::AudioStart);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::AudioStart));
    }
}
