//! Playlist model: ordered items, a shuffled view, and a serial-indexed
//! lookup table (spec §4.10, component C10).
//!
//! The original keeps an in-memory red-black tree keyed by a monotonically
//! increasing serial number so a client can reference an item stably even
//! after the list is reordered or shuffled. `BTreeMap<u64, PlaylistItem>`
//! gives the same ordered-by-serial lookup without hand-rolling a tree
//! (spec §9 Open Question: substituting `BTreeMap` for the RB-tree).

use std::collections::BTreeMap;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, Section, eyre::Context, eyre::OptionExt};
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize, PartialEq, Eq, Hash)]
pub struct PlaylistName(pub String);

/// Title-relevant tags used by `%a`/`%A`/`%t`/`%n` in format strings (spec
/// §4.10). Populated from the tags cache; all optional because a file may
/// not have been tagged yet or tag reading may be disabled.
#[derive(Debug, Clone, Default)]
pub struct ItemTags {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub track: Option<u32>,
    pub time_secs: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub serial: u64,
    pub path: Utf8PathBuf,
    pub tags: ItemTags,
    /// Tombstone flag (spec §3 Playlist item): items are never physically
    /// removed from the backing store during a session, so a lookup by
    /// filename for an item a client just deleted still resolves. Deleting
    /// an item clears its `tags` but keeps `path`.
    pub deleted: bool,
}

/// A playlist and its shuffled view (spec §4.10): playback order always
/// goes through `order()`, which returns the shuffled permutation when
/// shuffle is on and the serial order otherwise.
#[derive(Debug, Default)]
pub struct Playlist {
    items: BTreeMap<u64, PlaylistItem>,
    next_serial: u64,
    shuffled_order: Vec<u64>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, serial: u64) -> Option<&PlaylistItem> {
        self.items.get(&serial)
    }

    pub fn add(&mut self, path: Utf8PathBuf, tags: ItemTags) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.items.insert(
            serial,
            PlaylistItem {
                serial,
                path,
                tags,
                deleted: false,
            },
        );
        self.shuffled_order.push(serial);
        serial
    }

    /// Tombstones an item rather than physically removing it (spec §3:
    /// "items are never physically removed from the backing storage
    /// during a session; deletion sets the tombstone and frees content
    /// except the filename"). Returns `false` if `serial` was unknown or
    /// already deleted.
    pub fn delete(&mut self, serial: u64) -> bool {
        self.shuffled_order.retain(|s| *s != serial);
        match self.items.get_mut(&serial) {
            Some(item) if !item.deleted => {
                item.deleted = true;
                item.tags = ItemTags::default();
                true
            }
            _ => false,
        }
    }

    /// Finds the non-deleted item with the given filename, per spec §8
    /// invariant 1. Deleted entries keep their filename but are skipped.
    pub fn find_fname(&self, path: &Utf8Path) -> Option<&PlaylistItem> {
        self.items.values().find(|it| !it.deleted && it.path == path)
    }

    pub fn not_deleted_count(&self) -> usize {
        self.items.values().filter(|it| !it.deleted).count()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.shuffled_order.clear();
        self.next_serial = 0;
    }

    /// Serial order of non-deleted items, independent of shuffle (spec
    /// §4.10).
    pub fn serial_order(&self) -> Vec<u64> {
        self.items
            .values()
            .filter(|it| !it.deleted)
            .map(|it| it.serial)
            .collect()
    }

    /// Recomputes the shuffled view with a fresh random permutation (spec
    /// §4.10's "shuffle reshuffles the whole list, not just the tail").
    /// `swap_first_fname`, if set, is kept at position 0 so resuming a
    /// shuffled playlist always starts on the song that was already
    /// playing (spec §4.10 edge case).
    pub fn reshuffle(&mut self, swap_first_fname: Option<&Utf8Path>) {
        let mut order: Vec<u64> = self
            .items
            .values()
            .filter(|it| !it.deleted)
            .map(|it| it.serial)
            .collect();
        order.shuffle(&mut rand::thread_rng());
        if let Some(fname) = swap_first_fname {
            if let Some(pos) = order
                .iter()
                .position(|s| self.items.get(s).is_some_and(|it| it.path == fname))
            {
                order.swap(0, pos);
            }
        }
        self.shuffled_order = order;
    }

    pub fn order(&self, shuffle: bool) -> Vec<u64> {
        if shuffle {
            self.shuffled_order.clone()
        } else {
            self.serial_order()
        }
    }

    /// Sum of all known item durations over non-deleted items; items with
    /// unknown duration are skipped rather than treated as zero (spec
    /// §4.10 `total_time`, §8 invariant 2).
    pub fn total_time_secs(&self) -> u32 {
        self.items
            .values()
            .filter(|i| !i.deleted)
            .filter_map(|i| i.tags.time_secs)
            .sum()
    }

    /// Count of non-deleted items whose duration is known, for "X of Y
    /// have times" style UI reporting (spec §4.10 `items_with_time`).
    pub fn items_with_time(&self) -> usize {
        self.items
            .values()
            .filter(|i| !i.deleted && i.tags.time_secs.is_some())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaylistItem> {
        self.items.values().filter(|it| !it.deleted)
    }

    /// Loads an extended M3U file (spec §6): `#EXTINF:<duration>,<title>`
    /// lines attach to the path line that immediately follows them;
    /// relative paths resolve against the playlist file's own directory,
    /// not the process CWD (spec §8 invariant 5, round-trip property).
    pub fn load_m3u(path: &Utf8Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err("Could not read playlist file")
            .with_note(|| format!("path: {path}"))?;
        let base_dir = path.parent();
        let mut playlist = Self::new();
        let mut pending: Option<ItemTags> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let (duration, title) = rest.split_once(',').unwrap_or((rest, ""));
                let time_secs = duration.trim().parse::<i64>().ok().and_then(|d| {
                    if d < 0 { None } else { Some(d as u32) }
                });
                pending = Some(ItemTags {
                    title: (!title.is_empty()).then(|| title.to_string()),
                    time_secs,
                    ..Default::default()
                });
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let file_path = Utf8PathBuf::from(line);
            let resolved = if file_path.is_relative() {
                match base_dir {
                    Some(dir) => dir.join(&file_path),
                    None => file_path,
                }
            } else {
                file_path
            };
            playlist.add(resolved, pending.take().unwrap_or_default());
        }
        Ok(playlist)
    }

    /// Writes an extended M3U file, preceding every non-deleted item with
    /// its `#EXTINF` line when a title or duration is known (spec §6).
    pub fn save_m3u(&self, path: &Utf8Path) -> Result<()> {
        let mut text = String::from("#EXTM3U\n");
        for item in self.iter() {
            if item.tags.title.is_some() || item.tags.time_secs.is_some() {
                let duration = item.tags.time_secs.map_or(-1, |t| t as i64);
                let title = item.tags.title.as_deref().unwrap_or("");
                text.push_str(&format!("#EXTINF:{duration},{title}\n"));
            }
            text.push_str(item.path.as_str());
            text.push('\n');
        }
        std::fs::write(path, text)
            .wrap_err("Could not write playlist file")
            .with_note(|| format!("path: {path}"))
    }
}

pub fn load_from_dir(dir: &Path) -> Result<std::collections::HashMap<PlaylistName, Playlist>> {
    let mut out = std::collections::HashMap::new();
    for entry in std::fs::read_dir(dir).wrap_err("Could not read playlist dir")? {
        let entry = entry.wrap_err("Could not read entry in playlist dir")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let utf8 =
            Utf8PathBuf::from_path_buf(path.clone()).map_err(|p| color_eyre::eyre::eyre!("Playlist path is not UTF-8: {p:?}"))?;
        let name = PlaylistName(
            path.file_name()
                .ok_or_eyre("Playlist file did not have a name")
                .with_note(|| format!("path: {}", path.display()))?
                .to_string_lossy()
                .to_string(),
        );
        out.insert(name, Playlist::load_m3u(&utf8)?);
    }
    Ok(out)
}

/// Renders a title format string with `%a`/`%A`/`%t`/`%n` substitutions and
/// `%(cond:then:else)` ternaries, per spec §4.10's format-string grammar.
/// `cond` is true when the tag it names is present.
pub fn format_title(format: &str, tags: &ItemTags, fallback: &Utf8Path) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => out.push_str(tags.artist.as_deref().unwrap_or("")),
            Some('A') => out.push_str(tags.album.as_deref().unwrap_or("")),
            Some('t') => out.push_str(tags.title.as_deref().unwrap_or(fallback.as_str())),
            Some('n') => {
                if let Some(track) = tags.track {
                    out.push_str(&track.to_string());
                }
            }
            Some('%') => out.push('%'),
            Some('(') => {
                let (cond, then_branch, else_branch, rest) = parse_ternary(&mut chars);
                let _ = rest;
                let take_then = tag_present(&cond, tags);
                out.push_str(&format_title(
                    if take_then { &then_branch } else { &else_branch },
                    tags,
                    fallback,
                ));
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn tag_present(letter: &str, tags: &ItemTags) -> bool {
    match letter {
        "a" => tags.artist.is_some(),
        "A" => tags.album.is_some(),
        "t" => tags.title.is_some(),
        "n" => tags.track.is_some(),
        _ => false,
    }
}

/// Parses `cond:then:else)` after a `%(` has already been consumed,
/// respecting nested parens in `then`/`else` so `%(a:%(t:x:y):z)` works.
fn parse_ternary(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> (String, String, String, ()) {
    let cond = take_until(chars, ':');
    let then_branch = take_balanced(chars, ':');
    let else_branch = take_balanced(chars, ')');
    (cond, then_branch, else_branch, ())
}

fn take_until(chars: &mut std::iter::Peekable<std::str::Chars>, stop: char) -> String {
    let mut s = String::new();
    for c in chars.by_ref() {
        if c == stop {
            break;
        }
        s.push(c);
    }
    s
}

fn take_balanced(chars: &mut std::iter::Peekable<std::str::Chars>, stop: char) -> String {
    let mut s = String::new();
    let mut depth = 0;
    for c in chars.by_ref() {
        if c == '(' {
            depth += 1;
        } else if c == ')' && depth > 0 {
            depth -= 1;
        } else if c == stop && depth == 0 {
            break;
        }
        s.push(c);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(artist: &str, title: &str) -> ItemTags {
        ItemTags {
            artist: Some(artist.to_owned()),
            title: Some(title.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn formats_basic_tags() {
        let fallback = Utf8Path::new("/music/song.mp3");
        let rendered = format_title("%a - %t", &tags("Artist", "Title"), fallback);
        assert_eq!(rendered, "Artist - Title");
    }

    #[test]
    fn falls_back_to_filename_when_title_missing() {
        let fallback = Utf8Path::new("/music/song.mp3");
        let rendered = format_title("%t", &ItemTags::default(), fallback);
        assert_eq!(rendered, "/music/song.mp3");
    }

    #[test]
    fn ternary_picks_branch_by_tag_presence() {
        let fallback = Utf8Path::new("/music/song.mp3");
        let with_artist = tags("Artist", "Title");
        let rendered = format_title("%(a:%a:unknown)", &with_artist, fallback);
        assert_eq!(rendered, "Artist");

        let without_artist = ItemTags::default();
        let rendered = format_title("%(a:%a:unknown)", &without_artist, fallback);
        assert_eq!(rendered, "unknown");
    }

    #[test]
    fn add_assigns_increasing_serials() {
        let mut playlist = Playlist::new();
        let a = playlist.add(Utf8PathBuf::from("a.mp3"), ItemTags::default());
        let b = playlist.add(Utf8PathBuf::from("b.mp3"), ItemTags::default());
        assert!(b > a);
        assert_eq!(playlist.len(), 2);
    }

    #[test]
    fn reshuffle_keeps_swap_first_at_front() {
        let mut playlist = Playlist::new();
        for name in ["a.mp3", "b.mp3", "c.mp3", "d.mp3"] {
            playlist.add(Utf8PathBuf::from(name), ItemTags::default());
        }
        let fname = Utf8PathBuf::from("c.mp3");
        playlist.reshuffle(Some(&fname));
        let first = playlist.shuffled_order[0];
        assert_eq!(playlist.get(first).unwrap().path, fname);
    }

    #[test]
    fn total_time_skips_unknown_durations() {
        let mut playlist = Playlist::new();
        playlist.add(
            Utf8PathBuf::from("a.mp3"),
            ItemTags {
                time_secs: Some(120),
                ..Default::default()
            },
        );
        playlist.add(Utf8PathBuf::from("b.mp3"), ItemTags::default());
        assert_eq!(playlist.total_time_secs(), 120);
        assert_eq!(playlist.items_with_time(), 1);
    }

    /// Spec §8 invariant 1: after deleting one item, a second item added
    /// with the same filename is still found, and the deleted entry is
    /// excluded from the live view.
    #[test]
    fn delete_tombstones_instead_of_removing() {
        let mut playlist = Playlist::new();
        let a = playlist.add(Utf8PathBuf::from("a.mp3"), tags("Artist", "A"));
        assert!(playlist.delete(a));
        assert!(!playlist.delete(a), "deleting twice reports false");

        assert_eq!(playlist.len(), 1, "tombstoned item stays in backing storage");
        assert_eq!(playlist.not_deleted_count(), 0);
        assert!(playlist.find_fname(Utf8Path::new("a.mp3")).is_none());
        assert!(playlist.get(a).unwrap().deleted);
        assert!(playlist.get(a).unwrap().tags.title.is_none());
        assert_eq!(playlist.get(a).unwrap().path, Utf8PathBuf::from("a.mp3"));
    }

    #[test]
    fn find_fname_skips_deleted_but_finds_live_entry() {
        let mut playlist = Playlist::new();
        let a = playlist.add(Utf8PathBuf::from("a.mp3"), ItemTags::default());
        playlist.add(Utf8PathBuf::from("b.mp3"), ItemTags::default());
        playlist.delete(a);
        let reinserted = playlist.add(Utf8PathBuf::from("a.mp3"), ItemTags::default());
        let found = playlist.find_fname(Utf8Path::new("a.mp3")).unwrap();
        assert_eq!(found.serial, reinserted);
    }

    #[test]
    fn m3u_round_trip_preserves_order_and_extinf_title() {
        let dir = tempfile::tempdir().unwrap();
        let playlist_path = Utf8PathBuf::from_path_buf(dir.path().join("list.m3u")).unwrap();

        let mut playlist = Playlist::new();
        playlist.add(
            Utf8PathBuf::from_path_buf(dir.path().join("a.mp3")).unwrap(),
            ItemTags {
                title: Some("Song A".into()),
                time_secs: Some(180),
                ..Default::default()
            },
        );
        playlist.add(
            Utf8PathBuf::from_path_buf(dir.path().join("b.mp3")).unwrap(),
            ItemTags::default(),
        );
        playlist.save_m3u(&playlist_path).unwrap();

        let reloaded = Playlist::load_m3u(&playlist_path).unwrap();
        let names: Vec<_> = reloaded.iter().map(|i| i.path.file_name().unwrap()).collect();
        assert_eq!(names, vec!["a.mp3", "b.mp3"]);
        let first = reloaded.iter().next().unwrap();
        assert_eq!(first.tags.title.as_deref(), Some("Song A"));
        assert_eq!(first.tags.time_secs, Some(180));
    }

    #[test]
    fn m3u_resolves_relative_paths_against_playlist_dir() {
        let dir = tempfile::tempdir().unwrap();
        let playlist_path = Utf8PathBuf::from_path_buf(dir.path().join("list.m3u")).unwrap();
        std::fs::write(&playlist_path, "#EXTM3U\nsongs/a.mp3\n").unwrap();

        let reloaded = Playlist::load_m3u(&playlist_path).unwrap();
        let item = reloaded.iter().next().unwrap();
        assert_eq!(
            item.path,
            Utf8PathBuf::from_path_buf(dir.path().join("songs/a.mp3")).unwrap()
        );
    }
}
