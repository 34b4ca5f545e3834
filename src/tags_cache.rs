//! Persistent tags cache: an on-disk, SQLite-backed LRU keyed by file path,
//! refreshed by a background reader thread (spec §4.8, component C8).
//!
//! Reading tags is slow (every format has to be opened and parsed), so the
//! cache lets the server answer `CMD_GET_TAGS` instantly from disk while a
//! background thread catches up on anything stale or missing, the same
//! division of labor as the original `tags_cache.c`: a synchronous
//! `tags_cache_get_immediate` plus an async request queue serviced by a
//! reader thread.

use std::path::Path;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};

use crate::playlist::ItemTags;

/// Bumped whenever the on-disk schema or the tag-reading logic changes
/// incompatibly; a mismatch against the stored value purges the whole
/// cache rather than risk serving stale-format rows (spec §4.8's cache
/// version tag).
const CACHE_FORMAT_VERSION: i64 = 1;

pub struct TagsCache {
    conn: Mutex<Connection>,
    max_entries: u32,
    request_tx: Sender<CacheRequest>,
    request_rx: Mutex<Option<Receiver<CacheRequest>>>,
}

enum CacheRequest {
    Read {
        path: camino::Utf8PathBuf,
        respond: Sender<ItemTags>,
    },
}

impl TagsCache {
    pub fn open(path: &Utf8Path, max_entries: u32) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).wrap_err("Could not create tags cache dir")?;
        }
        let conn = Connection::open(path).wrap_err("Could not open tags cache database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value INTEGER);
             CREATE TABLE IF NOT EXISTS tags (
                 path TEXT PRIMARY KEY,
                 artist TEXT,
                 album TEXT,
                 title TEXT,
                 track INTEGER,
                 time_secs INTEGER,
                 atime INTEGER NOT NULL,
                 mod_time INTEGER
             );",
        )
        .wrap_err("Could not initialize tags cache schema")?;

        let stored_version: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| row.get(0))
            .optional()
            .wrap_err("Could not read tags cache version")?;
        if stored_version != Some(CACHE_FORMAT_VERSION) {
            conn.execute("DELETE FROM tags", [])
                .wrap_err("Could not purge stale tags cache")?;
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![CACHE_FORMAT_VERSION],
            )
            .wrap_err("Could not stamp tags cache version")?;
        }

        let (tx, rx) = channel();
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            max_entries,
            request_tx: tx,
            request_rx: Mutex::new(Some(rx)),
        }))
    }

    /// Spawns the background reader thread; call once after construction.
    /// Split from `open` so tests can exercise the synchronous path without
    /// a live thread.
    pub fn spawn_reader(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let rx = cache.request_rx.lock().unwrap().take();
        let Some(rx) = rx else { return };
        std::thread::spawn(move || {
            for request in rx {
                match request {
                    CacheRequest::Read { path, respond } => {
                        let tags = cache.read_and_store(&path);
                        let _ = respond.send(tags);
                    }
                }
            }
        });
    }

    /// Immediate, synchronous lookup (spec §4.8 `tags_cache_get_immediate`):
    /// returns whatever is cached right now without waiting on the reader
    /// thread, touching `atime` so it counts as recently used.
    ///
    /// A record whose stored `mod_time` no longer matches the file's current
    /// mtime is "outdated" (spec §3/§4.8) and is dropped rather than served:
    /// the caller sees a cache miss and falls back to `request_read`, which
    /// re-reads the file and writes a fresh record.
    pub fn get_immediate(&self, path: &Utf8Path) -> Option<ItemTags> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(ItemTags, Option<i64>)> = conn
            .query_row(
                "SELECT artist, album, title, track, time_secs, mod_time FROM tags WHERE path = ?1",
                params![path.as_str()],
                |row| {
                    Ok((
                        ItemTags {
                            artist: row.get(0)?,
                            album: row.get(1)?,
                            title: row.get(2)?,
                            track: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                            time_secs: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
                        },
                        row.get(5)?,
                    ))
                },
            )
            .optional()
            .ok()
            .flatten();
        let (tags, stored_mod_time) = row?;

        if let (Some(stored), Some(current)) = (stored_mod_time, file_mtime_secs(path.as_std_path()))
        {
            if stored != current {
                drop(conn);
                self.remove(path);
                return None;
            }
        }

        let now = jiff_unix_seconds();
        let _ = conn.execute(
            "UPDATE tags SET atime = ?1 WHERE path = ?2",
            params![now, path.as_str()],
        );
        Some(tags)
    }

    /// Drops a record outright, e.g. once `get_immediate` finds it outdated.
    fn remove(&self, path: &Utf8Path) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute("DELETE FROM tags WHERE path = ?1", params![path.as_str()]);
    }

    /// Queues a background read; the result arrives asynchronously via the
    /// returned receiver, used when the immediate lookup missed (spec
    /// §4.8's request queue).
    pub fn request_read(&self, path: &Utf8Path) -> Receiver<ItemTags> {
        let (tx, rx) = channel();
        let _ = self.request_tx.send(CacheRequest::Read {
            path: path.to_owned(),
            respond: tx,
        });
        rx
    }

    /// Synchronously reads and stores tags for `path`, bypassing the
    /// background queue. Used by the one-shot `scan` subcommand, which
    /// wants to block until the whole tree is indexed rather than return
    /// immediately the way a live server's cache miss does.
    pub fn read_and_store(&self, path: &Utf8Path) -> ItemTags {
        let tags = read_tags_from_file(path.as_std_path()).unwrap_or_default();
        self.store(path, &tags);
        tags
    }

    fn store(&self, path: &Utf8Path, tags: &ItemTags) {
        let conn = self.conn.lock().unwrap();
        let now = jiff_unix_seconds();
        let mod_time = file_mtime_secs(path.as_std_path());
        let _ = conn.execute(
            "INSERT INTO tags (path, artist, album, title, track, time_secs, atime, mod_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(path) DO UPDATE SET
                 artist = excluded.artist, album = excluded.album, title = excluded.title,
                 track = excluded.track, time_secs = excluded.time_secs, atime = excluded.atime,
                 mod_time = excluded.mod_time",
            params![
                path.as_str(),
                tags.artist,
                tags.album,
                tags.title,
                tags.track.map(|v| v as i64),
                tags.time_secs.map(|v| v as i64),
                now,
                mod_time,
            ],
        );
        self.evict_if_over_capacity(&conn);
    }

    /// Evicts the least-recently-used rows by `atime` once the table grows
    /// past `max_entries` (spec §4.8's LRU eviction).
    fn evict_if_over_capacity(&self, conn: &Connection) {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
            .unwrap_or(0);
        if count <= self.max_entries as i64 {
            return;
        }
        let over = count - self.max_entries as i64;
        let _ = conn.execute(
            "DELETE FROM tags WHERE path IN (
                 SELECT path FROM tags ORDER BY atime ASC LIMIT ?1
             )",
            params![over],
        );
    }
}

fn jiff_unix_seconds() -> i64 {
    Timestamp::now().as_second()
}

/// The source file's mtime at read time (spec §3's `mod_time` field),
/// `None` when the file no longer exists or its mtime isn't representable.
fn file_mtime_secs(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(std::time::UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

/// Reads ID3/Vorbis/MP4 tags via `lofty`, the one library in the stack that
/// already covers every format symphonia decodes.
fn read_tags_from_file(path: &Path) -> Result<ItemTags> {
    use lofty::file::TaggedFileExt;
    use lofty::prelude::{Accessor, AudioFile};

    let tagged = lofty::read_from_path(path).wrap_err("Could not read tags")?;
    let properties = tagged.properties();
    let tag = tagged.primary_tag().or_else(|| tagged.first_tag());

    Ok(ItemTags {
        artist: tag.and_then(|t| t.artist()).map(|s| s.to_string()),
        album: tag.and_then(|t| t.album()).map(|s| s.to_string()),
        title: tag.and_then(|t| t.title()).map(|s| s.to_string()),
        track: tag.and_then(|t| t.track()),
        time_secs: Some(properties.duration().as_secs() as u32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_get_immediate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("tags.db")).unwrap();
        let cache = TagsCache::open(&db_path, 10).unwrap();

        let path = Utf8Path::new("/music/song.mp3");
        let tags = ItemTags {
            artist: Some("Artist".into()),
            album: Some("Album".into()),
            title: Some("Title".into()),
            track: Some(3),
            time_secs: Some(200),
        };
        cache.store(path, &tags);

        let got = cache.get_immediate(path).unwrap();
        assert_eq!(got.artist.as_deref(), Some("Artist"));
        assert_eq!(got.track, Some(3));
    }

    #[test]
    fn missing_entry_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("tags.db")).unwrap();
        let cache = TagsCache::open(&db_path, 10).unwrap();
        assert!(cache.get_immediate(Utf8Path::new("/nonexistent.mp3")).is_none());
    }

    #[test]
    fn evicts_oldest_atime_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("tags.db")).unwrap();
        let cache = TagsCache::open(&db_path, 2).unwrap();

        for i in 0..3 {
            let path = camino::Utf8PathBuf::from(format!("/music/{i}.mp3"));
            cache.store(&path, &ItemTags::default());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let conn = cache.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    /// Spec §4.8: a record whose file changed since it was cached is
    /// "outdated" and must not be served.
    #[test]
    fn mtime_mismatch_invalidates_cached_record() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("tags.db")).unwrap();
        let cache = TagsCache::open(&db_path, 10).unwrap();

        let song_path = dir.path().join("song.mp3");
        std::fs::write(&song_path, b"not really audio").unwrap();
        let song = camino::Utf8PathBuf::from_path_buf(song_path.clone()).unwrap();

        cache.store(&song, &ItemTags { artist: Some("Stale Artist".into()), ..Default::default() });
        assert!(cache.get_immediate(&song).is_some());

        // Simulate the file changing after it was cached: bump mtime a
        // full two seconds forward so filesystems with second-granularity
        // mtimes still see a change.
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&song_path).unwrap();
        file.set_modified(newer).unwrap();

        assert!(
            cache.get_immediate(&song).is_none(),
            "stale record must be invalidated once the file's mtime moves"
        );
        // And it's actually gone, not just skipped this once.
        let conn = cache.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tags WHERE path = ?1",
                params![song.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }
}
