//! Walks a music directory and warms the tags cache (the `scan`
//! subcommand, spec §4.8's "populate cache ahead of time" use case).

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use walkdir::WalkDir;

use crate::tags_cache::TagsCache;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "wav", "aac", "m4a", "alac"];

/// Synchronously reads tags for every audio file under `music_dir`,
/// storing them in `cache`. Intentionally bypasses the background reader
/// queue: a one-shot scan wants to block until done, not return
/// immediately the way a live server's cache misses do.
pub fn scan_dir(music_dir: &Utf8Path, cache: &TagsCache) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(music_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            continue;
        }
        let Ok(path) = Utf8Path::from_path(entry.path()) else {
            continue;
        };
        if cache.get_immediate(path).is_none() {
            cache.read_and_store(path);
        }
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_non_audio_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hello").unwrap();
        let db_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("tags.db")).unwrap();
        let cache = TagsCache::open(&db_path, 10).unwrap();

        let music_dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let count = scan_dir(music_dir, &cache).unwrap();
        assert_eq!(count, 0);
    }
}
