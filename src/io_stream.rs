//! Uniform read/peek/seek/tell/size abstraction over local files and HTTP
//! streams (spec §4.1, component C1).
//!
//! A local file is opened either as a plain buffered `fd` or mmap'ed,
//! depending on `buffered`; a network stream runs a background fetcher
//! thread that owns the socket and feeds a shared ring so `read`/`peek`
//! never block on the network directly (the caller instead blocks on the
//! fetcher's fill condition, mirroring `io.c`'s `buf_mtx`/`buf_fill_cond`).

use std::fs::File;
use std::io::Read as _;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use camino::Utf8Path;

use crate::util::RingByteBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

/// Fired whenever the prebuffer fill level crosses a threshold, so a UI can
/// show prebuffering progress (spec §4.1).
pub type FillCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

struct NetworkState {
    buf: Mutex<NetworkBuf>,
    free_cond: Condvar,
    fill_cond: Condvar,
    stop: std::sync::atomic::AtomicBool,
}

struct NetworkBuf {
    ring: RingByteBuffer,
    eof: bool,
    read_error: bool,
    mime_type: Option<String>,
    metadata_title: Option<String>,
    metadata_url: Option<String>,
    icy_metaint: Option<usize>,
    icy_count: usize,
}

/// Uniform I/O abstraction with `{FILE_FD, FILE_MMAP, NETWORK_STREAM}`
/// variants (spec §4.1).
pub enum IoStream {
    Fd {
        file: Mutex<File>,
        pos: Mutex<u64>,
        size: Option<u64>,
    },
    Mmap {
        map: memmap2::Mmap,
        pos: Mutex<u64>,
    },
    Network {
        state: Arc<NetworkState>,
        pos: Mutex<u64>,
        handle: Option<JoinHandle<()>>,
        fill_callback: Mutex<Option<FillCallback>>,
    },
}

impl IoStream {
    pub fn open_file(path: &Utf8Path, buffered: bool) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata().ok().map(|m| m.len());
        if buffered {
            Ok(Self::Fd {
                file: Mutex::new(file),
                pos: Mutex::new(0),
                size,
            })
        } else {
            // SAFETY: the file is not expected to be truncated concurrently
            // for the lifetime of this mapping; same contract mmap() users
            // in general accept.
            let map = unsafe { memmap2::Mmap::map(&file)? };
            Ok(Self::Mmap {
                map,
                pos: Mutex::new(0),
            })
        }
    }

    /// Opens an HTTP(S) stream and spawns the background fetcher thread.
    /// ICY `metaint` metadata is parsed out-of-band per spec §4.1.
    pub fn open_url(url: &str) -> color_eyre::Result<Self> {
        use color_eyre::eyre::Context;

        let response = ureq::get(url)
            .set("Icy-MetaData", "1")
            .call()
            .wrap_err_with(|| format!("Could not connect to stream at {url}"))?;

        let mime_type = response
            .header("content-type")
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_owned());
        let icy_metaint = response
            .header("icy-metaint")
            .and_then(|s| s.parse::<usize>().ok());
        let icy_name = response.header("icy-name").map(str::to_owned);

        let state = Arc::new(NetworkState {
            buf: Mutex::new(NetworkBuf {
                ring: RingByteBuffer::new(1024 * 1024),
                eof: false,
                read_error: false,
                mime_type,
                metadata_title: None,
                metadata_url: icy_name,
                icy_metaint,
                icy_count: 0,
            }),
            free_cond: Condvar::new(),
            fill_cond: Condvar::new(),
            stop: std::sync::atomic::AtomicBool::new(false),
        });

        let reader = response.into_reader();
        let fetch_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || fetch_loop(reader, fetch_state));

        Ok(Self::Network {
            state,
            pos: Mutex::new(0),
            handle: Some(handle),
            fill_callback: Mutex::new(None),
        })
    }

    pub fn set_buf_fill_callback(&self, callback: FillCallback) {
        if let Self::Network { fill_callback, .. } = self {
            *fill_callback.lock().unwrap() = Some(callback);
        }
    }

    pub fn seekable(&self) -> bool {
        !matches!(self, Self::Network { .. })
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Fd { size, .. } => *size,
            Self::Mmap { map, .. } => Some(map.len() as u64),
            Self::Network { .. } => None,
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            Self::Fd { pos, .. } | Self::Mmap { pos, .. } | Self::Network { pos, .. } => {
                *pos.lock().unwrap()
            }
        }
    }

    pub fn eof(&self) -> bool {
        match self {
            Self::Fd { pos, size, .. } => size.is_some_and(|s| *pos.lock().unwrap() >= s),
            Self::Mmap { map, pos } => *pos.lock().unwrap() >= map.len() as u64,
            Self::Network { state, .. } => {
                let buf = state.buf.lock().unwrap();
                buf.eof && buf.ring.is_empty()
            }
        }
    }

    pub fn ok(&self) -> bool {
        match self {
            Self::Network { state, .. } => !state.buf.lock().unwrap().read_error,
            _ => true,
        }
    }

    pub fn get_mime_type(&self) -> Option<String> {
        match self {
            Self::Network { state, .. } => state.buf.lock().unwrap().mime_type.clone(),
            _ => None,
        }
    }

    pub fn get_metadata_title(&self) -> Option<String> {
        match self {
            Self::Network { state, .. } => state.buf.lock().unwrap().metadata_title.clone(),
            _ => None,
        }
    }

    pub fn get_metadata_url(&self) -> Option<String> {
        match self {
            Self::Network { state, .. } => state.buf.lock().unwrap().metadata_url.clone(),
            _ => None,
        }
    }

    /// Blocks until at least `bytes` are buffered or EOF, per spec §4.1.
    pub fn prebuffer(&self, bytes: usize) {
        if let Self::Network { state, .. } = self {
            let mut buf = state.buf.lock().unwrap();
            while buf.ring.fill() < bytes && !buf.eof {
                buf = state.fill_cond.wait(buf).unwrap();
            }
        }
    }

    pub fn abort(&self) {
        if let Self::Network { state, .. } = self {
            state.stop.store(true, std::sync::atomic::Ordering::SeqCst);
            state.fill_cond.notify_all();
            state.free_cond.notify_all();
        }
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> Option<u64> {
        match self {
            Self::Fd { pos, size, .. } => {
                let mut pos = pos.lock().unwrap();
                let base = match whence {
                    SeekWhence::Start => 0,
                    SeekWhence::Current => *pos as i64,
                    SeekWhence::End => size.unwrap_or(0) as i64,
                };
                let new_pos = (base + offset).max(0) as u64;
                *pos = new_pos;
                Some(new_pos)
            }
            Self::Mmap { map, pos } => {
                let mut pos = pos.lock().unwrap();
                let base = match whence {
                    SeekWhence::Start => 0,
                    SeekWhence::Current => *pos as i64,
                    SeekWhence::End => map.len() as i64,
                };
                let new_pos = (base + offset).max(0).min(map.len() as i64) as u64;
                *pos = new_pos;
                Some(new_pos)
            }
            Self::Network { .. } => None,
        }
    }

    pub fn read(&self, count: usize) -> std::io::Result<Vec<u8>> {
        self.read_impl(count, true)
    }

    pub fn peek(&self, count: usize) -> std::io::Result<Vec<u8>> {
        self.read_impl(count, false)
    }

    fn read_impl(&self, count: usize, advance: bool) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Fd { file, pos, .. } => {
                use std::io::{Seek, SeekFrom};
                let mut file = file.lock().unwrap();
                let mut pos_guard = pos.lock().unwrap();
                file.seek(SeekFrom::Start(*pos_guard))?;
                let mut buf = vec![0u8; count];
                let n = file.read(&mut buf)?;
                buf.truncate(n);
                if advance {
                    *pos_guard += n as u64;
                }
                Ok(buf)
            }
            Self::Mmap { map, pos } => {
                let mut pos_guard = pos.lock().unwrap();
                let start = (*pos_guard as usize).min(map.len());
                let end = (start + count).min(map.len());
                let buf = map[start..end].to_vec();
                if advance {
                    *pos_guard = end as u64;
                }
                Ok(buf)
            }
            Self::Network { state, pos, .. } => {
                let mut buf = state.buf.lock().unwrap();
                while buf.ring.fill() == 0 && !buf.eof {
                    buf = state.fill_cond.wait(buf).unwrap();
                }
                let out = if advance {
                    buf.ring.pop(count)
                } else {
                    buf.ring.peek(count)
                };
                if advance {
                    *pos.lock().unwrap() += out.len() as u64;
                    state.free_cond.notify_all();
                }
                Ok(out)
            }
        }
    }
}

impl Drop for IoStream {
    fn drop(&mut self) {
        if let Self::Network { handle, .. } = self {
            self.abort();
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Background fetcher thread body for a network stream: reads off the
/// socket in chunks, strips ICY metadata packets out-of-band, and feeds the
/// shared ring, waking anyone blocked in `prebuffer`/`read`.
fn fetch_loop(mut reader: Box<dyn std::io::Read + Send + Sync>, state: Arc<NetworkState>) {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        if state.stop.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        match reader.read(&mut chunk) {
            Ok(0) => {
                let mut buf = state.buf.lock().unwrap();
                buf.eof = true;
                state.fill_cond.notify_all();
                return;
            }
            Ok(n) => {
                let mut buf = state.buf.lock().unwrap();
                while buf.ring.free() < n && !state.stop.load(std::sync::atomic::Ordering::SeqCst)
                {
                    buf = state.free_cond.wait(buf).unwrap();
                }
                ingest_with_icy(&mut buf, &chunk[..n]);
                state.fill_cond.notify_all();
            }
            Err(_) => {
                let mut buf = state.buf.lock().unwrap();
                buf.read_error = true;
                buf.eof = true;
                state.fill_cond.notify_all();
                return;
            }
        }
    }
}

/// Strips SHOUTcast-style ICY metadata packets injected every `metaint`
/// bytes of audio and surfaces the parsed title through `metadata_title`.
fn ingest_with_icy(buf: &mut NetworkBuf, data: &[u8]) {
    let Some(metaint) = buf.icy_metaint else {
        buf.ring.push(data);
        return;
    };
    let mut rest = data;
    while !rest.is_empty() {
        let until_meta = metaint.saturating_sub(buf.icy_count);
        if until_meta > 0 {
            let take = until_meta.min(rest.len());
            buf.ring.push(&rest[..take]);
            buf.icy_count += take;
            rest = &rest[take..];
            continue;
        }
        // At the metadata boundary: the first byte is a length in 16-byte
        // blocks. We only handle the case where the whole packet is
        // already in `rest`; if it straddles a chunk boundary we drop it
        // rather than attempt to reassemble, which only costs one title
        // update on a stream boundary.
        if rest.is_empty() {
            break;
        }
        let len_blocks = rest[0] as usize;
        let meta_len = len_blocks * 16;
        if rest.len() < 1 + meta_len {
            buf.icy_count = 0;
            break;
        }
        if meta_len > 0 {
            let meta = &rest[1..1 + meta_len];
            if let Ok(text) = std::str::from_utf8(meta) {
                if let Some(title) = parse_icy_title(text) {
                    buf.metadata_title = Some(title);
                }
            }
        }
        rest = &rest[1 + meta_len..];
        buf.icy_count = 0;
    }
}

fn parse_icy_title(meta: &str) -> Option<String> {
    // Format: StreamTitle='...';StreamUrl='...';
    let key = "StreamTitle='";
    let start = meta.find(key)? + key.len();
    let end = meta[start..].find("';")? + start;
    Some(meta[start..end].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_icy_title() {
        let meta = "StreamTitle='Artist - Song';StreamUrl='http://x';";
        assert_eq!(parse_icy_title(meta).as_deref(), Some("Artist - Song"));
    }

    #[test]
    fn missing_title_is_none() {
        assert_eq!(parse_icy_title("StreamUrl='http://x';"), None);
    }

    #[test]
    fn local_file_read_and_seek_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let path = camino::Utf8Path::from_path(&path).unwrap();

        let stream = IoStream::open_file(path, true).unwrap();
        assert_eq!(stream.read(4).unwrap(), b"0123");
        assert_eq!(stream.tell(), 4);
        stream.seek(0, SeekWhence::Start);
        assert_eq!(stream.read(2).unwrap(), b"01");

        let mapped = IoStream::open_file(path, false).unwrap();
        assert_eq!(mapped.peek(3).unwrap(), b"012");
        assert_eq!(mapped.tell(), 0);
        assert_eq!(mapped.size(), Some(10));
    }
}
