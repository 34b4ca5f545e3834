//! Binary wire protocol for the control socket (spec §6).
//!
//! Unlike the teacher's MPD-style text-line protocol, MOC's wire format is
//! fixed-width binary frames: an `i32` opcode/value, length-prefixed
//! strings, and a handful of composite records (`time`, `item`, `tags`).
//! `byteorder`'s native-endian read/write extensions on top of a
//! `tokio::net::UnixStream` give the same shape the original gets from
//! raw `read()`/`write()` on a UNIX domain socket.

use std::io;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::playlist::ItemTags;

/// Mirrors the `CMD_*` constants in `protocol.h` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(i32)]
pub enum Command {
    Play = 0x01,
    Stop = 0x02,
    Pause = 0x03,
    Unpause = 0x04,
    Next = 0x05,
    Seek = 0x06,
    GetCtime = 0x07,
    PlistAdd = 0x08,
    PlistDel = 0x09,
    PlistClear = 0x0a,
    GetTags = 0x0b,
    SetOption = 0x0c,
    GetOption = 0x0d,
    Quit = 0x0e,
    QueueAdd = 0x0f,
    QueueClear = 0x10,
    Prev = 0x11,
    QueueDel = 0x12,
    QueueMove = 0x13,
    PlistMove = 0x14,
    SetMixer = 0x15,
    GetMixer = 0x16,
    ToggleMixerChannel = 0x17,
    GetMixerChannelName = 0x18,
    ToggleEqualizer = 0x19,
    IsEqualizerEnabled = 0x1a,
    EqualizerNext = 0x1b,
    EqualizerPrev = 0x1c,
    EqualizerRefresh = 0x1d,
    GetBitrate = 0x1e,
    GetRate = 0x1f,
    GetChannels = 0x20,
    Ping = 0x21,
    ToggleSoftmixer = 0x22,
    IsSoftmixerEnabled = 0x23,
}

impl Command {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0x01 => Self::Play,
            0x02 => Self::Stop,
            0x03 => Self::Pause,
            0x04 => Self::Unpause,
            0x05 => Self::Next,
            0x06 => Self::Seek,
            0x07 => Self::GetCtime,
            0x08 => Self::PlistAdd,
            0x09 => Self::PlistDel,
            0x0a => Self::PlistClear,
            0x0b => Self::GetTags,
            0x0c => Self::SetOption,
            0x0d => Self::GetOption,
            0x0e => Self::Quit,
            0x0f => Self::QueueAdd,
            0x10 => Self::QueueClear,
            0x11 => Self::Prev,
            0x12 => Self::QueueDel,
            0x13 => Self::QueueMove,
            0x14 => Self::PlistMove,
            0x15 => Self::SetMixer,
            0x16 => Self::GetMixer,
            0x17 => Self::ToggleMixerChannel,
            0x18 => Self::GetMixerChannelName,
            0x19 => Self::ToggleEqualizer,
            0x1a => Self::IsEqualizerEnabled,
            0x1b => Self::EqualizerNext,
            0x1c => Self::EqualizerPrev,
            0x1d => Self::EqualizerRefresh,
            0x1e => Self::GetBitrate,
            0x1f => Self::GetRate,
            0x20 => Self::GetChannels,
            0x21 => Self::Ping,
            0x22 => Self::ToggleSoftmixer,
            0x23 => Self::IsSoftmixerEnabled,
            _ => return None,
        })
    }
}

pub async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    (&buf[..]).read_i32::<NativeEndian>()
}

pub async fn write_i32<W: AsyncWrite + Unpin>(writer: &mut W, value: i32) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4);
    buf.write_i32::<NativeEndian>(value)?;
    writer.write_all(&buf).await
}

/// A `str` on the wire is a 4-byte length prefix followed by raw (not
/// necessarily UTF-8-validated by the protocol, but treated as UTF-8 here)
/// bytes (spec §6).
pub async fn read_str<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let len = read_i32(reader).await?;
    if len < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "negative string length"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn write_str<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> io::Result<()> {
    write_i32(writer, value.len() as i32).await?;
    writer.write_all(value.as_bytes()).await
}

/// `time` on the wire: seconds as a 4-byte integer, `-1` meaning unknown
/// (spec §6).
pub async fn read_time<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<u32>> {
    let raw = read_i32(reader).await?;
    Ok(if raw < 0 { None } else { Some(raw as u32) })
}

pub async fn write_time<W: AsyncWrite + Unpin>(writer: &mut W, value: Option<u32>) -> io::Result<()> {
    write_i32(writer, value.map_or(-1, |v| v as i32)).await
}

/// `tags` on the wire: each field is an optional `str` (empty-length =
/// absent) plus the track number and time as `i32`s (spec §6).
pub async fn read_tags<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<ItemTags> {
    let artist = read_opt_str(reader).await?;
    let album = read_opt_str(reader).await?;
    let title = read_opt_str(reader).await?;
    let track = read_i32(reader).await?;
    let time_secs = read_i32(reader).await?;
    Ok(ItemTags {
        artist,
        album,
        title,
        track: if track < 0 { None } else { Some(track as u32) },
        time_secs: if time_secs < 0 { None } else { Some(time_secs as u32) },
    })
}

pub async fn write_tags<W: AsyncWrite + Unpin>(writer: &mut W, tags: &ItemTags) -> io::Result<()> {
    write_opt_str(writer, tags.artist.as_deref()).await?;
    write_opt_str(writer, tags.album.as_deref()).await?;
    write_opt_str(writer, tags.title.as_deref()).await?;
    write_i32(writer, tags.track.map_or(-1, |v| v as i32)).await?;
    write_i32(writer, tags.time_secs.map_or(-1, |v| v as i32)).await
}

async fn read_opt_str<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<String>> {
    let s = read_str(reader).await?;
    Ok(if s.is_empty() { None } else { Some(s) })
}

async fn write_opt_str<W: AsyncWrite + Unpin>(writer: &mut W, value: Option<&str>) -> io::Result<()> {
    write_str(writer, value.unwrap_or("")).await
}

/// `item`: a playlist entry's serial, path and tags together (spec §6).
pub async fn read_item<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u64, String, ItemTags)> {
    let serial = read_i32(reader).await? as u64;
    let path = read_str(reader).await?;
    let tags = read_tags(reader).await?;
    Ok((serial, path, tags))
}

pub async fn write_item<W: AsyncWrite + Unpin>(
    writer: &mut W,
    serial: u64,
    path: &str,
    tags: &ItemTags,
) -> io::Result<()> {
    write_i32(writer, serial as i32).await?;
    write_str(writer, path).await?;
    write_tags(writer, tags).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn i32_roundtrip() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -42).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_i32(&mut cursor).await.unwrap(), -42);
    }

    #[tokio::test]
    async fn str_roundtrip() {
        let mut buf = Vec::new();
        write_str(&mut buf, "hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_str(&mut cursor).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn time_none_roundtrips_as_negative() {
        let mut buf = Vec::new();
        write_time(&mut buf, None).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_time(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tags_roundtrip() {
        let tags = ItemTags {
            artist: Some("Artist".into()),
            album: None,
            title: Some("Title".into()),
            track: Some(5),
            time_secs: Some(180),
        };
        let mut buf = Vec::new();
        write_tags(&mut buf, &tags).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let got = read_tags(&mut cursor).await.unwrap();
        assert_eq!(got.artist, tags.artist);
        assert_eq!(got.album, None);
        assert_eq!(got.track, tags.track);
    }

    #[test]
    fn command_from_i32_rejects_unknown() {
        assert!(Command::from_i32(0xffff).is_none());
        assert_eq!(Command::from_i32(0x01), Some(Command::Play));
    }

    #[test]
    fn command_from_i32_covers_mixer_and_equalizer_opcodes() {
        assert_eq!(Command::from_i32(0x11), Some(Command::Prev));
        assert_eq!(Command::from_i32(0x15), Some(Command::SetMixer));
        assert_eq!(Command::from_i32(0x19), Some(Command::ToggleEqualizer));
        assert_eq!(Command::from_i32(0x1e), Some(Command::GetBitrate));
        assert_eq!(Command::from_i32(0x21), Some(Command::Ping));
    }
}
