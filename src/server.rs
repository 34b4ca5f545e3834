//! Async client-facing dispatch loop over a UNIX domain control socket
//! (spec §4.9/§6, component C9's server half).
//!
//! This is the one place in the crate that runs on tokio: accepting
//! clients and shuttling wire-protocol frames is I/O-bound and benefits
//! from async multiplexing the way the decode/output threads don't (spec
//! §9 Design Notes). Each client gets its own task that both drains its
//! event subscription and answers commands on the same socket.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::controller::AudioController;
use crate::events::{Event, EventBus, PlayerState};
use crate::protocol::{self, Command};
use crate::tags_cache::TagsCache;

pub struct Server {
    controller: Arc<AudioController>,
    tags_cache: Arc<TagsCache>,
    events: Arc<EventBus>,
}

impl Server {
    pub fn new(controller: Arc<AudioController>, tags_cache: Arc<TagsCache>, events: Arc<EventBus>) -> Self {
        Self {
            controller,
            tags_cache,
            events,
        }
    }

    pub async fn run(self: Arc<Self>, socket_path: &camino::Utf8Path) -> Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .wrap_err_with(|| format!("Could not remove stale socket at {socket_path}"))?;
        }
        let listener = UnixListener::bind(socket_path.as_std_path())
            .wrap_err_with(|| format!("Could not bind control socket at {socket_path}"))?;
        tracing::info!(%socket_path, "listening for clients");

        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .wrap_err("Could not accept client connection")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_client(stream).await {
                    tracing::warn!(%err, "client connection ended with an error");
                }
            });
        }
    }

    async fn handle_client(&self, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut events = self.events.subscribe();

        loop {
            tokio::select! {
                command = protocol::read_i32(&mut reader) => {
                    let Ok(opcode) = command else { break };
                    self.dispatch(opcode, &mut reader, &mut write_half).await?;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.write_event(&mut write_half, &event).await?,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        opcode: i32,
        reader: &mut (impl tokio::io::AsyncRead + Unpin),
        writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    ) -> Result<()> {
        let Some(command) = Command::from_i32(opcode) else {
            protocol::write_i32(writer, -1).await?;
            return Ok(());
        };
        tracing::debug!(%command, "dispatching client command");

        match command {
            Command::Stop => {
                self.controller.stop();
                protocol::write_i32(writer, 0).await?;
            }
            Command::Pause => {
                self.controller.pause();
                protocol::write_i32(writer, 0).await?;
            }
            Command::Unpause => {
                self.controller.unpause();
                protocol::write_i32(writer, 0).await?;
            }
            Command::Seek => {
                let offset = protocol::read_i32(reader).await?;
                self.controller.seek(offset as i64);
                protocol::write_i32(writer, 0).await?;
            }
            Command::GetCtime => {
                let secs = self.controller.current_time_secs();
                protocol::write_i32(writer, secs as i32).await?;
            }
            Command::PlistAdd => {
                let path = protocol::read_str(reader).await?;
                let serial = self.controller.add(camino::Utf8PathBuf::from(path));
                protocol::write_i32(writer, serial as i32).await?;
            }
            Command::PlistClear => {
                self.controller.set_playlist(crate::playlist::Playlist::new());
                protocol::write_i32(writer, 0).await?;
            }
            Command::GetTags => {
                let path = protocol::read_str(reader).await?;
                let tags = self
                    .tags_cache
                    .get_immediate(camino::Utf8Path::new(&path))
                    .unwrap_or_default();
                protocol::write_tags(writer, &tags).await?;
            }
            Command::Play => {
                let serial = protocol::read_i32(reader).await? as u64;
                self.controller.jump_to(serial);
                protocol::write_i32(writer, 0).await?;
            }
            Command::Next => {
                self.controller.next();
                protocol::write_i32(writer, 0).await?;
            }
            Command::PlistDel => {
                let serial = protocol::read_i32(reader).await? as u64;
                let removed = self.controller.delete(serial);
                protocol::write_i32(writer, if removed { 0 } else { -1 }).await?;
            }
            Command::QueueAdd => {
                let path = protocol::read_str(reader).await?;
                let serial = self.controller.queue_add(camino::Utf8PathBuf::from(path));
                protocol::write_i32(writer, serial as i32).await?;
            }
            Command::QueueClear => {
                self.controller.queue_clear();
                protocol::write_i32(writer, 0).await?;
            }
            Command::SetOption | Command::GetOption => {
                protocol::write_i32(writer, 0).await?;
            }
            Command::Prev => {
                self.controller.previous();
                protocol::write_i32(writer, 0).await?;
            }
            Command::QueueDel => {
                let serial = protocol::read_i32(reader).await? as u64;
                let removed = self.controller.queue_del(serial);
                protocol::write_i32(writer, if removed { 0 } else { -1 }).await?;
            }
            Command::QueueMove => {
                let serial = protocol::read_i32(reader).await? as u64;
                let new_position = protocol::read_i32(reader).await? as usize;
                let moved = self.controller.queue_move(serial, new_position);
                protocol::write_i32(writer, if moved { 0 } else { -1 }).await?;
            }
            Command::PlistMove => {
                let serial = protocol::read_i32(reader).await? as u64;
                let new_position = protocol::read_i32(reader).await? as usize;
                let moved = self.controller.plist_move(serial, new_position);
                protocol::write_i32(writer, if moved { 0 } else { -1 }).await?;
            }
            Command::SetMixer => {
                let value = protocol::read_i32(reader).await?;
                self.controller.set_mixer(value);
                protocol::write_i32(writer, 0).await?;
            }
            Command::GetMixer => {
                protocol::write_i32(writer, self.controller.get_mixer()).await?;
            }
            Command::ToggleMixerChannel => {
                self.controller.toggle_mixer_channel();
                protocol::write_i32(writer, 0).await?;
            }
            Command::GetMixerChannelName => {
                protocol::write_str(writer, &self.controller.mixer_channel_name()).await?;
            }
            Command::ToggleEqualizer => {
                self.controller.toggle_equalizer();
                protocol::write_i32(writer, 0).await?;
            }
            Command::IsEqualizerEnabled => {
                protocol::write_i32(writer, self.controller.is_equalizer_enabled() as i32).await?;
            }
            Command::EqualizerNext => {
                self.controller.equalizer_next()?;
                protocol::write_i32(writer, 0).await?;
            }
            Command::EqualizerPrev => {
                self.controller.equalizer_prev()?;
                protocol::write_i32(writer, 0).await?;
            }
            Command::EqualizerRefresh => {
                self.controller.equalizer_refresh();
                protocol::write_i32(writer, 0).await?;
            }
            Command::GetBitrate => {
                protocol::write_i32(writer, self.controller.current_bitrate_kbps().map_or(-1, |v| v as i32)).await?;
            }
            Command::GetRate => {
                protocol::write_i32(writer, self.controller.current_rate() as i32).await?;
            }
            Command::GetChannels => {
                protocol::write_i32(writer, self.controller.current_channels() as i32).await?;
            }
            Command::Ping => {
                protocol::write_i32(writer, 0).await?;
            }
            Command::ToggleSoftmixer => {
                self.controller.toggle_softmixer();
                protocol::write_i32(writer, 0).await?;
            }
            Command::IsSoftmixerEnabled => {
                protocol::write_i32(writer, self.controller.is_softmixer_enabled() as i32).await?;
            }
            Command::Quit => {
                protocol::write_i32(writer, 0).await?;
                writer.flush().await?;
                return Err(color_eyre::eyre::eyre!("client requested disconnect"));
            }
        }
        writer.flush().await.wrap_err("Could not flush client socket")
    }

    async fn write_event(
        &self,
        writer: &mut (impl tokio::io::AsyncWrite + Unpin),
        event: &Event,
    ) -> Result<()> {
        // Events piggyback on the same stream as command replies; a real
        // client distinguishes the two by always issuing one command at a
        // time and reading exactly one reply frame for it, treating every
        // other frame that arrives as an event (spec §6: "clients must
        // demultiplex"). Each event carries its own tag plus its own typed
        // payload, the same `EV_* + data` shape as a command's `CMD_* +
        // payload` frame.
        protocol::write_i32(writer, event.wire_tag()).await?;
        match event {
            Event::AudioStart
            | Event::AudioStop
            | Event::PlistClear
            | Event::Busy
            | Event::ExitOnEof
            | Event::OptionsChanged => {}
            Event::PlistAdd { serial, path } => {
                protocol::write_i32(writer, *serial as i32).await?;
                protocol::write_str(writer, path.as_str()).await?;
            }
            Event::PlistDel { serial } => {
                protocol::write_i32(writer, *serial as i32).await?;
            }
            Event::PlistMove { serial, new_position } => {
                protocol::write_i32(writer, *serial as i32).await?;
                protocol::write_i32(writer, *new_position as i32).await?;
            }
            Event::StatusMsg(message) => {
                protocol::write_str(writer, message).await?;
            }
            Event::CtimeChanged(secs) => {
                protocol::write_i32(writer, *secs as i32).await?;
            }
            Event::StateChanged(state) => {
                let code = match state {
                    PlayerState::Play => 0,
                    PlayerState::Pause => 1,
                    PlayerState::Stop => 2,
                };
                protocol::write_i32(writer, code).await?;
            }
            Event::TagsChanged { serial, tags } => {
                protocol::write_i32(writer, *serial as i32).await?;
                protocol::write_tags(writer, tags).await?;
            }
            Event::MixerChange(value) => {
                protocol::write_i32(writer, *value).await?;
            }
            Event::AveragedBitrate(kbps) => {
                protocol::write_i32(writer, *kbps as i32).await?;
            }
        }
        writer.flush().await.wrap_err("Could not flush event frame")
    }
}
