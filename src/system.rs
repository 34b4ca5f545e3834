//! Top-level composition root: wires config, the tags cache, the output
//! driver/buffer, the audio controller and the control-socket server
//! together (spec §2/§4, mirrors the teacher's `System`).

use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::Context};

use crate::config::Options;
use crate::controller::AudioController;
use crate::conversion::{AudioParams, SampleFormat};
use crate::events::EventBus;
use crate::output::{CpalDriver, OutputDriver};
use crate::output_buffer::OutputBuffer;
use crate::server::Server;
use crate::tags_cache::TagsCache;

pub struct System {
    pub options: Options,
    pub controller: Arc<AudioController>,
    pub tags_cache: Arc<TagsCache>,
    pub server: Arc<Server>,
}

impl System {
    pub fn new(options: Options) -> Result<Self> {
        let moc_dir = options.moc_dir()?;
        std::fs::create_dir_all(&moc_dir)
            .wrap_err_with(|| format!("Could not create moc dir at {moc_dir}"))?;

        let tags_cache = TagsCache::open(
            &moc_dir.join("tags_cache.db"),
            options.tags_cache_size,
        )?;
        tags_cache.spawn_reader();

        let output_buffer = Arc::new(OutputBuffer::new(options.output_buffer_bytes()));
        let events = Arc::new(EventBus::new());

        // Opened eagerly (not lazily on first `play()`) so mixer/device
        // commands issued before anything plays still have something to
        // act on, and so the playback thread below and the controller's
        // mixer commands (spec §4.5) share the same driver instance.
        let driver_name = options.sound_driver.clone();
        let driver: Option<Arc<Mutex<Box<dyn OutputDriver>>>> = match CpalDriver::open_named(&driver_name) {
            Ok(mut driver) => {
                let params = AudioParams {
                    rate: if options.force_sample_rate != 0 {
                        options.force_sample_rate
                    } else {
                        44100
                    },
                    channels: 2,
                    format: SampleFormat::S16,
                };
                match driver.open(params) {
                    Ok(()) => Some(Arc::new(Mutex::new(Box::new(driver) as Box<dyn OutputDriver>))),
                    Err(err) => {
                        tracing::error!(%err, "could not open output device");
                        None
                    }
                }
            }
            Err(err) => {
                tracing::error!(%err, "no usable output device found");
                None
            }
        };

        let controller = Arc::new(AudioController::with_driver(
            options.clone(),
            Arc::clone(&output_buffer),
            Arc::clone(&events),
            driver.clone(),
        ));

        let server = Arc::new(Server::new(
            Arc::clone(&controller),
            Arc::clone(&tags_cache),
            Arc::clone(&events),
        ));

        if let Some(driver) = driver {
            std::thread::spawn(move || loop {
                if driver.lock().unwrap().play(&output_buffer).is_err() {
                    break;
                }
            });
        }

        Ok(Self {
            options,
            controller,
            tags_cache,
            server,
        })
    }

    pub async fn run(self, socket_path: &Utf8PathBuf) -> Result<()> {
        self.server.run(socket_path).await
    }
}
