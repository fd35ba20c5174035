//! Client orchestrator: drives the main-channel handshake, fans out
//! the per-channel connections and exposes the top-level API consumed
//! by the driver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::RgbaImage;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::agent::{ClipboardFormat, ClipboardSelection, Monitor};
use crate::caps::caps;
use crate::connection::{BoxedStream, ChannelHandler, Connection};
use crate::cursor::CursorChannel;
use crate::display::DisplayChannel;
use crate::error::SpiceError;
use crate::inputs::InputsChannel;
use crate::link;
use crate::main_channel::MainChannel;
use crate::playback::PlaybackChannel;
use crate::proto::{
    Channel, ChannelKind, SPICE_DISPLAY_CAP_LZ4_COMPRESSION, SPICE_DISPLAY_CAP_MONITORS_CONFIG,
    SPICE_DISPLAY_CAP_MULTI_CODEC, SPICE_DISPLAY_CAP_PREF_COMPRESSION,
    SPICE_DISPLAY_CAP_SIZED_STREAM, SPICE_DISPLAY_CAP_STREAM_REPORT,
    SPICE_MAIN_CAP_AGENT_CONNECTED_TOKENS, SPICE_PLAYBACK_CAP_OPUS, SPICE_PLAYBACK_CAP_VOLUME,
    SPICE_RECORD_CAP_OPUS, SPICE_RECORD_CAP_VOLUME,
};
use crate::record::RecordChannel;
use crate::sound::SoundDriver;
use crate::webdav::WebdavChannel;

/// The primary surface as shared with the driver: the display channel
/// keeps drawing into it, the driver reads it on refresh.
pub type SharedImage = Arc<RwLock<RgbaImage>>;

// ── Collaborator traits ──────────────────────────────────────────

/// Supplies the TCP/TLS streams the client runs over. `compress` is
/// requested only for the display channel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn spice_connect(&self, compress: bool) -> Result<BoxedStream, SpiceError>;
}

/// The platform display/input/clipboard sink. All callbacks are
/// invoked from channel reader tasks and must not block for long.
pub trait Driver: Send + Sync + 'static {
    /// The primary surface is ready for initial display.
    fn display_init(&self, image: SharedImage);
    /// Something was drawn; repaint when convenient.
    fn display_refresh(&self);

    /// Input handle for forwarding user events.
    fn set_events_target(&self, inputs: Arc<InputsChannel>);
    /// Main-channel handle for clipboard and monitor control.
    fn set_main_target(&self, main: Arc<MainChannel>);

    /// Update the pointer shape; `None` clears it.
    fn set_cursor(&self, image: Option<RgbaImage>, hot_x: u16, hot_y: u16);

    /// The peer grabbed a selection and can deliver these formats.
    fn clipboard_grabbed(&self, selection: ClipboardSelection, formats: Vec<ClipboardFormat>);
    /// The peer asks for our clipboard contents.
    fn clipboard_fetch(
        &self,
        selection: ClipboardSelection,
        format: ClipboardFormat,
    ) -> Result<Vec<u8>, SpiceError>;
    /// The peer released a selection.
    fn clipboard_release(&self, selection: ClipboardSelection);
}

// ── Media clock ──────────────────────────────────────────────────

/// The server's monotonic millisecond clock, reconstructed from
/// periodic announcements plus the local elapsed time.
pub struct MediaClock {
    inner: RwLock<(u32, Instant)>,
}

impl MediaClock {
    pub fn new() -> Self {
        MediaClock { inner: RwLock::new((0, Instant::now())) }
    }

    /// Record a server announcement, snapshotting local time.
    pub fn update(&self, mm_time: u32) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = (mm_time, Instant::now());
    }

    /// Current media time in milliseconds.
    pub fn time(&self) -> u32 {
        let (mm, stamp) = *self.inner.read().unwrap_or_else(|e| e.into_inner());
        mm.wrapping_add(stamp.elapsed().as_millis() as u32)
    }

    /// Time until media time `t`, zero if already reached.
    pub fn till(&self, t: u32) -> Duration {
        let (mm, stamp) = *self.inner.read().unwrap_or_else(|e| e.into_inner());
        let offset_ms = t as i64 - mm as i64;
        let remaining = offset_ms - stamp.elapsed().as_millis() as i64;
        if remaining <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(remaining as u64)
        }
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

// ── Shared client state ──────────────────────────────────────────

/// State shared between the orchestrator and every channel. Channels
/// hold this, never the [`Client`] itself.
pub struct ClientInner {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) sound: Option<Arc<dyn SoundDriver>>,
    pub(crate) password: String,
    pub(crate) session: AtomicU32,
    pub(crate) displays: AtomicU32,
    pub(crate) clock: Arc<MediaClock>,
}

impl ClientInner {
    /// Dial and handshake one channel.
    async fn connect_channel(
        &self,
        kind: Channel,
        id: u8,
        channel_caps: &[u32],
    ) -> Result<Arc<Connection>, SpiceError> {
        // stream-level compression is only worthwhile for display data
        let compress = kind == Channel::Display;
        let mut stream = self.connector.spice_connect(compress).await?;
        let session = link::handshake(
            &mut stream,
            self.session.load(Ordering::SeqCst),
            kind,
            id,
            channel_caps,
            &self.password,
        )
        .await?;
        Ok(Connection::new(stream, session))
    }
}

// ── Client ───────────────────────────────────────────────────────

enum Endpoint {
    Display(Arc<DisplayChannel>),
    Cursor(Arc<CursorChannel>),
    Inputs(Arc<InputsChannel>),
    Playback(Arc<PlaybackChannel>),
    Record(Arc<RecordChannel>),
    Webdav(Arc<WebdavChannel>),
}

struct ChannelUp {
    endpoint: Endpoint,
    conn: Arc<Connection>,
    reader: JoinHandle<()>,
}

/// A connected SPICE session.
pub struct Client {
    inner: Arc<ClientInner>,
    main: Arc<MainChannel>,
    display: Option<Arc<DisplayChannel>>,
    cursor: Option<Arc<CursorChannel>>,
    inputs: Option<Arc<InputsChannel>>,
    playback: Option<Arc<PlaybackChannel>>,
    record: Option<Arc<RecordChannel>>,
    webdav: Option<Arc<WebdavChannel>>,
    connections: Vec<Arc<Connection>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect the main channel, wait for the channel list, then bring
    /// up every announced channel concurrently.
    pub async fn new(
        connector: Arc<dyn Connector>,
        driver: Arc<dyn Driver>,
        sound: Option<Arc<dyn SoundDriver>>,
        password: &str,
    ) -> Result<Client, SpiceError> {
        let inner = Arc::new(ClientInner {
            connector,
            driver,
            sound,
            password: password.to_string(),
            session: AtomicU32::new(0),
            displays: AtomicU32::new(0),
            clock: Arc::new(MediaClock::new()),
        });

        let main_conn = inner
            .connect_channel(
                Channel::Main,
                0,
                &caps(&[SPICE_MAIN_CAP_AGENT_CONNECTED_TOKENS]),
            )
            .await?;
        let (main, ready) = MainChannel::new(Arc::clone(&inner), Arc::clone(&main_conn));
        let main_reader = main_conn.spawn_reader(Arc::clone(&main) as Arc<dyn ChannelHandler>);
        inner.driver.set_main_target(Arc::clone(&main));

        ready.await.map_err(|_| SpiceError::ChannelClosed)?;

        let mut client = Client {
            inner: Arc::clone(&inner),
            main: Arc::clone(&main),
            display: None,
            cursor: None,
            inputs: None,
            playback: None,
            record: None,
            webdav: None,
            connections: vec![main_conn],
            readers: Mutex::new(vec![main_reader]),
        };

        let mut setups: JoinSet<Option<ChannelUp>> = JoinSet::new();
        for info in main.channels() {
            let inner = Arc::clone(&inner);
            match info.kind {
                ChannelKind::Known(kind) => {
                    if matches!(kind, Channel::Display | Channel::Cursor) && info.id > 0 {
                        // a single display/cursor pair is driven
                        continue;
                    }
                    setups.spawn(async move {
                        match setup_channel(inner, kind, info.id).await {
                            Ok(up) => up,
                            Err(e) => {
                                warn!(channel = %kind, id = info.id, error = %e,
                                      "channel setup failed");
                                None
                            }
                        }
                    });
                }
                ChannelKind::Unknown(n) => {
                    warn!(kind = n, id = info.id, "unknown channel type announced");
                }
            }
        }

        while let Some(res) = setups.join_next().await {
            let Ok(Some(up)) = res else { continue };
            client.connections.push(up.conn);
            client
                .readers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(up.reader);
            match up.endpoint {
                Endpoint::Display(d) => client.display = Some(d),
                Endpoint::Cursor(c) => client.cursor = Some(c),
                Endpoint::Inputs(i) => client.inputs = Some(i),
                Endpoint::Playback(p) => client.playback = Some(p),
                Endpoint::Record(r) => client.record = Some(r),
                Endpoint::Webdav(w) => client.webdav = Some(w),
            }
        }

        Ok(client)
    }

    /// Current media time in milliseconds.
    pub fn media_time(&self) -> u32 {
        self.inner.clock.time()
    }

    /// Duration until media time `t`.
    pub fn media_till(&self, t: u32) -> Duration {
        self.inner.clock.till(t)
    }

    /// Tell the guest to resize to `width`×`height` at 32-bit depth.
    pub fn update_view(&self, width: u32, height: u32) {
        self.main.monitors_config(
            0,
            &[Monitor { width, height, depth: 32, x: 0, y: 0 }],
        );
    }

    pub fn main(&self) -> &Arc<MainChannel> {
        &self.main
    }

    pub fn display(&self) -> Option<&Arc<DisplayChannel>> {
        self.display.as_ref()
    }

    pub fn cursor(&self) -> Option<&Arc<CursorChannel>> {
        self.cursor.as_ref()
    }

    pub fn inputs(&self) -> Option<&Arc<InputsChannel>> {
        self.inputs.as_ref()
    }

    pub fn record(&self) -> Option<&Arc<RecordChannel>> {
        self.record.as_ref()
    }

    pub fn toggle_mute(&self) {
        if let Some(p) = &self.playback {
            p.toggle_mute();
        }
    }

    pub fn set_mute(&self, muted: bool) {
        if let Some(p) = &self.playback {
            p.set_mute(muted);
        }
    }

    pub fn muted(&self) -> bool {
        self.playback.as_ref().map(|p| p.muted()).unwrap_or(false)
    }

    /// The file-transfer sub-channel, when the server offers one.
    pub fn file_transfer(&self) -> Option<&Arc<WebdavChannel>> {
        self.webdav.as_ref()
    }

    /// Close every socket and join the reader tasks.
    pub async fn close(&self) {
        self.main.shutdown();
        for conn in &self.connections {
            conn.close();
        }
        let readers: Vec<_> = std::mem::take(
            &mut *self.readers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in readers {
            let _ = handle.await;
        }
        info!("client shut down");
    }
}

/// Connect and wire up one announced channel.
async fn setup_channel(
    inner: Arc<ClientInner>,
    kind: Channel,
    id: u8,
) -> Result<Option<ChannelUp>, SpiceError> {
    match kind {
        Channel::Display => {
            let conn = inner
                .connect_channel(
                    kind,
                    id,
                    &caps(&[
                        SPICE_DISPLAY_CAP_SIZED_STREAM,
                        SPICE_DISPLAY_CAP_STREAM_REPORT,
                        SPICE_DISPLAY_CAP_MONITORS_CONFIG,
                        SPICE_DISPLAY_CAP_MULTI_CODEC,
                        SPICE_DISPLAY_CAP_LZ4_COMPRESSION,
                        SPICE_DISPLAY_CAP_PREF_COMPRESSION,
                    ]),
                )
                .await?;
            let display = DisplayChannel::new(inner, Arc::clone(&conn));
            let reader = conn.spawn_reader(Arc::clone(&display) as Arc<dyn ChannelHandler>);
            display.announce_preferences().await?;
            Ok(Some(ChannelUp {
                endpoint: Endpoint::Display(display),
                conn,
                reader,
            }))
        }
        Channel::Cursor => {
            let conn = inner.connect_channel(kind, id, &[]).await?;
            let cursor = CursorChannel::new(inner, Arc::clone(&conn));
            let reader = conn.spawn_reader(Arc::clone(&cursor) as Arc<dyn ChannelHandler>);
            Ok(Some(ChannelUp {
                endpoint: Endpoint::Cursor(cursor),
                conn,
                reader,
            }))
        }
        Channel::Inputs => {
            let conn = inner.connect_channel(kind, id, &[]).await?;
            let inputs = InputsChannel::new(Arc::clone(&conn));
            let reader = conn.spawn_reader(Arc::clone(&inputs) as Arc<dyn ChannelHandler>);
            inputs.announce_modifiers().await?;
            inner.driver.set_events_target(Arc::clone(&inputs));
            Ok(Some(ChannelUp {
                endpoint: Endpoint::Inputs(inputs),
                conn,
                reader,
            }))
        }
        Channel::Playback => {
            let conn = inner
                .connect_channel(
                    kind,
                    id,
                    &caps(&[SPICE_PLAYBACK_CAP_VOLUME, SPICE_PLAYBACK_CAP_OPUS]),
                )
                .await?;
            let playback = PlaybackChannel::new(inner, Arc::clone(&conn));
            let reader = conn.spawn_reader(Arc::clone(&playback) as Arc<dyn ChannelHandler>);
            Ok(Some(ChannelUp {
                endpoint: Endpoint::Playback(playback),
                conn,
                reader,
            }))
        }
        Channel::Record => {
            let conn = inner
                .connect_channel(
                    kind,
                    id,
                    &caps(&[SPICE_RECORD_CAP_VOLUME, SPICE_RECORD_CAP_OPUS]),
                )
                .await?;
            let record = RecordChannel::new(inner, Arc::clone(&conn));
            let reader = conn.spawn_reader(Arc::clone(&record) as Arc<dyn ChannelHandler>);
            Ok(Some(ChannelUp {
                endpoint: Endpoint::Record(record),
                conn,
                reader,
            }))
        }
        Channel::Webdav => {
            let conn = inner.connect_channel(kind, id, &[]).await?;
            let webdav = WebdavChannel::new(Arc::clone(&conn));
            let reader = conn.spawn_reader(Arc::clone(&webdav) as Arc<dyn ChannelHandler>);
            Ok(Some(ChannelUp {
                endpoint: Endpoint::Webdav(webdav),
                conn,
                reader,
            }))
        }
        Channel::UsbRedir => {
            info!(id, "USB redirection offered by server, not implemented");
            Ok(None)
        }
        other => {
            info!(channel = %other, id, "announced channel type not supported");
            Ok(None)
        }
    }
}

// ── Test support ─────────────────────────────────────────────────
