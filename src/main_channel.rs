//! Main channel: session init, channel discovery, mouse modes, the
//! media clock feed, and the agent side-channel (clipboard, monitor
//! configuration).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent::{
    AgentBus, AgentFrame, ClipboardData, ClipboardFormat, ClipboardSelection, Monitor,
    VD_AGENT_ANNOUNCE_CAPABILITIES, VD_AGENT_CAP_CLIPBOARD_BY_DEMAND,
    VD_AGENT_CAP_CLIPBOARD_GRAB_SERIAL, VD_AGENT_CAP_CLIPBOARD_SELECTION,
    VD_AGENT_CAP_MONITORS_CONFIG, VD_AGENT_CLIPBOARD, VD_AGENT_CLIPBOARD_GRAB,
    VD_AGENT_CLIPBOARD_RELEASE, VD_AGENT_CLIPBOARD_REQUEST, VD_AGENT_DISPLAY_CONFIG,
    VD_AGENT_GRAPHICS_DEVICE_INFO, VD_AGENT_MONITORS_CONFIG, VD_AGENT_SERVER_TOKEN_AMOUNT,
};
use crate::caps::{caps, test_cap};
use crate::client::ClientInner;
use crate::connection::{ChannelHandler, Connection};
use crate::error::SpiceError;
use crate::primitives::WireReader;
use crate::proto::{
    ChannelKind, SPICE_MOUSE_MODE_CLIENT, SPICE_MSGC_MAIN_AGENT_START,
    SPICE_MSGC_MAIN_ATTACH_CHANNELS, SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST,
    SPICE_MSG_MAIN_AGENT_CONNECTED, SPICE_MSG_MAIN_AGENT_DATA,
    SPICE_MSG_MAIN_AGENT_DISCONNECTED, SPICE_MSG_MAIN_AGENT_TOKEN,
    SPICE_MSG_MAIN_CHANNELS_LIST, SPICE_MSG_MAIN_INIT, SPICE_MSG_MAIN_MOUSE_MODE,
    SPICE_MSG_MAIN_MULTI_MEDIA_TIME,
};

/// How long a clipboard request waits for the peer's answer.
const CLIPBOARD_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry of the server's channel list.
#[derive(Debug, Clone, Copy)]
pub struct ChannelInfo {
    pub kind: ChannelKind,
    pub id: u8,
}

/// Handle to the main channel, handed to the driver via
/// [`crate::client::Driver::set_main_target`].
pub struct MainChannel {
    client: Arc<ClientInner>,
    conn: Arc<Connection>,
    agent: Arc<AgentBus>,

    mouse_modes: AtomicU32,
    mouse_mode: AtomicU32,
    agent_present: AtomicBool,
    ram_hint: AtomicU32,

    channels: Mutex<Vec<ChannelInfo>>,
    ready: Mutex<Option<oneshot::Sender<()>>>,

    /// Rendezvous slot for the single outstanding clipboard request.
    /// Cleared on delivery and on timeout so a late answer cannot leak
    /// into the next request.
    clipboard_slot: Mutex<Option<oneshot::Sender<ClipboardData>>>,
    /// Serializes requesters.
    clipboard_gate: tokio::sync::Mutex<()>,
}

impl MainChannel {
    /// Build the channel plus the readiness future resolved once the
    /// server's channel list arrives.
    pub(crate) fn new(
        client: Arc<ClientInner>,
        conn: Arc<Connection>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let agent = AgentBus::new(Arc::clone(&conn));
        tokio::spawn(Arc::clone(&agent).run());

        let main = Arc::new(MainChannel {
            client,
            conn,
            agent,
            mouse_modes: AtomicU32::new(0),
            mouse_mode: AtomicU32::new(0),
            agent_present: AtomicBool::new(false),
            ram_hint: AtomicU32::new(0),
            channels: Mutex::new(Vec::new()),
            ready: Mutex::new(Some(ready_tx)),
            clipboard_slot: Mutex::new(None),
            clipboard_gate: tokio::sync::Mutex::new(()),
        });
        (main, ready_rx)
    }

    pub(crate) fn shutdown(&self) {
        self.agent.stop();
        self.conn.close();
    }

    /// Channels announced by the server.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the guest agent is currently attached.
    pub fn agent_connected(&self) -> bool {
        self.agent_present.load(Ordering::SeqCst)
    }

    /// Mouse mode currently in effect (server=1, client=2).
    pub fn mouse_mode(&self) -> u32 {
        self.mouse_mode.load(Ordering::SeqCst)
    }

    /// Mouse modes the server supports, as a bitmask.
    pub fn mouse_modes(&self) -> u32 {
        self.mouse_modes.load(Ordering::SeqCst)
    }

    /// Server-suggested RAM hint from MAIN_INIT.
    pub fn ram_hint(&self) -> u32 {
        self.ram_hint.load(Ordering::SeqCst)
    }

    // ── Outbound ─────────────────────────────────────────────────

    pub async fn request_mouse_mode(&self, mode: u32) -> Result<(), SpiceError> {
        self.conn
            .send(SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST, &mode.to_le_bytes())
            .await
    }

    /// Reconfigure the guest's monitors over the agent bus.
    pub fn monitors_config(&self, flags: u32, monitors: &[Monitor]) {
        let mut body = Vec::with_capacity(8 + monitors.len() * 20);
        body.extend_from_slice(&(monitors.len() as u32).to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        for m in monitors {
            body.extend_from_slice(&m.height.to_le_bytes());
            body.extend_from_slice(&m.width.to_le_bytes());
            body.extend_from_slice(&m.depth.to_le_bytes());
            body.extend_from_slice(&m.x.to_le_bytes());
            body.extend_from_slice(&m.y.to_le_bytes());
        }
        self.agent.write(VD_AGENT_MONITORS_CONFIG, 0, &body);
    }

    /// Push display settings (wallpaper/font-smoothing/animation flags
    /// and colour depth) to the guest agent.
    pub fn display_config(&self, flags: u32, depth: u32) {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&depth.to_le_bytes());
        self.agent.write(VD_AGENT_DISPLAY_CONFIG, 0, &body);
    }

    /// Claim ownership of a selection, advertising the formats we can
    /// later deliver.
    pub fn grab_clipboard(
        &self,
        selection: ClipboardSelection,
        formats: &[ClipboardFormat],
    ) {
        if formats.is_empty() {
            return;
        }

        let mut body = Vec::new();
        if self.selection_supported() {
            body.extend_from_slice(&[selection as u8, 0, 0, 0]);
        } else if selection != ClipboardSelection::Clipboard {
            // the peer only understands the default selection
            return;
        }
        for f in formats {
            body.extend_from_slice(&f.to_wire().to_le_bytes());
        }

        info!(?selection, ?formats, "grabbing clipboard");
        self.agent.write(VD_AGENT_CLIPBOARD_GRAB, 0, &body);
    }

    /// Ask the peer for clipboard data. At most one request is in
    /// flight; gives up after five seconds.
    pub async fn request_clipboard(
        &self,
        selection: ClipboardSelection,
        format: ClipboardFormat,
    ) -> Result<Vec<u8>, SpiceError> {
        let _gate = self.clipboard_gate.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.clipboard_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let mut body = Vec::new();
        if self.selection_supported() {
            body.extend_from_slice(&[selection as u8, 0, 0, 0]);
        }
        body.extend_from_slice(&format.to_wire().to_le_bytes());
        self.agent.write(VD_AGENT_CLIPBOARD_REQUEST, 0, &body);

        match tokio::time::timeout(CLIPBOARD_TIMEOUT, rx).await {
            Ok(Ok(data)) => Ok(data.data),
            Ok(Err(_)) => Err(SpiceError::ChannelClosed),
            Err(_) => {
                // rearm: a late answer must not leak into the next request
                self.clipboard_slot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                Err(SpiceError::Timeout(CLIPBOARD_TIMEOUT))
            }
        }
    }

    fn send_clipboard(
        &self,
        selection: ClipboardSelection,
        format: ClipboardFormat,
        data: &[u8],
    ) {
        let mut body = Vec::with_capacity(8 + data.len());
        if self.selection_supported() {
            body.extend_from_slice(&[selection as u8, 0, 0, 0]);
        }
        body.extend_from_slice(&format.to_wire().to_le_bytes());
        body.extend_from_slice(data);

        debug!(?format, len = data.len(), "sending clipboard data");
        self.agent.write(VD_AGENT_CLIPBOARD, 0, &body);
    }

    fn selection_supported(&self) -> bool {
        test_cap(self.agent.peer_caps(), VD_AGENT_CAP_CLIPBOARD_SELECTION)
    }

    // ── Agent session ────────────────────────────────────────────

    async fn agent_init(&self) -> Result<(), SpiceError> {
        info!("initiating agent link");
        self.conn
            .send(
                SPICE_MSGC_MAIN_AGENT_START,
                &VD_AGENT_SERVER_TOKEN_AMOUNT.to_le_bytes(),
            )
            .await?;

        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&1u32.to_le_bytes()); // request
        body.extend_from_slice(
            &caps(&[
                VD_AGENT_CAP_MONITORS_CONFIG,
                VD_AGENT_CAP_CLIPBOARD_BY_DEMAND,
                VD_AGENT_CAP_CLIPBOARD_SELECTION,
                VD_AGENT_CAP_CLIPBOARD_GRAB_SERIAL,
            ])[0]
                .to_le_bytes(),
        );
        self.agent.write(VD_AGENT_ANNOUNCE_CAPABILITIES, 0, &body);
        Ok(())
    }

    /// Strip the selection prefix when the peer negotiated per-
    /// selection clipboards.
    fn split_selection<'a>(&self, body: &'a [u8]) -> (ClipboardSelection, &'a [u8]) {
        if self.selection_supported() && body.len() >= 4 {
            (ClipboardSelection::from(body[0]), &body[4..])
        } else {
            (ClipboardSelection::Clipboard, body)
        }
    }

    fn dispatch_agent(&self, frame: AgentFrame) {
        match frame.typ {
            VD_AGENT_ANNOUNCE_CAPABILITIES => {
                // leading u32 is the request flag
                if frame.body.len() < 8 {
                    return;
                }
                let words: Vec<u32> = frame.body[4..]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                if let Some(&first) = words.first() {
                    self.agent.set_peer_caps(first);
                }
                info!(caps = ?words, "agent capabilities announced");
            }
            VD_AGENT_CLIPBOARD => {
                let (selection, rest) = self.split_selection(&frame.body);
                if rest.len() < 4 {
                    return;
                }
                let format =
                    ClipboardFormat::from(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]));
                let data = ClipboardData {
                    selection,
                    format,
                    data: rest[4..].to_vec(),
                };

                // non-blocking: if nobody is waiting the answer is dropped
                let slot = self
                    .clipboard_slot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                match slot {
                    Some(tx) => {
                        let _ = tx.send(data);
                    }
                    None => debug!("clipboard data with no waiting request"),
                }
            }
            VD_AGENT_CLIPBOARD_GRAB => {
                let (selection, rest) = self.split_selection(&frame.body);
                let formats: Vec<ClipboardFormat> = rest
                    .chunks_exact(4)
                    .map(|c| ClipboardFormat::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect();
                self.client.driver.clipboard_grabbed(selection, formats);
            }
            VD_AGENT_CLIPBOARD_REQUEST => {
                let (selection, rest) = self.split_selection(&frame.body);
                if rest.len() < 4 {
                    return;
                }
                let format =
                    ClipboardFormat::from(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]));
                debug!(?selection, ?format, "peer requests our clipboard");
                match self.client.driver.clipboard_fetch(selection, format) {
                    Ok(data) => self.send_clipboard(selection, format, &data),
                    Err(e) => warn!(error = %e, "clipboard fetch failed"),
                }
            }
            VD_AGENT_CLIPBOARD_RELEASE => {
                let (selection, _) = self.split_selection(&frame.body);
                self.client.driver.clipboard_release(selection);
            }
            VD_AGENT_GRAPHICS_DEVICE_INFO => {
                debug!(len = frame.body.len(), "graphics device info from agent");
            }
            other => {
                debug!(
                    typ = other,
                    opaque = frame.opaque,
                    size = frame.body.len(),
                    "unhandled agent message"
                );
            }
        }
    }

    // ── Inbound main messages ────────────────────────────────────

    async fn handle_init(&self, data: &[u8]) -> Result<(), SpiceError> {
        let mut r = WireReader::new(data, "main init");
        let session = r.u32()?;
        let displays = r.u32()?;
        let mouse_modes = r.u32()?;
        let mouse_mode = r.u32()?;
        let agent = r.u32()?;
        let agent_tokens = r.u32()?;
        let mm_time = r.u32()?;
        let ram_hint = r.u32()?;

        info!(
            session, displays, mouse_modes, mouse_mode, agent, agent_tokens, mm_time, ram_hint,
            "main init"
        );

        self.client.session.store(session, Ordering::SeqCst);
        self.client.displays.store(displays, Ordering::SeqCst);
        self.mouse_modes.store(mouse_modes, Ordering::SeqCst);
        self.mouse_mode.store(mouse_mode, Ordering::SeqCst);
        self.ram_hint.store(ram_hint, Ordering::SeqCst);
        self.agent.set_tokens(agent_tokens);
        self.client.clock.update(mm_time);

        if mouse_modes & SPICE_MOUSE_MODE_CLIENT != 0 && mouse_mode != SPICE_MOUSE_MODE_CLIENT {
            self.request_mouse_mode(SPICE_MOUSE_MODE_CLIENT).await?;
        }

        self.conn.send(SPICE_MSGC_MAIN_ATTACH_CHANNELS, &[]).await?;

        if agent != 0 {
            self.agent_present.store(true, Ordering::SeqCst);
            self.agent_init().await?;
        }
        Ok(())
    }

    fn handle_channels_list(&self, data: &[u8]) {
        let mut r = WireReader::new(data, "channels list");
        let Ok(count) = r.u32() else { return };

        let mut list = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let (Ok(kind), Ok(id)) = (r.u8(), r.u8()) else { break };
            list.push(ChannelInfo { kind: ChannelKind::from(kind), id });
        }
        info!(channels = list.len(), "channel list received");

        *self.channels.lock().unwrap_or_else(|e| e.into_inner()) = list;

        // signal readiness exactly once
        if let Some(tx) = self.ready.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl ChannelHandler for MainChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        match typ {
            SPICE_MSG_MAIN_INIT => {
                if let Err(e) = self.handle_init(data).await {
                    warn!(error = %e, "main init failed");
                }
            }
            SPICE_MSG_MAIN_CHANNELS_LIST => self.handle_channels_list(data),
            SPICE_MSG_MAIN_MOUSE_MODE => {
                if data.len() < 4 {
                    return;
                }
                let supported = u16::from_le_bytes([data[0], data[1]]) as u32;
                let current = u16::from_le_bytes([data[2], data[3]]) as u32;
                self.mouse_modes.store(supported, Ordering::SeqCst);
                self.mouse_mode.store(current, Ordering::SeqCst);
                info!(current, supported, "mouse mode update");

                if supported & SPICE_MOUSE_MODE_CLIENT != 0
                    && current != SPICE_MOUSE_MODE_CLIENT
                {
                    if let Err(e) = self.request_mouse_mode(SPICE_MOUSE_MODE_CLIENT).await {
                        warn!(error = %e, "mouse mode request failed");
                    }
                }
            }
            SPICE_MSG_MAIN_MULTI_MEDIA_TIME => {
                if data.len() != 4 {
                    return;
                }
                let mm_time = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                debug!(mm_time, "multimedia time update");
                self.client.clock.update(mm_time);
            }
            SPICE_MSG_MAIN_AGENT_CONNECTED => {
                self.agent_present.store(true, Ordering::SeqCst);
                if let Err(e) = self.agent_init().await {
                    warn!(error = %e, "agent init failed");
                }
            }
            SPICE_MSG_MAIN_AGENT_DISCONNECTED => {
                self.agent_present.store(false, Ordering::SeqCst);
            }
            SPICE_MSG_MAIN_AGENT_DATA => match self.agent.receive_carrier(data).await {
                Ok(frames) => {
                    for frame in frames {
                        self.dispatch_agent(frame);
                    }
                }
                Err(e) => warn!(error = %e, "agent carrier handling failed"),
            },
            SPICE_MSG_MAIN_AGENT_TOKEN => {
                if data.len() != 4 {
                    return;
                }
                let amount = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.agent.add_tokens(amount);
            }
            other => debug!(typ = other, "unhandled main message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{client_inner, MockDriver};
    use crate::link::LinkSession;
    use crate::proto::{Channel, SPICE_MSGC_MAIN_AGENT_DATA};
    use tokio::io::AsyncReadExt;

    async fn read_frame(server: &mut tokio::io::DuplexStream) -> (u16, Vec<u8>) {
        let mut hdr = [0u8; 6];
        server.read_exact(&mut hdr).await.unwrap();
        let typ = u16::from_le_bytes([hdr[0], hdr[1]]);
        let size = u32::from_le_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]);
        let mut payload = vec![0u8; size as usize];
        server.read_exact(&mut payload).await.unwrap();
        (typ, payload)
    }

    fn main_over_pipe() -> (
        Arc<MainChannel>,
        Arc<MockDriver>,
        tokio::io::DuplexStream,
        oneshot::Receiver<()>,
    ) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let driver = Arc::new(MockDriver::default());
        let inner = client_inner(driver.clone());
        let conn = Connection::new(Box::new(client), LinkSession::plain(Channel::Main, 0));
        let (main, ready) = MainChannel::new(inner, conn);
        (main, driver, server, ready)
    }

    fn agent_frame(typ: u32, body: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&1u32.to_le_bytes());
        v.extend_from_slice(&typ.to_le_bytes());
        v.extend_from_slice(&0u64.to_le_bytes());
        v.extend_from_slice(&(body.len() as u32).to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    #[tokio::test]
    async fn channels_list_signals_readiness_once() {
        let (main, _driver, _server, ready) = main_over_pipe();

        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_le_bytes());
        body.push(Channel::Display as u8);
        body.push(0);
        body.push(Channel::Inputs as u8);
        body.push(0);

        main.handle(SPICE_MSG_MAIN_CHANNELS_LIST, &body).await;
        ready.await.expect("readiness signalled");

        let list = main.channels();
        assert_eq!(list.len(), 2);
        assert!(matches!(list[0].kind, ChannelKind::Known(Channel::Display)));

        // a second list must not panic on the consumed sender
        main.handle(SPICE_MSG_MAIN_CHANNELS_LIST, &body).await;
    }

    #[tokio::test]
    async fn clipboard_response_resolves_request() {
        let (main, _driver, _server, _ready) = main_over_pipe();
        main.agent.set_tokens(10);

        let main2 = Arc::clone(&main);
        let request =
            tokio::spawn(async move {
                main2
                    .request_clipboard(ClipboardSelection::Clipboard, ClipboardFormat::Utf8Text)
                    .await
            });

        // give the requester a moment to arm the slot
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes()); // format utf8
        body.extend_from_slice(b"hello");
        main.handle(
            SPICE_MSG_MAIN_AGENT_DATA,
            &agent_frame(VD_AGENT_CLIPBOARD, &body),
        )
        .await;

        let got = request.await.unwrap().expect("clipboard data");
        assert_eq!(got, b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn clipboard_request_times_out_and_rearms() {
        let (main, _driver, _server, _ready) = main_over_pipe();
        main.agent.set_tokens(10);

        let err = main
            .request_clipboard(ClipboardSelection::Clipboard, ClipboardFormat::Utf8Text)
            .await
            .unwrap_err();
        assert!(matches!(err, SpiceError::Timeout(_)));

        // slot was cleared on timeout: a late response is dropped, and
        // a new request pairs with a new response
        let mut late = Vec::new();
        late.extend_from_slice(&1u32.to_le_bytes());
        late.extend_from_slice(b"stale");
        main.handle(
            SPICE_MSG_MAIN_AGENT_DATA,
            &agent_frame(VD_AGENT_CLIPBOARD, &late),
        )
        .await;

        let main2 = Arc::clone(&main);
        let request =
            tokio::spawn(async move {
                main2
                    .request_clipboard(ClipboardSelection::Clipboard, ClipboardFormat::Utf8Text)
                    .await
            });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(b"fresh");
        main.handle(
            SPICE_MSG_MAIN_AGENT_DATA,
            &agent_frame(VD_AGENT_CLIPBOARD, &body),
        )
        .await;

        assert_eq!(request.await.unwrap().unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn clipboard_grab_reaches_driver() {
        let (main, driver, _server, _ready) = main_over_pipe();

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes()); // UTF8_TEXT
        body.extend_from_slice(&2u32.to_le_bytes()); // IMAGE_PNG
        main.handle(
            SPICE_MSG_MAIN_AGENT_DATA,
            &agent_frame(VD_AGENT_CLIPBOARD_GRAB, &body),
        )
        .await;

        let grabs = driver.grabs();
        assert_eq!(grabs.len(), 1);
        assert_eq!(
            grabs[0].1,
            vec![ClipboardFormat::Utf8Text, ClipboardFormat::ImagePng]
        );
    }

    #[tokio::test]
    async fn clipboard_request_is_served_from_driver() {
        let (main, driver, mut server, _ready) = main_over_pipe();
        driver.set_clipboard(b"from-driver".to_vec());
        main.agent.set_tokens(10);

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        main.handle(
            SPICE_MSG_MAIN_AGENT_DATA,
            &agent_frame(VD_AGENT_CLIPBOARD_REQUEST, &body),
        )
        .await;

        let (typ, payload) = read_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_MAIN_AGENT_DATA);
        // carrier: 20-byte agent header, then format + data
        assert_eq!(
            u32::from_le_bytes(payload[4..8].try_into().unwrap()),
            VD_AGENT_CLIPBOARD
        );
        assert_eq!(
            u32::from_le_bytes(payload[20..24].try_into().unwrap()),
            1 // UTF8_TEXT
        );
        assert_eq!(&payload[24..], b"from-driver");
    }

    #[tokio::test]
    async fn selection_prefix_is_parsed_when_negotiated() {
        let (main, driver, _server, _ready) = main_over_pipe();
        main.agent.set_peer_caps(1 << VD_AGENT_CAP_CLIPBOARD_SELECTION);

        let mut body = Vec::new();
        body.extend_from_slice(&[1, 0, 0, 0]); // PRIMARY selection
        body.extend_from_slice(&1u32.to_le_bytes());
        main.handle(
            SPICE_MSG_MAIN_AGENT_DATA,
            &agent_frame(VD_AGENT_CLIPBOARD_GRAB, &body),
        )
        .await;

        let grabs = driver.grabs();
        assert_eq!(grabs[0].0, ClipboardSelection::Primary);
    }

    #[tokio::test]
    async fn monitors_config_field_order() {
        let (main, _driver, mut server, _ready) = main_over_pipe();
        main.agent.set_tokens(10);

        main.monitors_config(
            0,
            &[Monitor { width: 1024, height: 768, depth: 32, x: 5, y: 6 }],
        );

        let (_typ, payload) = read_frame(&mut server).await;
        let body = &payload[20..];
        assert_eq!(u32::from_le_bytes(body[0..4].try_into().unwrap()), 1); // count
        assert_eq!(u32::from_le_bytes(body[4..8].try_into().unwrap()), 0); // flags
        // monitor fields are serialized height first
        assert_eq!(u32::from_le_bytes(body[8..12].try_into().unwrap()), 768);
        assert_eq!(u32::from_le_bytes(body[12..16].try_into().unwrap()), 1024);
        assert_eq!(u32::from_le_bytes(body[16..20].try_into().unwrap()), 32);
        assert_eq!(u32::from_le_bytes(body[20..24].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(body[24..28].try_into().unwrap()), 6);
    }
}
