//! The agent bus: an asynchronous message stream multiplexed over the
//! main channel's AGENT_DATA messages, with token-based flow control in
//! both directions and chunked fragmentation at a 2048-byte MTU.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::SpiceError;
use crate::proto::SPICE_MSGC_MAIN_AGENT_DATA;

pub const VD_AGENT_PROTOCOL: u32 = 1;
/// Largest agent payload slice per carrier message.
pub const VD_AGENT_MAX_DATA_SIZE: usize = 2048;
/// Tokens granted to the server, re-topped whenever they run out.
pub const VD_AGENT_SERVER_TOKEN_AMOUNT: u32 = 10;

// agent message types
pub const VD_AGENT_MOUSE_STATE: u32 = 1;
pub const VD_AGENT_MONITORS_CONFIG: u32 = 2;
pub const VD_AGENT_REPLY: u32 = 3;
pub const VD_AGENT_CLIPBOARD: u32 = 4;
pub const VD_AGENT_DISPLAY_CONFIG: u32 = 5;
pub const VD_AGENT_ANNOUNCE_CAPABILITIES: u32 = 6;
pub const VD_AGENT_CLIPBOARD_GRAB: u32 = 7;
pub const VD_AGENT_CLIPBOARD_REQUEST: u32 = 8;
pub const VD_AGENT_CLIPBOARD_RELEASE: u32 = 9;
pub const VD_AGENT_GRAPHICS_DEVICE_INFO: u32 = 16;

// agent capability bits
pub const VD_AGENT_CAP_MONITORS_CONFIG: u32 = 1;
pub const VD_AGENT_CAP_CLIPBOARD_BY_DEMAND: u32 = 5;
pub const VD_AGENT_CAP_CLIPBOARD_SELECTION: u32 = 6;
pub const VD_AGENT_CAP_CLIPBOARD_GRAB_SERIAL: u32 = 17;

// ── Clipboard model ──────────────────────────────────────────────

/// Which selection a clipboard operation refers to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardSelection {
    Clipboard = 0,
    Primary = 1,
    Secondary = 2,
}

impl From<u8> for ClipboardSelection {
    fn from(value: u8) -> Self {
        match value {
            1 => ClipboardSelection::Primary,
            2 => ClipboardSelection::Secondary,
            _ => ClipboardSelection::Clipboard,
        }
    }
}

/// Clipboard data formats carried over the agent bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardFormat {
    None,
    Utf8Text,
    ImagePng,
    ImageBmp,
    ImageTiff,
    ImageJpg,
    Unknown(u32),
}

impl ClipboardFormat {
    pub fn to_wire(self) -> u32 {
        match self {
            ClipboardFormat::None => 0,
            ClipboardFormat::Utf8Text => 1,
            ClipboardFormat::ImagePng => 2,
            ClipboardFormat::ImageBmp => 3,
            ClipboardFormat::ImageTiff => 4,
            ClipboardFormat::ImageJpg => 5,
            ClipboardFormat::Unknown(n) => n,
        }
    }
}

impl From<u32> for ClipboardFormat {
    fn from(value: u32) -> Self {
        match value {
            0 => ClipboardFormat::None,
            1 => ClipboardFormat::Utf8Text,
            2 => ClipboardFormat::ImagePng,
            3 => ClipboardFormat::ImageBmp,
            4 => ClipboardFormat::ImageTiff,
            5 => ClipboardFormat::ImageJpg,
            n => ClipboardFormat::Unknown(n),
        }
    }
}

/// One clipboard response delivered to a waiting requester.
#[derive(Debug, Clone)]
pub struct ClipboardData {
    pub selection: ClipboardSelection,
    pub format: ClipboardFormat,
    pub data: Vec<u8>,
}

/// One monitor geometry for MONITORS_CONFIG.
#[derive(Debug, Clone, Copy, Default)]
pub struct Monitor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub x: u32,
    pub y: u32,
}

/// A fully reassembled inbound agent frame.
#[derive(Debug)]
pub struct AgentFrame {
    pub typ: u32,
    pub opaque: u64,
    pub body: Vec<u8>,
}

// ── Agent bus ────────────────────────────────────────────────────

pub struct AgentBus {
    conn: Arc<Connection>,
    /// Outbound frames (20-byte header included), drained FIFO.
    queue: Mutex<VecDeque<Vec<u8>>>,
    /// Server-granted send credits; one per carrier message.
    tokens: AtomicU32,
    /// Credits we granted the server.
    server_tokens: AtomicU32,
    /// Woken on new outbound work and on new tokens.
    wake: Notify,
    /// Partial inbound frame awaiting more carrier messages.
    rebuffer: Mutex<BytesMut>,
    /// Capability word announced by the peer agent.
    caps: AtomicU32,
    cancel: CancellationToken,
}

impl AgentBus {
    pub fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(AgentBus {
            conn,
            queue: Mutex::new(VecDeque::new()),
            tokens: AtomicU32::new(0),
            server_tokens: AtomicU32::new(VD_AGENT_SERVER_TOKEN_AMOUNT),
            wake: Notify::new(),
            rebuffer: Mutex::new(BytesMut::new()),
            caps: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        })
    }

    pub fn peer_caps(&self) -> u32 {
        self.caps.load(Ordering::SeqCst)
    }

    pub fn set_peer_caps(&self, caps: u32) {
        self.caps.store(caps, Ordering::SeqCst);
    }

    pub fn set_tokens(&self, amount: u32) {
        self.tokens.store(amount, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn add_tokens(&self, amount: u32) {
        self.tokens.fetch_add(amount, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Queue one agent message. The 20-byte header is prepended here;
    /// fragmentation happens at send time.
    pub fn write(&self, typ: u32, opaque: u64, body: &[u8]) {
        let mut frame = Vec::with_capacity(20 + body.len());
        frame.extend_from_slice(&VD_AGENT_PROTOCOL.to_le_bytes());
        frame.extend_from_slice(&typ.to_le_bytes());
        frame.extend_from_slice(&opaque.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);

        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(frame);
        self.wake.notify_one();
    }

    /// Drain the outbound queue. Each carrier message consumes one
    /// token; fragments of one logical frame are never interleaved
    /// with other frames.
    pub async fn run(self: Arc<Self>) {
        loop {
            let chunk = loop {
                if self.cancel.is_cancelled() {
                    return;
                }
                match self.try_take_chunk() {
                    Some(chunk) => break chunk,
                    None => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = self.wake.notified() => {}
                        }
                    }
                }
            };

            if let Err(e) = self.conn.send(SPICE_MSGC_MAIN_AGENT_DATA, &chunk).await {
                warn!(error = %e, "agent carrier send failed");
                return;
            }
        }
    }

    /// Pop at most one MTU-sized slice off the queue head, spending a
    /// token. `None` when there is no work or no credit.
    fn try_take_chunk(&self) -> Option<Vec<u8>> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let front = queue.front_mut()?;

        if self.tokens.load(Ordering::SeqCst) == 0 {
            return None;
        }
        self.tokens.fetch_sub(1, Ordering::SeqCst);

        if front.len() <= VD_AGENT_MAX_DATA_SIZE {
            return queue.pop_front();
        }
        let chunk = front[..VD_AGENT_MAX_DATA_SIZE].to_vec();
        front.drain(..VD_AGENT_MAX_DATA_SIZE);
        Some(chunk)
    }

    /// Process one inbound AGENT_DATA carrier: account the server's
    /// token spend, reassemble, and return every complete frame.
    pub async fn receive_carrier(&self, data: &[u8]) -> Result<Vec<AgentFrame>, SpiceError> {
        // one credit per carrier; re-top the server when it runs out
        if self.server_tokens.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("server token pool is empty, granting more");
            self.conn
                .send(
                    crate::proto::SPICE_MSGC_MAIN_AGENT_TOKEN,
                    &VD_AGENT_SERVER_TOKEN_AMOUNT.to_le_bytes(),
                )
                .await?;
            self.server_tokens
                .fetch_add(VD_AGENT_SERVER_TOKEN_AMOUNT, Ordering::SeqCst);
        }

        let mut buffered = self.rebuffer.lock().unwrap_or_else(|e| e.into_inner());
        buffered.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            if buffered.len() < 20 {
                break;
            }
            let protocol = u32::from_le_bytes(buffered[0..4].try_into().unwrap_or_default());
            let typ = u32::from_le_bytes(buffered[4..8].try_into().unwrap_or_default());
            let opaque = u64::from_le_bytes(buffered[8..16].try_into().unwrap_or_default());
            let size = u32::from_le_bytes(buffered[16..20].try_into().unwrap_or_default()) as usize;

            if protocol != VD_AGENT_PROTOCOL {
                warn!(protocol, "dropping agent data with unknown protocol");
                buffered.clear();
                break;
            }
            if buffered.len() < 20 + size {
                // wait for the next carrier message
                break;
            }

            let frame = buffered.split_to(20 + size);
            frames.push(AgentFrame {
                typ,
                opaque,
                body: frame[20..].to_vec(),
            });
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkSession;
    use crate::proto::{Channel, SPICE_MSGC_MAIN_AGENT_TOKEN};
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

    fn bus_over_pipe() -> (Arc<AgentBus>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let conn = Connection::new(Box::new(client), LinkSession::plain(Channel::Main, 0));
        let bus = AgentBus::new(conn);
        tokio::spawn(Arc::clone(&bus).run());
        (bus, server)
    }

    fn agent_frame(typ: u32, body: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&VD_AGENT_PROTOCOL.to_le_bytes());
        v.extend_from_slice(&typ.to_le_bytes());
        v.extend_from_slice(&0u64.to_le_bytes());
        v.extend_from_slice(&(body.len() as u32).to_le_bytes());
        v.extend_from_slice(body);
        v
    }

    /// A 3000-byte payload leaves as exactly two carriers: 2048 bytes
    /// (header inside the first) and 972 bytes, back to back.
    #[tokio::test]
    async fn large_payload_is_fragmented_at_the_mtu() {
        let (bus, mut server) = bus_over_pipe();
        bus.set_tokens(10);

        let body = vec![0xabu8; 3000];
        bus.write(VD_AGENT_MONITORS_CONFIG, 0, &body);

        let (typ, first) = read_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_MAIN_AGENT_DATA);
        assert_eq!(first.len(), 2048);
        assert_eq!(
            u32::from_le_bytes(first[16..20].try_into().unwrap()),
            3000
        );

        let (typ, second) = read_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_MAIN_AGENT_DATA);
        assert_eq!(second.len(), 972);
        assert!(second.iter().all(|&b| b == 0xab));
    }

    /// Nothing is sent while the server has granted no tokens.
    #[tokio::test]
    async fn sends_wait_for_tokens() {
        let (bus, mut server) = bus_over_pipe();

        bus.write(VD_AGENT_CLIPBOARD_RELEASE, 0, &[]);
        tokio::task::yield_now().await;

        let undelivered = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            read_frame(&mut server),
        )
        .await;
        assert!(undelivered.is_err(), "carrier sent without tokens");

        bus.add_tokens(1);
        let (typ, frame) = read_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_MAIN_AGENT_DATA);
        assert_eq!(frame.len(), 20);
    }

    /// A frame split across carriers reassembles to the unsplit result.
    #[tokio::test]
    async fn inbound_frames_are_reassembled() {
        let (bus, _server) = bus_over_pipe();

        let body: Vec<u8> = (0..=99).collect();
        let whole = agent_frame(VD_AGENT_CLIPBOARD, &body);

        for split in [1usize, 19, 20, 21, 50, whole.len() - 1] {
            let frames = bus.receive_carrier(&whole[..split]).await.unwrap();
            assert!(frames.is_empty(), "split at {split} dispatched early");
            let frames = bus.receive_carrier(&whole[split..]).await.unwrap();
            assert_eq!(frames.len(), 1, "split at {split}");
            assert_eq!(frames[0].typ, VD_AGENT_CLIPBOARD);
            assert_eq!(frames[0].body, body);
        }
    }

    #[tokio::test]
    async fn back_to_back_frames_in_one_carrier() {
        let (bus, _server) = bus_over_pipe();

        let mut carrier = agent_frame(VD_AGENT_CLIPBOARD_RELEASE, &[]);
        carrier.extend_from_slice(&agent_frame(VD_AGENT_CLIPBOARD_GRAB, &[1, 0, 0, 0]));

        let frames = bus.receive_carrier(&carrier).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].typ, VD_AGENT_CLIPBOARD_RELEASE);
        assert_eq!(frames[1].typ, VD_AGENT_CLIPBOARD_GRAB);
    }

    #[tokio::test]
    async fn unknown_protocol_is_dropped() {
        let (bus, _server) = bus_over_pipe();

        let mut carrier = agent_frame(VD_AGENT_CLIPBOARD, &[1, 2, 3]);
        carrier[0] = 9; // corrupt the protocol tag
        let frames = bus.receive_carrier(&carrier).await.unwrap();
        assert!(frames.is_empty());
    }

    /// The server starts with 10 credits; the 10th carrier triggers a
    /// fresh AGENT_TOKEN grant.
    #[tokio::test]
    async fn server_tokens_are_replenished() {
        let (bus, mut server) = bus_over_pipe();

        let frame = agent_frame(VD_AGENT_CLIPBOARD_RELEASE, &[]);
        for _ in 0..9 {
            bus.receive_carrier(&frame).await.unwrap();
        }
        bus.receive_carrier(&frame).await.unwrap();

        let (typ, payload) = read_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_MAIN_AGENT_TOKEN);
        assert_eq!(payload, VD_AGENT_SERVER_TOKEN_AMOUNT.to_le_bytes());
    }
}
