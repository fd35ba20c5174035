//! Protocol constants and shared enums.
//!
//! Message ids live in the 100+ range per channel; ids below 100 are the
//! link-level control messages handled by [`crate::connection`].

use std::fmt;

// ── Link level ───────────────────────────────────────────────────

/// Fixed 4-byte token opening every link negotiation packet.
pub const SPICE_MAGIC: &[u8; 4] = b"REDQ";
pub const SPICE_VERSION_MAJOR: u32 = 2;
pub const SPICE_VERSION_MINOR: u32 = 2;

/// Size of the X.509 SubjectPublicKeyInfo slot in the link reply.
pub const SPICE_TICKET_PUBKEY_BYTES: usize = 162;

/// Hard bound on any message payload.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Common capability bit: both sides support the 6-byte mini header.
pub const SPICE_COMMON_CAP_MINI_HEADER: u32 = 0;

// server → client
pub const SPICE_MSG_MIGRATE: u16 = 1;
pub const SPICE_MSG_MIGRATE_DATA: u16 = 2;
pub const SPICE_MSG_SET_ACK: u16 = 3;
pub const SPICE_MSG_PING: u16 = 4;
pub const SPICE_MSG_WAIT_FOR_CHANNELS: u16 = 5;
pub const SPICE_MSG_DISCONNECTING: u16 = 6;
pub const SPICE_MSG_NOTIFY: u16 = 7;

// client → server
pub const SPICE_MSGC_ACK_SYNC: u16 = 1;
pub const SPICE_MSGC_ACK: u16 = 2;
pub const SPICE_MSGC_PONG: u16 = 3;
pub const SPICE_MSGC_DISCONNECTING: u16 = 6;

// ── Main channel ─────────────────────────────────────────────────

pub const SPICE_MSG_MAIN_MIGRATE_BEGIN: u16 = 101;
pub const SPICE_MSG_MAIN_MIGRATE_CANCEL: u16 = 102;
pub const SPICE_MSG_MAIN_INIT: u16 = 103;
pub const SPICE_MSG_MAIN_CHANNELS_LIST: u16 = 104;
pub const SPICE_MSG_MAIN_MOUSE_MODE: u16 = 105;
pub const SPICE_MSG_MAIN_MULTI_MEDIA_TIME: u16 = 106;
pub const SPICE_MSG_MAIN_AGENT_CONNECTED: u16 = 107;
pub const SPICE_MSG_MAIN_AGENT_DISCONNECTED: u16 = 108;
pub const SPICE_MSG_MAIN_AGENT_DATA: u16 = 109;
pub const SPICE_MSG_MAIN_AGENT_TOKEN: u16 = 110;

pub const SPICE_MSGC_MAIN_ATTACH_CHANNELS: u16 = 104;
pub const SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST: u16 = 105;
pub const SPICE_MSGC_MAIN_AGENT_START: u16 = 106;
pub const SPICE_MSGC_MAIN_AGENT_DATA: u16 = 107;
pub const SPICE_MSGC_MAIN_AGENT_TOKEN: u16 = 108;

pub const SPICE_MAIN_CAP_AGENT_CONNECTED_TOKENS: u32 = 2;

pub const SPICE_MOUSE_MODE_SERVER: u32 = 1;
pub const SPICE_MOUSE_MODE_CLIENT: u32 = 2;

// ── Display channel ──────────────────────────────────────────────

pub const SPICE_MSG_DISPLAY_MODE: u16 = 101;
pub const SPICE_MSG_DISPLAY_MARK: u16 = 102;
pub const SPICE_MSG_DISPLAY_RESET: u16 = 103;
pub const SPICE_MSG_DISPLAY_COPY_BITS: u16 = 104;
pub const SPICE_MSG_DISPLAY_INVAL_ALL_PALETTES: u16 = 108;
pub const SPICE_MSG_DISPLAY_STREAM_CREATE: u16 = 122;
pub const SPICE_MSG_DISPLAY_STREAM_DATA: u16 = 123;
pub const SPICE_MSG_DISPLAY_STREAM_DESTROY: u16 = 125;
pub const SPICE_MSG_DISPLAY_DRAW_FILL: u16 = 302;
pub const SPICE_MSG_DISPLAY_DRAW_COPY: u16 = 304;
pub const SPICE_MSG_DISPLAY_SURFACE_CREATE: u16 = 314;
pub const SPICE_MSG_DISPLAY_SURFACE_DESTROY: u16 = 315;
pub const SPICE_MSG_DISPLAY_MONITORS_CONFIG: u16 = 317;

pub const SPICE_MSGC_DISPLAY_INIT: u16 = 101;
pub const SPICE_MSGC_DISPLAY_PREFERRED_COMPRESSION: u16 = 103;
pub const SPICE_MSGC_DISPLAY_PREFERRED_VIDEO_CODEC_TYPE: u16 = 105;

pub const SPICE_DISPLAY_CAP_SIZED_STREAM: u32 = 0;
pub const SPICE_DISPLAY_CAP_MONITORS_CONFIG: u32 = 1;
pub const SPICE_DISPLAY_CAP_STREAM_REPORT: u32 = 4;
pub const SPICE_DISPLAY_CAP_LZ4_COMPRESSION: u32 = 5;
pub const SPICE_DISPLAY_CAP_PREF_COMPRESSION: u32 = 6;
pub const SPICE_DISPLAY_CAP_MULTI_CODEC: u32 = 8;

pub const SPICE_IMAGE_COMPRESSION_AUTO_LZ: u8 = 3;

// ── Cursor channel ───────────────────────────────────────────────

pub const SPICE_MSG_CURSOR_INIT: u16 = 101;
pub const SPICE_MSG_CURSOR_RESET: u16 = 102;
pub const SPICE_MSG_CURSOR_SET: u16 = 103;
pub const SPICE_MSG_CURSOR_MOVE: u16 = 104;
pub const SPICE_MSG_CURSOR_HIDE: u16 = 105;
pub const SPICE_MSG_CURSOR_INVAL_ALL: u16 = 108;

pub const SPICE_CURSOR_TYPE_ALPHA: u8 = 0;

// ── Inputs channel ───────────────────────────────────────────────

pub const SPICE_MSG_INPUTS_INIT: u16 = 101;
pub const SPICE_MSG_INPUTS_KEY_MODIFIERS: u16 = 102;
pub const SPICE_MSG_INPUTS_MOUSE_MOTION_ACK: u16 = 111;

pub const SPICE_MSGC_INPUTS_KEY_DOWN: u16 = 101;
pub const SPICE_MSGC_INPUTS_KEY_UP: u16 = 102;
pub const SPICE_MSGC_INPUTS_KEY_MODIFIERS: u16 = 103;
pub const SPICE_MSGC_INPUTS_MOUSE_POSITION: u16 = 112;
pub const SPICE_MSGC_INPUTS_MOUSE_PRESS: u16 = 113;
pub const SPICE_MSGC_INPUTS_MOUSE_RELEASE: u16 = 114;

// ── Playback / record channels ───────────────────────────────────

pub const SPICE_MSG_PLAYBACK_DATA: u16 = 101;
pub const SPICE_MSG_PLAYBACK_MODE: u16 = 102;
pub const SPICE_MSG_PLAYBACK_START: u16 = 103;
pub const SPICE_MSG_PLAYBACK_STOP: u16 = 104;
pub const SPICE_MSG_PLAYBACK_VOLUME: u16 = 105;
pub const SPICE_MSG_PLAYBACK_MUTE: u16 = 106;

pub const SPICE_AUDIO_DATA_MODE_RAW: u16 = 1;
pub const SPICE_AUDIO_DATA_MODE_OPUS: u16 = 3;

pub const SPICE_PLAYBACK_CAP_VOLUME: u32 = 1;
pub const SPICE_PLAYBACK_CAP_OPUS: u32 = 3;

pub const SPICE_MSG_RECORD_START: u16 = 101;
pub const SPICE_MSG_RECORD_STOP: u16 = 102;
pub const SPICE_MSG_RECORD_VOLUME: u16 = 103;
pub const SPICE_MSG_RECORD_MUTE: u16 = 104;

pub const SPICE_MSGC_RECORD_DATA: u16 = 101;
pub const SPICE_MSGC_RECORD_MODE: u16 = 102;
pub const SPICE_MSGC_RECORD_START_MARK: u16 = 103;

pub const SPICE_RECORD_CAP_VOLUME: u32 = 1;
pub const SPICE_RECORD_CAP_OPUS: u32 = 2;

// ── Channel kinds ────────────────────────────────────────────────

/// Logical channel kinds multiplexed over separate TCP streams.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Main = 1,
    Display = 2,
    Inputs = 3,
    Cursor = 4,
    Playback = 5,
    Record = 6,
    Tunnel = 7,
    Smartcard = 8,
    UsbRedir = 9,
    Port = 10,
    Webdav = 11,
}

/// A channel kind as announced by the server; unknown values are kept
/// so they can be reported instead of silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Known(Channel),
    Unknown(u8),
}

impl From<u8> for ChannelKind {
    fn from(value: u8) -> Self {
        match value {
            1 => ChannelKind::Known(Channel::Main),
            2 => ChannelKind::Known(Channel::Display),
            3 => ChannelKind::Known(Channel::Inputs),
            4 => ChannelKind::Known(Channel::Cursor),
            5 => ChannelKind::Known(Channel::Playback),
            6 => ChannelKind::Known(Channel::Record),
            7 => ChannelKind::Known(Channel::Tunnel),
            8 => ChannelKind::Known(Channel::Smartcard),
            9 => ChannelKind::Known(Channel::UsbRedir),
            10 => ChannelKind::Known(Channel::Port),
            11 => ChannelKind::Known(Channel::Webdav),
            n => ChannelKind::Unknown(n),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Main => "Main",
            Channel::Display => "Display",
            Channel::Inputs => "Inputs",
            Channel::Cursor => "Cursor",
            Channel::Playback => "Playback",
            Channel::Record => "Record",
            Channel::Tunnel => "Tunnel",
            Channel::Smartcard => "Smartcard",
            Channel::UsbRedir => "UsbRedir",
            Channel::Port => "Port",
            Channel::Webdav => "Webdav",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Known(c) => write!(f, "{c}"),
            ChannelKind::Unknown(n) => write!(f, "Channel#{n}"),
        }
    }
}

// ── Drawing ──────────────────────────────────────────────────────

/// Raster operation descriptor carried by draw messages. Only PUT is
/// acted upon; the rest are decoded for logging.
pub type Ropd = u16;

/// Scale mode carried by DRAW_COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageScaleMode {
    Interpolate,
    Nearest,
    Unknown(u8),
}

impl From<u8> for ImageScaleMode {
    fn from(value: u8) -> Self {
        match value {
            0 => ImageScaleMode::Interpolate,
            1 => ImageScaleMode::Nearest,
            n => ImageScaleMode::Unknown(n),
        }
    }
}
