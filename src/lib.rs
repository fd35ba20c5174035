//! Client implementation of the SPICE remote desktop protocol, as used
//! by QEMU/libvirt virtual machines.
//!
//! The crate establishes one TCP stream per logical channel, performs
//! the link handshake and RSA-OAEP ticket authentication, then runs a
//! reader task per channel. Display updates are decoded (raw bitmap,
//! QUIC, LZ, JPEG) into RGBA surfaces handed to the embedding
//! [`Driver`]; input, clipboard, monitor configuration and audio flow
//! through the same session.
//!
//! The embedder supplies three collaborators: a [`Connector`] that
//! dials the server, a [`Driver`] that owns the screen/input/clipboard,
//! and optionally a [`sound::SoundDriver`] for audio.

mod agent;
mod caps;
mod client;
mod connection;
mod cursor;
mod display;
mod error;
pub mod image_codec;
mod inputs;
mod link;
mod main_channel;
mod playback;
mod primitives;
pub mod proto;
mod record;
pub mod sound;
mod timebuffer;
mod webdav;

pub use agent::{ClipboardData, ClipboardFormat, ClipboardSelection, Monitor};
pub use client::{Client, ClientInner, Connector, Driver, MediaClock, SharedImage};
pub use connection::{BoxedStream, ChannelHandler, Connection, SpiceStream};
pub use cursor::CursorChannel;
pub use display::DisplayChannel;
pub use error::{LinkError, SoundError, SpiceError};
pub use inputs::InputsChannel;
pub use link::{handshake, LinkSession};
pub use main_channel::{ChannelInfo, MainChannel};
pub use playback::PlaybackChannel;
pub use proto::{Channel, ChannelKind};
pub use record::RecordChannel;
pub use webdav::{WebdavChannel, WebdavListener};
