//! Per-channel framed connection: ordered message delivery, windowed
//! acknowledgement, ping/pong, notify, sub-list carving.
//!
//! Exactly one reader task consumes each socket; writes may come from
//! many producers and are serialized behind an async mutex. Link-level
//! control messages are intercepted here, everything else is forwarded
//! to the channel-specific handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SpiceError;
use crate::link::LinkSession;
use crate::proto::{
    MAX_MESSAGE_SIZE, SPICE_MSGC_ACK, SPICE_MSGC_ACK_SYNC, SPICE_MSGC_PONG,
    SPICE_MSG_DISCONNECTING, SPICE_MSG_NOTIFY, SPICE_MSG_PING, SPICE_MSG_SET_ACK,
    SPICE_MSG_WAIT_FOR_CHANNELS,
};

/// Object-safe alias for the transport under a connection.
pub trait SpiceStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SpiceStream for T {}

pub type BoxedStream = Box<dyn SpiceStream>;

/// Per-channel message callback. Invoked strictly sequentially, in
/// wire order, from the channel's reader task.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, typ: u16, data: &[u8]);
}

#[derive(Default)]
struct AckWindow {
    window: u32,
    pos: u32,
}

/// A framed connection to one channel.
pub struct Connection {
    session: LinkSession,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    serial: AtomicU64,
    ack: Mutex<AckWindow>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap a stream whose handshake already completed.
    pub fn new(stream: BoxedStream, session: LinkSession) -> Arc<Self> {
        let (rd, wr) = tokio::io::split(stream);
        Arc::new(Connection {
            session,
            writer: tokio::sync::Mutex::new(wr),
            reader: Mutex::new(Some(rd)),
            serial: AtomicU64::new(0),
            ack: Mutex::new(AckWindow::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    /// Negotiated channel caps intersected with what we requested.
    pub fn valid_caps(&self) -> &[u32] {
        &self.session.valid_caps
    }

    /// `"Kind[id]"`, for log context.
    pub fn label(&self) -> String {
        format!("{}[{}]", self.session.kind, self.session.id)
    }

    /// Stop the reader task. The socket closes once all handles drop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    // ── Write path ───────────────────────────────────────────────

    /// Send one message. Writes are serialized; in full-header mode the
    /// serial is drawn atomically.
    pub async fn send(&self, typ: u16, payload: &[u8]) -> Result<(), SpiceError> {
        let mut wr = self.writer.lock().await;

        if self.session.mini_headers {
            let mut hdr = [0u8; 6];
            hdr[0..2].copy_from_slice(&typ.to_le_bytes());
            hdr[2..6].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            wr.write_all(&hdr).await?;
        } else {
            let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
            let mut hdr = [0u8; 18];
            hdr[0..8].copy_from_slice(&serial.to_le_bytes());
            hdr[8..10].copy_from_slice(&typ.to_le_bytes());
            hdr[10..14].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            // the sub-list slot mirrors the payload length on the way out
            hdr[14..18].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            wr.write_all(&hdr).await?;
        }
        wr.write_all(payload).await?;
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────

    /// Spawn the reader task. The handler sees every non-control
    /// message; sub-list entries are delivered before their primary.
    pub fn spawn_reader(self: &Arc<Self>, handler: Arc<dyn ChannelHandler>) -> JoinHandle<()> {
        let rd = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut rd) = rd else {
            warn!(channel = %self.label(), "reader already taken");
            return tokio::spawn(async {});
        };

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = conn.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = conn.read_one(&mut rd, handler.as_ref()) => {
                        if let Err(e) = res {
                            warn!(channel = %conn.label(), error = %e, "read failed");
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn read_one(
        &self,
        rd: &mut ReadHalf<BoxedStream>,
        handler: &dyn ChannelHandler,
    ) -> Result<(), SpiceError> {
        let (typ, size, sub_list) = if self.session.mini_headers {
            let mut hdr = [0u8; 6];
            rd.read_exact(&mut hdr).await?;
            let typ = u16::from_le_bytes([hdr[0], hdr[1]]);
            let size = u32::from_le_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]);
            (typ, size, 0u32)
        } else {
            let mut hdr = [0u8; 18];
            rd.read_exact(&mut hdr).await?;
            let _serial = u64::from_le_bytes(hdr[0..8].try_into().unwrap_or_default());
            let typ = u16::from_le_bytes([hdr[8], hdr[9]]);
            let size = u32::from_le_bytes(hdr[10..14].try_into().unwrap_or_default());
            let sub_list = u32::from_le_bytes(hdr[14..18].try_into().unwrap_or_default());
            (typ, size, sub_list)
        };

        if size as usize > MAX_MESSAGE_SIZE {
            return Err(SpiceError::PayloadTooLarge {
                size: size as usize,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut payload = vec![0u8; size as usize];
        rd.read_exact(&mut payload).await?;

        if sub_list == 0 {
            return self.dispatch(typ, &payload, handler).await;
        }

        // carve sub-messages out of the same buffer, deliver them in
        // order, then the primary truncated to the sub-list offset
        let sub_list = sub_list as usize;
        let count_bytes = payload
            .get(sub_list..sub_list + 2)
            .ok_or(SpiceError::MalformedSubList)?;
        let sub_count = u16::from_le_bytes([count_bytes[0], count_bytes[1]]) as usize;

        for i in 0..sub_count {
            let off_pos = sub_list + 2 + i * 4;
            let off = payload
                .get(off_pos..off_pos + 4)
                .ok_or(SpiceError::MalformedSubList)?;
            let off = u32::from_le_bytes([off[0], off[1], off[2], off[3]]) as usize;

            let entry = payload
                .get(off..off + 6)
                .ok_or(SpiceError::MalformedSubList)?;
            let sub_typ = u16::from_le_bytes([entry[0], entry[1]]);
            let sub_size =
                u32::from_le_bytes([entry[2], entry[3], entry[4], entry[5]]) as usize;
            let sub_data = payload
                .get(off + 6..off + 6 + sub_size)
                .ok_or(SpiceError::MalformedSubList)?;

            self.dispatch(sub_typ, sub_data, handler).await?;
        }

        let primary = payload.get(..sub_list).ok_or(SpiceError::MalformedSubList)?;
        self.dispatch(typ, primary, handler).await
    }

    /// Count the message against the ack window, intercept link-level
    /// control messages, forward the rest.
    async fn dispatch(
        &self,
        typ: u16,
        data: &[u8],
        handler: &dyn ChannelHandler,
    ) -> Result<(), SpiceError> {
        let do_ack = {
            let mut ack = self.ack.lock().unwrap_or_else(|e| e.into_inner());
            if ack.window > 0 {
                ack.pos += 1;
                if ack.pos >= ack.window {
                    ack.pos = 0;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if do_ack {
            self.send(SPICE_MSGC_ACK, &[]).await?;
        }

        match typ {
            SPICE_MSG_SET_ACK => {
                if data.len() < 8 {
                    return Ok(());
                }
                let generation = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let window = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                {
                    let mut ack = self.ack.lock().unwrap_or_else(|e| e.into_inner());
                    ack.window = window;
                    ack.pos = 0;
                }
                debug!(
                    channel = %self.label(),
                    window, generation, "ack window set"
                );
                self.send(SPICE_MSGC_ACK_SYNC, &generation.to_le_bytes()).await?;
            }
            SPICE_MSG_PING => {
                let echo = if data.len() > 12 { &data[..12] } else { data };
                self.send(SPICE_MSGC_PONG, echo).await?;
            }
            SPICE_MSG_NOTIFY => {
                self.log_notify(data);
            }
            SPICE_MSG_WAIT_FOR_CHANNELS => {
                debug!(channel = %self.label(), "WAIT_FOR_CHANNELS ignored");
            }
            SPICE_MSG_DISCONNECTING => {
                info!(channel = %self.label(), "server is disconnecting");
            }
            _ => handler.handle(typ, data).await,
        }
        Ok(())
    }

    fn log_notify(&self, data: &[u8]) {
        let mut r = crate::primitives::WireReader::new(data, "notify");
        let parsed: Result<_, SpiceError> = (|| {
            let ts = r.u64()?;
            let severity = r.u32()?;
            let visibility = r.u32()?;
            let what = r.u32()?;
            let len = r.u32()? as usize;
            let msg = r.take(len.min(r.remaining()))?;
            Ok((ts, severity, visibility, what, String::from_utf8_lossy(msg).into_owned()))
        })();

        match parsed {
            Ok((ts, severity, visibility, what, msg)) => {
                info!(
                    channel = %self.label(),
                    ts, severity, visibility, what, message = %msg,
                    "server notification"
                );
            }
            Err(_) => warn!(channel = %self.label(), "malformed NOTIFY message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Channel;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<(u16, Vec<u8>)>);

    #[async_trait]
    impl ChannelHandler for Recorder {
        async fn handle(&self, typ: u16, data: &[u8]) {
            let _ = self.0.send((typ, data.to_vec()));
        }
    }

    fn mini_frame(typ: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&typ.to_le_bytes());
        v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    async fn read_mini_frame(server: &mut tokio::io::DuplexStream) -> (u16, Vec<u8>) {
        let mut hdr = [0u8; 6];
        server.read_exact(&mut hdr).await.unwrap();
        let typ = u16::from_le_bytes([hdr[0], hdr[1]]);
        let size = u32::from_le_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]);
        let mut payload = vec![0u8; size as usize];
        server.read_exact(&mut payload).await.unwrap();
        (typ, payload)
    }

    fn test_conn(
        stream: tokio::io::DuplexStream,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<(u16, Vec<u8>)>) {
        let conn = Connection::new(Box::new(stream), LinkSession::plain(Channel::Main, 0));
        let (tx, rx) = mpsc::unbounded_channel();
        conn.spawn_reader(Arc::new(Recorder(tx)));
        (conn, rx)
    }

    #[tokio::test]
    async fn forwards_channel_messages() {
        let (client, mut server) = duplex(64 * 1024);
        let (_conn, mut rx) = test_conn(client);

        server.write_all(&mini_frame(101, b"hello")).await.unwrap();
        let (typ, data) = rx.recv().await.unwrap();
        assert_eq!(typ, 101);
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn ping_is_answered_with_first_12_bytes() {
        let (client, mut server) = duplex(64 * 1024);
        let (_conn, _rx) = test_conn(client);

        let payload: Vec<u8> = (0x00..0x10).collect();
        server
            .write_all(&mini_frame(SPICE_MSG_PING, &payload))
            .await
            .unwrap();

        let (typ, data) = read_mini_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_PONG);
        assert_eq!(data, (0x00..0x0c).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn set_ack_answers_sync_and_acks_every_window() {
        let (client, mut server) = duplex(64 * 1024);
        let (_conn, mut rx) = test_conn(client);

        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes()); // generation
        payload.extend_from_slice(&5u32.to_le_bytes()); // window
        server
            .write_all(&mini_frame(SPICE_MSG_SET_ACK, &payload))
            .await
            .unwrap();

        let (typ, data) = read_mini_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_ACK_SYNC);
        assert_eq!(data, 7u32.to_le_bytes());

        // five dispatched messages → exactly one ACK
        for _ in 0..5 {
            server.write_all(&mini_frame(200, &[])).await.unwrap();
        }
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }
        let (typ, data) = read_mini_frame(&mut server).await;
        assert_eq!(typ, SPICE_MSGC_ACK);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_kills_the_channel() {
        let (client, mut server) = duplex(64 * 1024);
        let (_conn, mut rx) = test_conn(client);

        let mut hdr = Vec::new();
        hdr.extend_from_slice(&200u16.to_le_bytes());
        hdr.extend_from_slice(&(11 * 1024 * 1024u32).to_le_bytes());
        server.write_all(&hdr).await.unwrap();

        assert!(rx.recv().await.is_none()); // reader terminated
    }

    #[tokio::test]
    async fn full_header_serial_increments() {
        let (client, mut server) = duplex(64 * 1024);
        let mut session = LinkSession::plain(Channel::Main, 0);
        session.mini_headers = false;
        let conn = Connection::new(Box::new(client), session);

        conn.send(42, b"abc").await.unwrap();
        conn.send(43, b"defg").await.unwrap();

        for (expect_serial, expect_typ, expect_payload) in
            [(1u64, 42u16, b"abc".to_vec()), (2, 43, b"defg".to_vec())]
        {
            let mut hdr = [0u8; 18];
            server.read_exact(&mut hdr).await.unwrap();
            let serial = u64::from_le_bytes(hdr[0..8].try_into().unwrap());
            let typ = u16::from_le_bytes([hdr[8], hdr[9]]);
            let size = u32::from_le_bytes(hdr[10..14].try_into().unwrap());
            let sub_list = u32::from_le_bytes(hdr[14..18].try_into().unwrap());
            assert_eq!(serial, expect_serial);
            assert_eq!(typ, expect_typ);
            assert_eq!(size as usize, expect_payload.len());
            assert_eq!(sub_list, size);
            let mut payload = vec![0u8; size as usize];
            server.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, expect_payload);
        }
    }

    #[tokio::test]
    async fn sub_list_delivers_entries_then_truncated_primary() {
        let (client, mut server) = duplex(64 * 1024);
        let mut session = LinkSession::plain(Channel::Main, 0);
        session.mini_headers = false;
        let conn = Connection::new(Box::new(client), session);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.spawn_reader(Arc::new(Recorder(tx)));

        // payload: primary body "PRIM", then two sub entries, then the
        // sub-list table (count + offsets)
        let mut payload = Vec::new();
        payload.extend_from_slice(b"PRIM");

        let sub1_off = payload.len() as u32;
        payload.extend_from_slice(&301u16.to_le_bytes());
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(b"ab");

        let sub2_off = payload.len() as u32;
        payload.extend_from_slice(&302u16.to_le_bytes());
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(b"xyz");

        let sub_list_off = payload.len() as u32;
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&sub1_off.to_le_bytes());
        payload.extend_from_slice(&sub2_off.to_le_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&1u64.to_le_bytes());
        frame.extend_from_slice(&300u16.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&sub_list_off.to_le_bytes());
        frame.extend_from_slice(&payload);
        server.write_all(&frame).await.unwrap();

        let (t1, d1) = rx.recv().await.unwrap();
        assert_eq!((t1, d1.as_slice()), (301, b"ab".as_slice()));
        let (t2, d2) = rx.recv().await.unwrap();
        assert_eq!((t2, d2.as_slice()), (302, b"xyz".as_slice()));
        let (t3, d3) = rx.recv().await.unwrap();
        assert_eq!(t3, 300);
        assert_eq!(&d3[..4], b"PRIM");
        assert_eq!(d3.len(), sub_list_off as usize);
    }

    #[tokio::test]
    async fn close_stops_the_reader() {
        let (client, _server) = duplex(64 * 1024);
        let (conn, mut rx) = test_conn(client);
        conn.close();
        assert!(rx.recv().await.is_none());
    }
}
