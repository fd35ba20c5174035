//! WebDAV (file transfer) channel handle.
//!
//! Only message routing lives here: the channel is connected when the
//! server announces it and raw frames are exchanged with whoever
//! registered as the transfer listener. WebDAV semantics are left to
//! the embedder.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::connection::{ChannelHandler, Connection};
use crate::error::SpiceError;

/// Callback receiving every raw frame of the file-transfer channel.
pub type WebdavListener = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

pub struct WebdavChannel {
    conn: Arc<Connection>,
    listener: Mutex<Option<WebdavListener>>,
}

impl WebdavChannel {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(WebdavChannel { conn, listener: Mutex::new(None) })
    }

    /// Route all incoming frames to `listener`, replacing any previous
    /// registration.
    pub fn set_listener(&self, listener: WebdavListener) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Send a raw frame on the transfer channel.
    pub async fn send(&self, typ: u16, payload: &[u8]) -> Result<(), SpiceError> {
        self.conn.send(typ, payload).await
    }
}

#[async_trait]
impl ChannelHandler for WebdavChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        match listener.as_ref() {
            Some(cb) => cb(typ, data),
            None => debug!(typ, len = data.len(), "webdav frame with no listener"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkSession;
    use crate::proto::Channel;

    #[tokio::test]
    async fn frames_reach_the_listener() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        std::mem::forget(server);
        let conn = Connection::new(Box::new(client), LinkSession::plain(Channel::Webdav, 0));
        let webdav = WebdavChannel::new(conn);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        webdav.set_listener(Box::new(move |typ, data| {
            sink.lock().unwrap().push((typ, data.to_vec()));
        }));

        webdav.handle(201, b"dav").await;
        assert_eq!(seen.lock().unwrap().as_slice(), &[(201u16, b"dav".to_vec())]);
    }
}
