//! Cursor channel: cursor shape and visibility updates.

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbaImage;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::connection::{ChannelHandler, Connection};
use crate::error::SpiceError;
use crate::primitives::WireReader;
use crate::proto::{
    SPICE_CURSOR_TYPE_ALPHA, SPICE_MSG_CURSOR_HIDE, SPICE_MSG_CURSOR_INIT,
    SPICE_MSG_CURSOR_INVAL_ALL, SPICE_MSG_CURSOR_MOVE, SPICE_MSG_CURSOR_RESET,
    SPICE_MSG_CURSOR_SET,
};

// cursor descriptor flag bits: 1=NONE, 2=CACHE_ME, 4=FROM_CACHE
const CURSOR_FLAG_NONE: u16 = 1;

pub struct CursorChannel {
    client: Arc<ClientInner>,
    #[allow(dead_code)]
    conn: Arc<Connection>,
}

struct CursorInfo {
    image: RgbaImage,
    hot_x: u16,
    hot_y: u16,
}

impl CursorChannel {
    pub(crate) fn new(client: Arc<ClientInner>, conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(CursorChannel { client, conn })
    }

    fn set_visible_cursor(&self, data: &[u8]) {
        match decode_cursor(data) {
            Ok(Some(cur)) => {
                self.client
                    .driver
                    .set_cursor(Some(cur.image), cur.hot_x, cur.hot_y);
            }
            Ok(None) => self.client.driver.set_cursor(None, 0, 0),
            Err(e) => warn!(error = %e, "failed to decode cursor"),
        }
    }

    fn set_blank_cursor(&self) {
        self.client
            .driver
            .set_cursor(Some(RgbaImage::new(16, 16)), 0, 0);
    }
}

#[async_trait]
impl ChannelHandler for CursorChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        match typ {
            SPICE_MSG_CURSOR_INIT => {
                // position, trail, visibility, then the cursor descriptor
                if data.len() < 11 {
                    return;
                }
                let visible = data[8];
                debug!(visible, "cursor init");
                if visible == 0 {
                    self.set_blank_cursor();
                    return;
                }
                self.set_visible_cursor(&data[9..]);
            }
            SPICE_MSG_CURSOR_SET => {
                if data.len() < 7 {
                    return;
                }
                let visible = data[4];
                if visible == 0 {
                    self.set_blank_cursor();
                    return;
                }
                self.set_visible_cursor(&data[5..]);
            }
            SPICE_MSG_CURSOR_RESET | SPICE_MSG_CURSOR_HIDE => {
                self.client.driver.set_cursor(None, 0, 0);
            }
            SPICE_MSG_CURSOR_MOVE => {}
            SPICE_MSG_CURSOR_INVAL_ALL => {
                // no cursor cache is kept
            }
            other => debug!(typ = other, "unhandled cursor message"),
        }
    }
}

/// Decode an inline cursor descriptor. Returns `None` for the NONE
/// flag and for cursor types this client does not render.
fn decode_cursor(data: &[u8]) -> Result<Option<CursorInfo>, SpiceError> {
    let mut r = WireReader::new(data, "cursor");
    let flags = r.u16()?;
    if flags & CURSOR_FLAG_NONE != 0 {
        return Ok(None);
    }

    let _unique = r.u64()?;
    let typ = r.u8()?;
    let width = r.u16()?;
    let height = r.u16()?;
    let hot_x = r.u16()?;
    let hot_y = r.u16()?;

    if typ != SPICE_CURSOR_TYPE_ALPHA {
        debug!(typ, "unsupported cursor type");
        return Ok(None);
    }

    let len = width as usize * height as usize * 4;
    let raw = r.take(len)?;

    // the wire carries BGRA, swap into RGBA
    let mut pix = raw.to_vec();
    for px in pix.chunks_exact_mut(4) {
        px.swap(0, 2);
    }

    let image = RgbaImage::from_raw(width as u32, height as u32, pix)
        .ok_or(SpiceError::Truncated("cursor raster"))?;
    Ok(Some(CursorInfo { image, hot_x, hot_y }))
}
