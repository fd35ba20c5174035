//! Display channel: surface lifecycle and the draw operations that
//! pull decoded images onto them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::client::{ClientInner, SharedImage};
use crate::connection::{ChannelHandler, Connection};
use crate::error::SpiceError;
use crate::image_codec::decode_image;
use crate::primitives::{DisplayBase, QMask, Rect, WireReader};
use crate::proto::{
    SPICE_IMAGE_COMPRESSION_AUTO_LZ, SPICE_MSGC_DISPLAY_INIT,
    SPICE_MSGC_DISPLAY_PREFERRED_COMPRESSION, SPICE_MSGC_DISPLAY_PREFERRED_VIDEO_CODEC_TYPE,
    SPICE_MSG_DISPLAY_DRAW_COPY, SPICE_MSG_DISPLAY_DRAW_FILL,
    SPICE_MSG_DISPLAY_INVAL_ALL_PALETTES, SPICE_MSG_DISPLAY_MARK,
    SPICE_MSG_DISPLAY_MONITORS_CONFIG, SPICE_MSG_DISPLAY_SURFACE_CREATE,
    SPICE_MSG_DISPLAY_SURFACE_DESTROY,
};

// surface format tags for 32-bit rasters
const SURFACE_FMT_32_XRGB: u32 = 32;
const SURFACE_FMT_32_ARGB: u32 = 96;

pub struct DisplayChannel {
    client: Arc<ClientInner>,
    conn: Arc<Connection>,
    surfaces: Mutex<HashMap<u32, SharedImage>>,
}

impl DisplayChannel {
    pub(crate) fn new(client: Arc<ClientInner>, conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(DisplayChannel {
            client,
            conn,
            surfaces: Mutex::new(HashMap::new()),
        })
    }

    /// Fire-and-forget channel initialization: enable caches, prefer
    /// LZ compression, advertise video codec preferences.
    pub(crate) async fn announce_preferences(&self) -> Result<(), SpiceError> {
        self.conn.send(SPICE_MSGC_DISPLAY_INIT, &[0u8; 14]).await?;
        self.conn
            .send(
                SPICE_MSGC_DISPLAY_PREFERRED_COMPRESSION,
                &[SPICE_IMAGE_COMPRESSION_AUTO_LZ],
            )
            .await?;
        // 1=MJPEG 2=VP8 3=H264 4=VP9 5=H265
        self.conn
            .send(SPICE_MSGC_DISPLAY_PREFERRED_VIDEO_CODEC_TYPE, &[2, 1, 2])
            .await
    }

    fn surface(&self, id: u32) -> Option<SharedImage> {
        self.surfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn create_surface(&self, id: u32, width: u32, height: u32, format: u32) {
        match format {
            SURFACE_FMT_32_XRGB | SURFACE_FMT_32_ARGB => {
                // opaque black
                let img = RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 0xff]));
                self.surfaces
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, Arc::new(RwLock::new(img)));
            }
            other => warn!(format = other, "unsupported surface format"),
        }
    }

    fn handle_draw_fill(&self, data: &[u8]) -> Result<(), SpiceError> {
        let mut r = WireReader::new(data, "draw fill");
        let base = DisplayBase::decode(&mut r)?;

        let brush_type = r.u8()?;
        let color = match brush_type {
            0 => return Ok(()), // NONE
            1 => r.u32()?,      // SOLID
            2 => {
                debug!("pattern draw_fill not implemented");
                return Ok(());
            }
            other => {
                warn!(brush = other, "unknown brush type");
                return Ok(());
            }
        };
        let _ropd = r.u16()?;
        let _mask = QMask::decode(&mut r)?;

        let Some(surface) = self.surface(base.surface) else {
            warn!(surface = base.surface, "draw_fill on unknown surface");
            return Ok(());
        };

        // the 32-bit little-endian brush is applied byte-for-byte as
        // R,G,B,A; some servers emit B,G,R,A instead — kept as the wire
        // delivers it
        let px = image::Rgba(color.to_le_bytes());
        {
            let mut img = surface.write().unwrap_or_else(|e| e.into_inner());
            let (w, h) = img.dimensions();
            let x0 = base.boxx.left.min(w);
            let x1 = base.boxx.right.min(w);
            let y0 = base.boxx.top.min(h);
            let y1 = base.boxx.bottom.min(h);
            for y in y0..y1 {
                for x in x0..x1 {
                    img.put_pixel(x, y, px);
                }
            }
        }

        self.client.driver.display_refresh();
        Ok(())
    }

    fn handle_draw_copy(&self, data: &[u8]) -> Result<(), SpiceError> {
        let mut r = WireReader::new(data, "draw copy");
        let base = DisplayBase::decode(&mut r)?;

        let image_ptr = r.u32()? as usize;
        let _src_area = Rect::decode(&mut r)?;
        let _ropd = r.u16()?;
        let _scale_mode = r.u8()?;
        let _mask = QMask::decode(&mut r)?;

        let image_buf = data
            .get(image_ptr..)
            .ok_or(SpiceError::Truncated("draw copy image pointer"))?;
        let decoded = decode_image(image_buf)?;

        let Some(surface) = self.surface(base.surface) else {
            warn!(surface = base.surface, "draw_copy on unknown surface");
            return Ok(());
        };

        {
            let mut img = surface.write().unwrap_or_else(|e| e.into_inner());
            blit_over(&mut img, &decoded.image, &base.boxx);
        }

        self.client.driver.display_refresh();
        Ok(())
    }

    fn handle_monitors_config(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let count = u16::from_le_bytes([data[0], data[1]]) as usize;
        let max = u16::from_le_bytes([data[2], data[3]]);
        if data.len() < 4 + count * 28 {
            return;
        }

        info!(count, max, "monitors configuration");
        for i in 0..count {
            let head = &data[4 + i * 28..4 + (i + 1) * 28];
            let mut r = WireReader::new(head, "monitor head");
            if let (Ok(id), Ok(surface), Ok(w), Ok(h), Ok(x), Ok(y), Ok(flags)) = (
                r.u32(),
                r.u32(),
                r.u32(),
                r.u32(),
                r.u32(),
                r.u32(),
                r.u32(),
            ) {
                info!(
                    monitor = id,
                    surface, w, h, x, y, flags, "monitor head announced"
                );
            }
        }
    }
}

/// Composite `src` over the surface at the box origin (source-over,
/// premultiplied convention), clipped to both rasters.
fn blit_over(dst: &mut RgbaImage, src: &RgbaImage, boxx: &Rect) {
    let (dw, dh) = dst.dimensions();
    let w = boxx.width().min(src.width());
    let h = boxx.height().min(src.height());

    for y in 0..h {
        let dy = boxx.top + y;
        if dy >= dh {
            break;
        }
        for x in 0..w {
            let dx = boxx.left + x;
            if dx >= dw {
                break;
            }
            let s = src.get_pixel(x, y).0;
            if s[3] == 0xff {
                dst.put_pixel(dx, dy, image::Rgba(s));
                continue;
            }
            let d = dst.get_pixel(dx, dy).0;
            let inv = 255 - s[3] as u32;
            let blend = |sc: u8, dc: u8| -> u8 {
                (sc as u32 + dc as u32 * inv / 255).min(255) as u8
            };
            dst.put_pixel(
                dx,
                dy,
                image::Rgba([
                    blend(s[0], d[0]),
                    blend(s[1], d[1]),
                    blend(s[2], d[2]),
                    blend(s[3], d[3]),
                ]),
            );
        }
    }
}

#[async_trait]
impl ChannelHandler for DisplayChannel {
    async fn handle(&self, typ: u16, data: &[u8]) {
        match typ {
            SPICE_MSG_DISPLAY_MARK => {
                info!("display mark, handing the primary surface over");
                match self.surface(0) {
                    Some(primary) => self.client.driver.display_init(primary),
                    None => warn!("MARK before the primary surface exists"),
                }
            }
            SPICE_MSG_DISPLAY_SURFACE_CREATE => {
                let mut r = WireReader::new(data, "surface create");
                let parsed: Result<_, SpiceError> = (|| {
                    Ok((r.u32()?, r.u32()?, r.u32()?, r.u32()?, r.u32()?))
                })();
                let Ok((id, width, height, format, flags)) = parsed else {
                    warn!("surface create message too short");
                    return;
                };
                info!(id, width, height, format, flags, "surface create");
                self.create_surface(id, width, height, format);
            }
            SPICE_MSG_DISPLAY_SURFACE_DESTROY => {
                let mut r = WireReader::new(data, "surface destroy");
                if let Ok(id) = r.u32() {
                    debug!(id, "surface destroy");
                    self.surfaces
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                }
            }
            SPICE_MSG_DISPLAY_DRAW_FILL => {
                if let Err(e) = self.handle_draw_fill(data) {
                    warn!(error = %e, "draw_fill skipped");
                }
            }
            SPICE_MSG_DISPLAY_DRAW_COPY => {
                if let Err(e) = self.handle_draw_copy(data) {
                    warn!(error = %e, "draw_copy skipped");
                }
            }
            SPICE_MSG_DISPLAY_MONITORS_CONFIG => self.handle_monitors_config(data),
            SPICE_MSG_DISPLAY_INVAL_ALL_PALETTES => {
                debug!("invalidate all palettes ignored, no palette cache");
            }
            other => debug!(typ = other, "unhandled display message"),
        }
    }
}
