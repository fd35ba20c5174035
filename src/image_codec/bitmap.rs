//! Raw bitmap image payloads.

use image::RgbaImage;

use crate::error::SpiceError;
use crate::primitives::WireReader;

use super::lz::reverse_rows;

// bitmap pixel formats
pub const BITMAP_FMT_32BIT: u8 = 8;
pub const BITMAP_FMT_RGBA: u8 = 9;

// flag bits
const FLAG_PAL_CACHE_ME: u8 = 1;
const FLAG_PAL_FROM_CACHE: u8 = 2;
const FLAG_TOP_DOWN: u8 = 4;

/// Decode a bitmap image payload (the bytes following the 18-byte
/// image descriptor).
///
/// The 32BIT format is treated as xRGB: the padding byte is forced
/// opaque. RGBA is taken literally.
pub fn decode(data: &[u8]) -> Result<RgbaImage, SpiceError> {
    let mut r = WireReader::new(data, "bitmap image");

    let format = r.u8()?;
    let flags = r.u8()?;
    let width = r.u32()?;
    let height = r.u32()?;
    let stride = r.u32()?;

    if flags & FLAG_PAL_FROM_CACHE != 0 {
        let _palette_id = r.u64()?;
    } else {
        let _palette_ptr = r.u32()?;
    }
    let _ = FLAG_PAL_CACHE_ME;

    match format {
        BITMAP_FMT_32BIT | BITMAP_FMT_RGBA => {
            if width == 0 || height == 0 || stride < width * 4 {
                return Err(SpiceError::Truncated("bitmap geometry"));
            }
            let len = height as usize * stride as usize;
            let rect = r.take(len)?;

            let dense_stride = width as usize * 4;
            let mut pix = vec![0u8; dense_stride * height as usize];
            for row in 0..height as usize {
                pix[row * dense_stride..(row + 1) * dense_stride]
                    .copy_from_slice(&rect[row * stride as usize..][..dense_stride]);
            }

            if format == BITMAP_FMT_32BIT {
                for px in pix.chunks_exact_mut(4) {
                    px[3] = 0xff;
                }
            }

            let mut img = RgbaImage::from_raw(width, height, pix)
                .ok_or(SpiceError::Truncated("bitmap raster"))?;

            if flags & FLAG_TOP_DOWN == 0 {
                reverse_rows(&mut img);
            }
            Ok(img)
        }
        other => Err(SpiceError::UnsupportedBitmapFormat(other)),
    }
}
