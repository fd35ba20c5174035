//! Image payload decoding: the 18-byte descriptor plus a type-tagged
//! body, dispatched to the bitmap, QUIC, LZ or JPEG decoders.
//!
//! All decoders are pure functions from a byte slice to an RGBA raster;
//! a failed decode skips the draw but never kills the channel.

pub mod bitmap;
pub mod lz;
pub mod quic;

use image::RgbaImage;

use crate::error::SpiceError;
use crate::primitives::WireReader;

// image descriptor type codes
pub const IMAGE_TYPE_BITMAP: u8 = 0;
pub const IMAGE_TYPE_QUIC: u8 = 1;
pub const IMAGE_TYPE_LZ_PLT: u8 = 100;
pub const IMAGE_TYPE_LZ_RGB: u8 = 101;
pub const IMAGE_TYPE_GLZ_RGB: u8 = 102;
pub const IMAGE_TYPE_FROM_CACHE: u8 = 103;
pub const IMAGE_TYPE_SURFACE: u8 = 104;
pub const IMAGE_TYPE_JPEG: u8 = 105;
pub const IMAGE_TYPE_JPEG_ALPHA: u8 = 108;
pub const IMAGE_TYPE_LZ4: u8 = 109;

// descriptor flag bits
pub const IMAGE_FLAG_CACHE_ME: u8 = 1;
pub const IMAGE_FLAG_HIGH_BITS_SET: u8 = 2;
pub const IMAGE_FLAG_CACHE_REPLACE_ME: u8 = 4;

/// A decoded image: the wire descriptor plus the RGBA raster.
#[derive(Debug)]
pub struct DecodedImage {
    pub id: u64,
    pub typ: u8,
    pub flags: u8,
    pub width: u32,
    pub height: u32,
    pub image: RgbaImage,
}

/// Decode an image from its 18-byte descriptor onward. `buf` is the
/// carrying message sliced at the image pointer; type-specific payloads
/// follow the descriptor.
pub fn decode_image(buf: &[u8]) -> Result<DecodedImage, SpiceError> {
    let mut r = WireReader::new(buf, "image descriptor");
    let id = r.u64()?;
    let typ = r.u8()?;
    let flags = r.u8()?;
    let width = r.u32()?;
    let height = r.u32()?;

    let body = &buf[18..];

    let image = match typ {
        IMAGE_TYPE_BITMAP => bitmap::decode(body)?,
        IMAGE_TYPE_QUIC => quic::decode(sized_body(body)?)?,
        IMAGE_TYPE_LZ_RGB => lz::decode(sized_body(body)?)?,
        IMAGE_TYPE_JPEG => decode_jpeg(sized_body(body)?)?,
        IMAGE_TYPE_JPEG_ALPHA => decode_jpeg_alpha(body)?,
        other => return Err(SpiceError::UnsupportedImageType(other)),
    };

    Ok(DecodedImage { id, typ, flags, width, height, image })
}

/// QUIC/LZ/JPEG bodies are prefixed with a 32-bit length.
fn sized_body(body: &[u8]) -> Result<&[u8], SpiceError> {
    let mut r = WireReader::new(body, "image body");
    let len = r.u32()? as usize;
    r.take(len)
}

fn decode_jpeg(data: &[u8]) -> Result<RgbaImage, SpiceError> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| SpiceError::Jpeg(e.to_string()))?;
    Ok(img.to_rgba8())
}

/// JPEG with an LZ-coded alpha plane appended: `flag:u8 jpeg_size:u32
/// data_size:u32 jpeg[jpeg_size] alpha[...]`. Bit 0 of the flag set
/// means top-down; clear means the composited raster is row-reversed.
fn decode_jpeg_alpha(body: &[u8]) -> Result<RgbaImage, SpiceError> {
    let mut r = WireReader::new(body, "jpeg_alpha image");
    let flag = r.u8()?;
    let jpeg_size = r.u32()? as usize;
    let data_size = r.u32()? as usize;

    if jpeg_size > data_size {
        return Err(SpiceError::Truncated("jpeg_alpha sizes"));
    }
    let data = r.take(data_size)?;

    let mut rgba = decode_jpeg(&data[..jpeg_size])?;
    lz::decode_alpha_onto(&data[jpeg_size..], &mut rgba)?;

    if flag & 1 == 0 {
        lz::reverse_rows(&mut rgba);
    }
    Ok(rgba)
}
