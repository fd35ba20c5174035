//! Decoder for the LZ image format, an LZ77 variant with pixel-sized
//! back references, an optional alpha-only second pass (XXXA) and
//! palette modes.
//!
//! Container header fields are big-endian; the compressed stream itself
//! is byte-oriented. Output is always a packed RGBA raster.

use image::RgbaImage;

use crate::error::SpiceError;

const LZ_MAGIC: &[u8; 4] = b"  ZL";

// ── Image type ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LzImageType {
    Plt1Le,
    Plt1Be,
    Plt4Le,
    Plt4Be,
    Plt8,
    Rgb16,
    Rgb24,
    Rgb32,
    Rgba,
    Xxxa,
}

impl LzImageType {
    fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(LzImageType::Plt1Le),
            2 => Some(LzImageType::Plt1Be),
            3 => Some(LzImageType::Plt4Le),
            4 => Some(LzImageType::Plt4Be),
            5 => Some(LzImageType::Plt8),
            6 => Some(LzImageType::Rgb16),
            7 => Some(LzImageType::Rgb24),
            8 => Some(LzImageType::Rgb32),
            9 => Some(LzImageType::Rgba),
            10 => Some(LzImageType::Xxxa),
            _ => None,
        }
    }

    fn is_palette(self) -> bool {
        matches!(
            self,
            LzImageType::Plt1Le
                | LzImageType::Plt1Be
                | LzImageType::Plt4Le
                | LzImageType::Plt4Be
                | LzImageType::Plt8
        )
    }
}

/// One palette entry, RGB.
#[derive(Debug, Clone, Copy)]
pub struct PaletteColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

// ── Container header ─────────────────────────────────────────────

struct LzHeader {
    typ: LzImageType,
    width: u32,
    height: u32,
    stride: u32,
    top_down: u32,
}

fn parse_header(buf: &[u8]) -> Result<LzHeader, SpiceError> {
    if buf.len() < 28 {
        return Err(SpiceError::Lz("not enough data for header".into()));
    }
    if &buf[..4] != LZ_MAGIC {
        return Err(SpiceError::Lz("invalid magic".into()));
    }

    let be32 = |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
    let typ = be32(8);
    let typ = LzImageType::from_wire(typ)
        .ok_or_else(|| SpiceError::Lz(format!("unknown image type {typ}")))?;

    Ok(LzHeader {
        typ,
        width: be32(12),
        height: be32(16),
        stride: be32(20),
        top_down: be32(24),
    })
}

// ── Byte cursor ──────────────────────────────────────────────────

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn next(&mut self) -> Result<u8, SpiceError> {
        let b = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| SpiceError::Lz("truncated stream".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ── Entry points ─────────────────────────────────────────────────

/// Decode a complete LZ image (header + stream) into a fresh raster.
pub fn decode(buf: &[u8]) -> Result<RgbaImage, SpiceError> {
    decode_with(buf, None)
}

/// Decode an XXXA container onto an existing raster, overwriting the
/// alpha plane and leaving the colour channels untouched. Used for
/// JPEG+alpha compositing; row reversal is left to the caller.
pub fn decode_alpha_onto(buf: &[u8], canvas: &mut RgbaImage) -> Result<(), SpiceError> {
    let hdr = parse_header(buf)?;
    if hdr.typ != LzImageType::Xxxa {
        return Err(SpiceError::Lz(format!(
            "expected alpha-only stream, got {:?}",
            hdr.typ
        )));
    }
    if (hdr.width, hdr.height) != canvas.dimensions() {
        return Err(SpiceError::Lz(format!(
            "alpha plane is {}x{}, canvas is {}x{}",
            hdr.width,
            hdr.height,
            canvas.width(),
            canvas.height()
        )));
    }
    let mut cur = ByteCursor { buf: &buf[28..], pos: 0 };
    decompress(&mut cur, canvas, LzImageType::Xxxa, false, None)
}

fn decode_with(buf: &[u8], palette: Option<&[PaletteColor]>) -> Result<RgbaImage, SpiceError> {
    let hdr = parse_header(buf)?;
    let LzHeader { typ, width, height, stride, top_down } = hdr;

    if width == 0 || height == 0 || stride < width * 4 {
        return Err(SpiceError::Lz(format!(
            "bad geometry {width}x{height} stride={stride}"
        )));
    }

    // the raster is built with the declared stride so back references
    // resolve exactly as the encoder saw them
    let mut pix = vec![0u8; stride as usize * height as usize];
    let mut cur = ByteCursor { buf: &buf[28..], pos: 0 };

    match typ {
        LzImageType::Rgb32 | LzImageType::Rgba => {
            let default_alpha = typ != LzImageType::Rgba;
            decompress(&mut cur, &mut pix, LzImageType::Rgb32, default_alpha, None)?;
            if typ == LzImageType::Rgba {
                // second pass carries the alpha plane
                decompress(&mut cur, &mut pix, LzImageType::Xxxa, false, None)?;
            }
        }
        LzImageType::Xxxa => {
            decompress(&mut cur, &mut pix, LzImageType::Xxxa, false, None)?;
        }
        t if t.is_palette() => {
            let palette =
                palette.ok_or_else(|| SpiceError::Lz("palette mode without palette".into()))?;
            decompress(&mut cur, &mut pix, t, true, Some(palette))?;
        }
        other => {
            return Err(SpiceError::Lz(format!("unsupported type {other:?}")));
        }
    }

    if cur.remaining() > 0 {
        tracing::warn!(
            left = cur.remaining(),
            "lz stream not fully consumed, data is being lost"
        );
    }

    if stride > width * 4 {
        // repack dense rows before handing the raster out
        let dense_stride = width as usize * 4;
        let mut dense = vec![0u8; dense_stride * height as usize];
        for row in 0..height as usize {
            let src = &pix[row * stride as usize..row * stride as usize + dense_stride];
            dense[row * dense_stride..(row + 1) * dense_stride].copy_from_slice(src);
        }
        pix = dense;
    }

    let mut img = RgbaImage::from_raw(width, height, pix)
        .ok_or_else(|| SpiceError::Lz("raster size overflow".into()))?;

    if top_down == 0 {
        reverse_rows(&mut img);
    }

    Ok(img)
}

/// Reverse the row order of a raster in place.
pub fn reverse_rows(img: &mut RgbaImage) {
    let stride = img.width() as usize * 4;
    let height = img.height() as usize;
    let pix: &mut [u8] = img;
    for row in 0..height / 2 {
        let other = height - row - 1;
        let (a, b) = pix.split_at_mut(other * stride);
        a[row * stride..row * stride + stride].swap_with_slice(&mut b[..stride]);
    }
}

// ── Core decompressor ────────────────────────────────────────────

/// Decode one LZ pass into `out` (packed RGBA, 4 bytes per pixel).
///
/// In XXXA mode only the alpha byte of each pixel is written;
/// `default_alpha` forces alpha opaque on literal colour writes.
fn decompress(
    cur: &mut ByteCursor<'_>,
    out: &mut [u8],
    typ: LzImageType,
    default_alpha: bool,
    palette: Option<&[PaletteColor]>,
) -> Result<(), SpiceError> {
    let out_len = (out.len() / 4) as u32;
    let mut op: u32 = 0; // output position, in pixels

    while op < out_len {
        let ctrl = cur.next()?;

        if ctrl >= 0x20 {
            // back reference
            let reference = op;
            let mut len = (ctrl >> 5) as u32 - 1;
            let mut ofs = ((ctrl & 0x1f) as u32) << 8;

            if len == 7 - 1 {
                // maximum length prefix: continuation bytes follow
                loop {
                    let code = cur.next()?;
                    len += code as u32;
                    if code != 0xff {
                        break;
                    }
                }
            }
            ofs += cur.next()? as u32;
            if ofs == 0x1fff {
                // escape: two more bytes, big-endian
                ofs += (cur.next()? as u32) << 8;
                ofs += cur.next()? as u32;
            }
            len += 1;
            if typ == LzImageType::Xxxa || palette.is_some() {
                len += 2;
            }
            ofs += 1;

            // palette streams count in palette cells, not pixels
            match typ {
                LzImageType::Plt4Le | LzImageType::Plt4Be => {
                    ofs *= 2;
                    len *= 2;
                }
                LzImageType::Plt1Le | LzImageType::Plt1Be => {
                    ofs *= 8;
                    len *= 8;
                }
                _ => {}
            }

            if ofs > reference {
                return Err(SpiceError::Lz(format!(
                    "back reference before start of data ({reference} - {ofs})"
                )));
            }
            if op + len > out_len {
                return Err(SpiceError::Lz("back reference past end of output".into()));
            }
            let mut reference = reference - ofs;

            if reference == op - 1 {
                // replicate the previous pixel
                let b = reference as usize;
                for _ in 0..len {
                    let op4 = op as usize * 4;
                    if typ == LzImageType::Xxxa {
                        out[op4 + 3] = out[b * 4 + 3];
                    } else {
                        out.copy_within(b * 4..b * 4 + 4, op4);
                    }
                    op += 1;
                }
            } else {
                for _ in 0..len {
                    let op4 = op as usize * 4;
                    let ref4 = reference as usize * 4;
                    if typ == LzImageType::Xxxa {
                        out[op4 + 3] = out[ref4 + 3];
                    } else {
                        out.copy_within(ref4..ref4 + 4, op4);
                    }
                    op += 1;
                    reference += 1;
                }
            }
        } else {
            // literal run of ctrl+1 pixels
            let count = ctrl as u32 + 1;
            if op + count > out_len {
                return Err(SpiceError::Lz("literal run past end of output".into()));
            }
            for _ in 0..count {
                let op4 = op as usize * 4;
                match typ {
                    LzImageType::Xxxa => {
                        out[op4 + 3] = cur.next()?;
                    }
                    LzImageType::Plt8 => {
                        let palette = palette.ok_or_else(|| {
                            SpiceError::Lz("palette mode without palette".into())
                        })?;
                        let idx = cur.next()? as usize;
                        let col = palette.get(idx).ok_or_else(|| {
                            SpiceError::Lz(format!("palette index {idx} out of range"))
                        })?;
                        out[op4] = col.r;
                        out[op4 + 1] = col.g;
                        out[op4 + 2] = col.b;
                        if default_alpha {
                            out[op4 + 3] = 0xff;
                        }
                    }
                    t if t.is_palette() => {
                        return Err(SpiceError::Lz(format!(
                            "palette literal not implemented for {t:?}"
                        )));
                    }
                    _ => {
                        // wire order is B, G, R
                        out[op4 + 2] = cur.next()?;
                        out[op4 + 1] = cur.next()?;
                        out[op4] = cur.next()?;
                        if default_alpha {
                            out[op4 + 3] = 0xff;
                        }
                    }
                }
                op += 1;
            }
        }
    }

    Ok(())
}
