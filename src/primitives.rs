//! Wire primitives shared by the drawing messages.
//!
//! All fields are little-endian. [`WireReader`] is a bounds-checked
//! cursor over a message payload; running past the end yields a
//! [`SpiceError::Truncated`] instead of a panic.

use crate::error::SpiceError;

/// Bounds-checked little-endian reader over a message payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Name used in truncation errors.
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], SpiceError> {
        if self.remaining() < n {
            return Err(SpiceError::Truncated(self.what));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, SpiceError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, SpiceError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, SpiceError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, SpiceError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

// ── Geometry ─────────────────────────────────────────────────────

/// A rectangle in surface coordinates, wire order top/left/bottom/right.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl Rect {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            top: r.u32()?,
            left: r.u32()?,
            bottom: r.u32()?,
            right: r.u32()?,
        })
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, SpiceError> {
        Ok(Self { x: r.u32()?, y: r.u32()? })
    }
}

// ── QMask ────────────────────────────────────────────────────────

/// Quad mask attached to draw operations. The image pointer is an
/// offset into the carrying message; the mask itself is not applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct QMask {
    /// Bit 0: inverse.
    pub flags: u8,
    pub pos: Point,
    pub image_ptr: u32,
}

impl QMask {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, SpiceError> {
        Ok(Self {
            flags: r.u8()?,
            pos: Point::decode(r)?,
            image_ptr: r.u32()?,
        })
    }
}

// ── DisplayBase ──────────────────────────────────────────────────

/// Common prefix of every draw message: target surface, bounding box
/// and clip description.
#[derive(Debug, Clone, Default)]
pub struct DisplayBase {
    pub surface: u32,
    pub boxx: Rect,
    pub clip_rects: Vec<Rect>,
}

impl DisplayBase {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, SpiceError> {
        let surface = r.u32()?;
        let boxx = Rect::decode(r)?;
        let clip_type = r.u8()?;

        let clip_rects = match clip_type {
            0 => Vec::new(),
            1 => {
                let n = r.u32()?;
                let mut rects = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    rects.push(Rect::decode(r)?);
                }
                rects
            }
            _ => return Err(SpiceError::Truncated("display base clip")),
        };

        Ok(Self { surface, boxx, clip_rects })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    #[test]
    fn wire_reader_truncation() {
        let mut r = WireReader::new(&[1, 2, 3], "test");
        assert_eq!(r.u16().unwrap(), 0x0201);
        assert!(matches!(r.u32(), Err(SpiceError::Truncated("test"))));
    }

    #[test]
    fn display_base_no_clip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&le32(0)); // surface
        for v in [10u32, 20, 30, 40] {
            buf.extend_from_slice(&le32(v));
        }
        buf.push(0); // clip none

        let mut r = WireReader::new(&buf, "draw");
        let base = DisplayBase::decode(&mut r).unwrap();
        assert_eq!(base.surface, 0);
        assert_eq!(base.boxx, Rect { top: 10, left: 20, bottom: 30, right: 40 });
        assert!(base.clip_rects.is_empty());
        assert_eq!(base.boxx.width(), 20);
        assert_eq!(base.boxx.height(), 20);
    }

    #[test]
    fn display_base_with_rects() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&le32(3));
        for v in [0u32, 0, 8, 8] {
            buf.extend_from_slice(&le32(v));
        }
        buf.push(1); // clip rects
        buf.extend_from_slice(&le32(2));
        for v in [0u32, 0, 4, 4, 4, 4, 8, 8] {
            buf.extend_from_slice(&le32(v));
        }

        let mut r = WireReader::new(&buf, "draw");
        let base = DisplayBase::decode(&mut r).unwrap();
        assert_eq!(base.surface, 3);
        assert_eq!(base.clip_rects.len(), 2);
        assert_eq!(base.clip_rects[1], Rect { top: 4, left: 4, bottom: 8, right: 8 });
    }
}
