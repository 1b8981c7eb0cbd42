//! Pixel buffers and packing into the controller's native bit depths.
//!
//! Rendering is owned by the caller; this module only takes finished pixel
//! buffers (one byte per pixel) and repacks them into the wire layout the
//! IT8951 expects for the active bit depth.

use crate::command::{DisplayMode, MAX_TRANSFER};
use crate::Error;

/// Bit depth of image memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitDepth {
    /// Monochrome, 8 pixels per byte, rows aligned to 32 pixels.
    One,
    /// Grayscale, one byte per pixel.
    Eight,
}

impl BitDepth {
    /// Bytes needed for one `width`-pixel row in this depth.
    ///
    /// 1bpp rows are padded to the controller's 32-pixel / 4-byte boundary.
    pub fn pitch(self, width: u32) -> u32 {
        match self {
            BitDepth::One => ((width + 31) / 32) * 4,
            BitDepth::Eight => width,
        }
    }

    /// Refresh waveform selected when this depth becomes active.
    pub fn default_mode(self) -> DisplayMode {
        match self {
            BitDepth::One => DisplayMode::A2,
            BitDepth::Eight => DisplayMode::Du4,
        }
    }
}

/// Borrowed view of a rectangular pixel buffer, one byte per pixel.
///
/// In 1bpp mode a nonzero byte is a set pixel; in 8bpp mode each byte is the
/// gray level as-is.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    width: u32,
    height: u32,
    pixels: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn new(width: u32, height: u32, pixels: &'a [u8]) -> Result<Self, Error> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Frame {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sub-view of `rows` full rows starting at row `y`.
    ///
    /// Panics if the range runs past the bottom of the frame; the draw loop
    /// only asks for rows it has.
    pub fn strip(&self, y: u32, rows: u32) -> Frame<'a> {
        assert!(y + rows <= self.height);
        let start = y as usize * self.width as usize;
        let end = (y + rows) as usize * self.width as usize;
        Frame {
            width: self.width,
            height: rows,
            pixels: &self.pixels[start..end],
        }
    }

    /// Repack into the wire layout for `depth`: `pitch(width) * height` bytes.
    pub fn pack(&self, depth: BitDepth) -> Vec<u8> {
        let pitch = depth.pitch(self.width) as usize;
        let width = self.width as usize;
        let mut packed = vec![0u8; pitch * self.height as usize];
        match depth {
            BitDepth::Eight => {
                for (out, row) in packed.chunks_exact_mut(pitch).zip(self.pixels.chunks_exact(width))
                {
                    out.copy_from_slice(row);
                }
            }
            BitDepth::One => {
                // Bit 0 is the leftmost pixel of each group of 8. The pad bits
                // up to the pitch boundary stay zero.
                for (out, row) in packed.chunks_exact_mut(pitch).zip(self.pixels.chunks_exact(width))
                {
                    for (x, &pixel) in row.iter().enumerate() {
                        if pixel != 0 {
                            out[x / 8] |= 1 << (x % 8);
                        }
                    }
                }
            }
        }
        packed
    }
}

/// Rows per transfer that keep one packed strip within [`MAX_TRANSFER`].
///
/// Zero means the panel row itself does not fit in a single transfer; the
/// session reports that as a configuration error.
pub fn max_chunk_height(pitch: u32) -> u32 {
    MAX_TRANSFER as u32 / pitch
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of 1bpp packing, for the round-trip law.
    fn unpack_1bpp(packed: &[u8], width: u32, height: u32) -> Vec<u8> {
        let pitch = BitDepth::One.pitch(width) as usize;
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for row in packed.chunks_exact(pitch) {
            for x in 0..width as usize {
                pixels.push((row[x / 8] >> (x % 8)) & 1);
            }
        }
        pixels
    }

    #[test]
    fn pitch_follows_row_alignment() {
        assert_eq!(BitDepth::One.pitch(1872), 236);
        assert_eq!(BitDepth::One.pitch(32), 4);
        assert_eq!(BitDepth::One.pitch(33), 8);
        assert_eq!(BitDepth::One.pitch(40), 8);
        assert_eq!(BitDepth::Eight.pitch(1872), 1872);
    }

    #[test]
    fn chunk_height_is_the_tightest_bound() {
        for width in [800u32, 1200, 1448, 1872, 2560] {
            for depth in [BitDepth::One, BitDepth::Eight] {
                let pitch = depth.pitch(width);
                let chunk = max_chunk_height(pitch);
                assert!(chunk * pitch <= MAX_TRANSFER as u32);
                assert!((chunk + 1) * pitch > MAX_TRANSFER as u32);
            }
        }
        assert_eq!(max_chunk_height(BitDepth::One.pitch(1872)), 260);
    }

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let pixels = vec![0u8; 99];
        assert!(matches!(
            Frame::new(10, 10, &pixels),
            Err(Error::SizeMismatch {
                expected: 100,
                actual: 99
            })
        ));
    }

    #[test]
    fn eight_bpp_is_passthrough() {
        let pixels: Vec<u8> = (0..60u32).map(|v| v as u8).collect();
        let frame = Frame::new(20, 3, &pixels).unwrap();
        assert_eq!(frame.pack(BitDepth::Eight), pixels);
    }

    #[test]
    fn one_bpp_packs_lsb_first() {
        // leftmost pixel on, 40x1: one 0x01 byte then the zero pad to pitch 8
        let mut pixels = vec![0u8; 40];
        pixels[0] = 1;
        let frame = Frame::new(40, 1, &pixels).unwrap();
        let packed = frame.pack(BitDepth::One);
        assert_eq!(packed.len(), 8);
        assert_eq!(packed[0], 0x01);
        assert!(packed[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn one_bpp_round_trips_aligned_widths() {
        let width = 64u32;
        let height = 5u32;
        let pixels: Vec<u8> = (0..width * height).map(|i| ((i * 7) % 3 == 0) as u8).collect();
        let frame = Frame::new(width, height, &pixels).unwrap();
        let packed = frame.pack(BitDepth::One);
        assert_eq!(packed.len(), (BitDepth::One.pitch(width) * height) as usize);
        assert_eq!(unpack_1bpp(&packed, width, height), pixels);
    }

    #[test]
    fn one_bpp_pads_unaligned_rows_with_zero() {
        let width = 50u32;
        let height = 3u32;
        let pixels = vec![1u8; (width * height) as usize];
        let frame = Frame::new(width, height, &pixels).unwrap();
        let packed = frame.pack(BitDepth::One);
        let pitch = BitDepth::One.pitch(width) as usize;
        for row in packed.chunks_exact(pitch) {
            // 50 pixels fill 6 bytes and the low 2 bits of the 7th
            assert_eq!(&row[..6], &[0xff; 6]);
            assert_eq!(row[6], 0x03);
            assert_eq!(row[7], 0x00);
        }
        assert_eq!(unpack_1bpp(&packed, width, height), pixels);
    }

    #[test]
    fn all_white_panel_frame_packs_to_zero() {
        let pixels = vec![0u8; 1872 * 1404];
        let frame = Frame::new(1872, 1404, &pixels).unwrap();
        let packed = frame.pack(BitDepth::One);
        assert_eq!(packed.len(), 236 * 1404);
        assert!(packed.iter().all(|&b| b == 0));
    }

    #[test]
    fn strip_views_partition_the_frame() {
        let height = 11u32;
        let chunk = 4u32;
        let pixels: Vec<u8> = (0..8 * height).map(|v| v as u8).collect();
        let frame = Frame::new(8, height, &pixels).unwrap();

        let mut covered = 0;
        let mut offsets = Vec::new();
        while covered < height {
            let rows = (height - covered).min(chunk);
            let strip = frame.strip(covered, rows);
            offsets.push((covered, strip.height()));
            assert_eq!(
                strip.pack(BitDepth::Eight),
                &pixels[(covered * 8) as usize..((covered + rows) * 8) as usize]
            );
            covered += rows;
        }
        assert_eq!(offsets, vec![(0, 4), (4, 4), (8, 3)]);
    }
}
