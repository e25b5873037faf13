//! Authoritative canvas raster.
//!
//! Holds two views of the same grid: one palette index per cell (what gets
//! snapshotted) and the expanded RGB bytes (what gets rendered). Every write
//! updates both, so they never disagree.

use thiserror::Error;

use crate::codec::{Edit, HEIGHT, PALETTE_SIZE, WIDTH};

/// RGB value of each palette index.
pub const PALETTE: [[u8; 3]; PALETTE_SIZE as usize] = [
    [255, 255, 255], // white
    [228, 228, 228], // light grey
    [136, 136, 136], // grey
    [34, 34, 34],    // black
    [255, 167, 209], // pink
    [229, 0, 9],     // red
    [229, 149, 0],   // orange
    [160, 106, 66],  // brown
    [229, 217, 0],   // yellow
    [148, 224, 68],  // light green
    [2, 190, 1],     // green
    [0, 211, 221],   // cyan
    [0, 131, 199],   // medium blue
    [0, 0, 234],     // dark blue
    [207, 110, 228], // light purple
    [130, 0, 128],   // dark purple
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RasterError {
    #[error("snapshot has {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("palette index {index} at cell {cell} is out of range")]
    BadIndex { cell: usize, index: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u16,
    height: u16,
    indices: Vec<u8>,
    rgb: Vec<u8>,
}

impl Default for Raster {
    fn default() -> Self {
        Self::new()
    }
}

impl Raster {
    /// An all-white canvas of the standard size.
    pub fn new() -> Self {
        Self::with_size(WIDTH, HEIGHT)
    }

    /// An all-white canvas of the given size. Sizes above the codec limits
    /// are unreachable by edits; tests use smaller rasters.
    pub fn with_size(width: u16, height: u16) -> Self {
        let cells = usize::from(width) * usize::from(height);
        let white = PALETTE[0];
        let mut rgb = Vec::with_capacity(cells * 3);
        for _ in 0..cells {
            rgb.extend_from_slice(&white);
        }
        Self {
            width,
            height,
            indices: vec![0; cells],
            rgb,
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    fn cell(&self, x: u16, y: u16) -> Option<usize> {
        if x < self.width && y < self.height {
            Some(usize::from(y) * usize::from(self.width) + usize::from(x))
        } else {
            None
        }
    }

    /// Write one cell. Returns `false` for a coordinate outside this raster.
    pub fn set(&mut self, x: u16, y: u16, color: u8) -> bool {
        let (Some(cell), Some(rgb)) = (self.cell(x, y), PALETTE.get(usize::from(color))) else {
            return false;
        };
        self.indices[cell] = color;
        self.rgb[cell * 3..cell * 3 + 3].copy_from_slice(rgb);
        true
    }

    /// Apply a validated edit.
    pub fn apply(&mut self, edit: &Edit) -> bool {
        self.set(edit.x(), edit.y(), edit.color())
    }

    /// Palette index of a cell.
    pub fn get(&self, x: u16, y: u16) -> Option<u8> {
        self.cell(x, y).map(|cell| self.indices[cell])
    }

    /// Row-major palette indices, one byte per cell.
    pub fn snapshot_bytes(&self) -> &[u8] {
        &self.indices
    }

    /// Row-major RGB bytes, three per cell.
    pub fn render_bytes(&self) -> &[u8] {
        &self.rgb
    }

    /// Rebuild a standard-size raster from persisted indices.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, RasterError> {
        Self::from_snapshot_sized(bytes, WIDTH, HEIGHT)
    }

    pub fn from_snapshot_sized(bytes: &[u8], width: u16, height: u16) -> Result<Self, RasterError> {
        let expected = usize::from(width) * usize::from(height);
        if bytes.len() != expected {
            return Err(RasterError::WrongLength {
                expected,
                actual: bytes.len(),
            });
        }
        let mut rgb = Vec::with_capacity(expected * 3);
        for (cell, &index) in bytes.iter().enumerate() {
            let color = PALETTE
                .get(usize::from(index))
                .ok_or(RasterError::BadIndex { cell, index })?;
            rgb.extend_from_slice(color);
        }
        Ok(Self {
            width,
            height,
            indices: bytes.to_vec(),
            rgb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_white() {
        let raster = Raster::with_size(4, 3);
        assert_eq!(raster.snapshot_bytes(), &[0; 12]);
        assert!(raster.render_bytes().iter().all(|&b| b == 255));
        assert_eq!(raster.render_bytes().len(), 36);
    }

    #[test]
    fn test_set_updates_both_views() {
        let mut raster = Raster::new();
        assert!(raster.set(5, 5, 3));
        assert_eq!(raster.get(5, 5), Some(3));

        let cell = 5 * 1000 + 5;
        assert_eq!(raster.snapshot_bytes()[cell], 3);
        assert_eq!(&raster.render_bytes()[cell * 3..cell * 3 + 3], &[34, 34, 34]);
    }

    #[test]
    fn test_last_write_wins() {
        let mut raster = Raster::new();
        raster.set(5, 5, 3);
        raster.set(5, 5, 7);
        assert_eq!(raster.get(5, 5), Some(7));
        let cell = 5 * 1000 + 5;
        assert_eq!(&raster.render_bytes()[cell * 3..cell * 3 + 3], &PALETTE[7]);
    }

    #[test]
    fn test_set_rejects_outside() {
        let mut raster = Raster::with_size(10, 10);
        assert!(!raster.set(10, 0, 1));
        assert!(!raster.set(0, 0, 16));
        assert_eq!(raster.get(10, 0), None);
        assert_eq!(raster.snapshot_bytes(), &[0; 100]);
    }

    #[test]
    fn test_snapshot_rebuilds_rgb() {
        let mut raster = Raster::with_size(8, 8);
        for i in 0..8u16 {
            raster.set(i, 7 - i, (i * 2) as u8);
        }
        let restored = Raster::from_snapshot_sized(raster.snapshot_bytes(), 8, 8).unwrap();
        assert_eq!(restored, raster);
    }

    #[test]
    fn test_from_snapshot_rejects_bad_input() {
        assert_eq!(
            Raster::from_snapshot(&[0; 10]),
            Err(RasterError::WrongLength {
                expected: 1_000_000,
                actual: 10
            })
        );

        let mut bytes = vec![0u8; 4];
        bytes[2] = 16;
        assert_eq!(
            Raster::from_snapshot_sized(&bytes, 2, 2),
            Err(RasterError::BadIndex { cell: 2, index: 16 })
        );
    }
}
