//! Coffee level detection.
//!
//! The level is the row with the strongest brightness change between
//! consecutive rows inside a configured column window. Geometry is stored as
//! percentages of the frame so one configuration works at every frame size.

use crate::{
    frame::{PixelBuffer, BYTES_PER_PIXEL},
    settings::{SettingsTable, Slot},
};

/// Rows at the top and bottom edge that never count as the level boundary.
pub const ROW_MARGIN: usize = 5;

/// Settings scaled to pixel coordinates of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelGeometry {
    pub width: usize,
    pub height: usize,
    /// Row of the empty reference line.
    pub min_line_y: usize,
    /// Row of the full reference line.
    pub max_line_y: usize,
    pub left_x: usize,
    pub right_x: usize,
    pub marker_x: usize,
    pub marker_y: usize,
    pub threshold: u8,
}

impl LevelGeometry {
    pub fn from_settings(settings: &SettingsTable, width: usize, height: usize) -> Self {
        let w = width as f32;
        let h = height as f32;
        let pct = |slot: Slot| f32::from(settings.get(slot));

        // Reference lines are measured from the bottom of the frame.
        let line = |slot: Slot| ((h / 100.0 * pct(slot) - h).abs() as usize).min(last(height));
        let column = |slot: Slot| ((w / 100.0 * pct(slot)) as usize).min(width);

        let left_x = column(Slot::CoffeeLeft);
        let right_x = column(Slot::CoffeeRight).max(left_x);

        Self {
            width,
            height,
            min_line_y: line(Slot::CoffeeMin),
            max_line_y: line(Slot::CoffeeMax),
            left_x,
            right_x,
            marker_x: column(Slot::CoffeeExistsX).min(last(width)),
            marker_y: ((h / 100.0 * pct(Slot::CoffeeExistsY)) as usize).min(last(height)),
            threshold: settings.get(Slot::CoffeeExistsThreshold),
        }
    }

    /// Maps a boundary row onto the reference band: 100 at the full line,
    /// 0 at the empty line. Rows outside the band are pinned to its ends.
    ///
    /// Returns `None` when both reference lines fall on the same row.
    pub fn fill_percent(&self, row: usize) -> Option<f32> {
        let span = self.min_line_y as f32 - self.max_line_y as f32;
        if span == 0.0 {
            return None;
        }

        let mapped = ((row as f32 - self.max_line_y as f32) / span * 100.0).clamp(0.0, 100.0);
        Some((mapped - 100.0).abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    pub geometry: LevelGeometry,
    /// Row with the strongest transition, taken as the liquid surface.
    pub row: usize,
    pub level: Option<f32>,
    /// First byte of the presence marker pixel.
    pub sample: u8,
    pub present: bool,
}

/// Scans `pixels` for the coffee level. With the obscure setting on, every
/// row is overwritten with its own mean as it is scanned.
pub fn analyze(pixels: &mut PixelBuffer, settings: &SettingsTable) -> LevelReading {
    let geometry = LevelGeometry::from_settings(settings, pixels.width(), pixels.height());
    let obscure = settings.flag(Slot::CoffeeObscure);
    let row_bytes = pixels.stride().max(1) as u32;
    let window = geometry.left_x * BYTES_PER_PIXEL..geometry.right_x * BYTES_PER_PIXEL;

    let mut scores = vec![0_u32; pixels.height()];
    let mut previous = 0_u32;
    for (y, score) in scores.iter_mut().enumerate() {
        let sum: u32 = pixels.row(y)[window.clone()]
            .iter()
            .map(|byte| u32::from(*byte))
            .sum();
        // Normalized by the full row, not the window.
        let mean = sum / row_bytes;

        if obscure {
            pixels.row_mut(y).fill(mean as u8);
        }

        *score = mean.abs_diff(previous);
        previous = mean;
    }

    let mut row = 0;
    let mut best = 0;
    for (y, score) in scores
        .iter()
        .enumerate()
        .take(pixels.height().saturating_sub(ROW_MARGIN))
        .skip(ROW_MARGIN)
    {
        if *score > best {
            best = *score;
            row = y;
        }
    }

    let sample = pixels
        .pixel(geometry.marker_x, geometry.marker_y)
        .map(|bgr| bgr[0])
        .unwrap_or(u8::MAX);

    LevelReading {
        geometry,
        row,
        level: geometry.fill_percent(row),
        sample,
        // A sample equal to the threshold still counts as a pot.
        present: sample <= geometry.threshold,
    }
}

/// Lowers the first channel of every pixel by `offset`.
pub fn darken(pixels: &mut PixelBuffer, offset: u8) {
    for pixel in pixels.data_mut().chunks_exact_mut(BYTES_PER_PIXEL) {
        pixel[0] = pixel[0].saturating_sub(offset);
    }
}

fn last(len: usize) -> usize {
    len.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn settings(min: i32, max: i32, left: i32, right: i32) -> SettingsTable {
        let mut table = SettingsTable::default();
        table.set(Slot::CoffeeMin, min);
        table.set(Slot::CoffeeMax, max);
        table.set(Slot::CoffeeLeft, left);
        table.set(Slot::CoffeeRight, right);
        table
    }

    fn split_frame(width: usize, height: usize, edge_row: usize, top: u8, bottom: u8) -> PixelBuffer {
        let mut pixels = PixelBuffer::try_alloc(width, height).unwrap();
        for y in 0..height {
            let shade = if y < edge_row { top } else { bottom };
            pixels.row_mut(y).fill(shade);
        }
        pixels
    }

    #[test]
    fn geometry_scales_with_frame_size() {
        let table = settings(10, 90, 30, 70);

        let small = LevelGeometry::from_settings(&table, 100, 100);
        assert_eq!((small.min_line_y, small.max_line_y), (90, 10));
        assert_eq!((small.left_x, small.right_x), (30, 70));

        let large = LevelGeometry::from_settings(&table, 200, 300);
        assert_eq!((large.min_line_y, large.max_line_y), (270, 30));
        assert_eq!((large.left_x, large.right_x), (60, 140));
    }

    #[test]
    fn finds_single_sharp_transition() {
        let table = settings(10, 90, 0, 100);
        let mut pixels = split_frame(100, 100, 60, 200, 40);

        let reading = analyze(&mut pixels, &table);

        assert_eq!(reading.row, 60);
        assert_eq!(reading.level, Some(37.5));
    }

    #[test]
    fn ignores_transitions_inside_margins() {
        let table = settings(10, 90, 0, 100);
        let mut pixels = split_frame(100, 100, 97, 10, 250);
        pixels.row_mut(40).fill(30);

        let reading = analyze(&mut pixels, &table);

        assert_eq!(reading.row, 40);
    }

    #[test]
    fn window_limits_the_scan() {
        let table = settings(10, 90, 50, 100);
        let mut pixels = PixelBuffer::try_alloc(100, 100).unwrap();
        // Strong edge only in the left half, weak edge in the right half.
        for y in 30..100 {
            let row = pixels.row_mut(y);
            row[..150].fill(255);
        }
        for y in 70..100 {
            let row = pixels.row_mut(y);
            row[150..].fill(60);
        }

        let reading = analyze(&mut pixels, &table);

        assert_eq!(reading.row, 70);
    }

    #[test]
    fn level_is_bounded_and_monotonic_in_row() {
        let table = settings(20, 80, 0, 100);
        let geometry = LevelGeometry::from_settings(&table, 160, 120);

        let mut previous = f32::MAX;
        for row in 0..120 {
            let level = geometry.fill_percent(row).unwrap();
            assert!((0.0..=100.0).contains(&level), "row {row} gave {level}");
            assert!(level <= previous, "row {row} rose from {previous} to {level}");
            previous = level;
        }
        assert_eq!(geometry.fill_percent(geometry.max_line_y), Some(100.0));
        assert_eq!(geometry.fill_percent(geometry.min_line_y), Some(0.0));
    }

    #[test]
    fn equal_reference_lines_have_no_level() {
        let table = settings(50, 50, 0, 100);
        let mut pixels = split_frame(40, 40, 20, 200, 40);

        let reading = analyze(&mut pixels, &table);

        assert_eq!(reading.level, None);
        assert_eq!(reading.row, 20);
    }

    // Known odd boundary: a sample equal to the threshold counts as present.
    #[test]
    fn presence_boundary_is_inclusive() {
        let mut table = settings(10, 90, 0, 100);
        table.set(Slot::CoffeeExistsX, 50);
        table.set(Slot::CoffeeExistsY, 50);
        table.set(Slot::CoffeeExistsThreshold, 100);

        let mut at = PixelBuffer::try_alloc(20, 20).unwrap();
        at.put_pixel(10, 10, [100, 0, 0]);
        assert!(analyze(&mut at, &table).present);

        let mut above = PixelBuffer::try_alloc(20, 20).unwrap();
        above.put_pixel(10, 10, [101, 0, 0]);
        let reading = analyze(&mut above, &table);
        assert_eq!(reading.sample, 101);
        assert!(!reading.present);
    }

    #[test]
    fn obscure_replaces_rows_with_their_mean() {
        let mut table = settings(10, 90, 0, 100);
        table.set(Slot::CoffeeObscure, 1);
        let mut pixels = PixelBuffer::try_alloc(4, 8).unwrap();
        pixels.row_mut(3).copy_from_slice(&[0, 0, 0, 0, 0, 0, 120, 120, 120, 120, 120, 120]);

        analyze(&mut pixels, &table);

        assert!(pixels.row(3).iter().all(|byte| *byte == 60));
        assert!(pixels.row(2).iter().all(|byte| *byte == 0));
    }

    #[test]
    fn darken_touches_first_channel_and_saturates() {
        let mut pixels = PixelBuffer::from_raw(2, 1, vec![20, 100, 100, 200, 100, 100]).unwrap();

        darken(&mut pixels, 25);

        assert_eq!(pixels.data(), &[0, 100, 100, 175, 100, 100]);
    }
}
