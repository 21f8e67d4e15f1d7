//! Diagnostic drawing on top of an analyzed frame.

use core::convert::Infallible;

use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::{Rgb888, RgbColor},
    prelude::{DrawTarget, Drawable, OriginDimensions, Pixel, Point, Size},
    text::{Baseline, Text},
};

use crate::{analyzer::LevelReading, frame::PixelBuffer};

pub const GREEN: Rgb888 = Rgb888::new(0x00, 0xFF, 0x00);
pub const RED: Rgb888 = Rgb888::new(0xFF, 0x30, 0x34);

const MARKER_SIZE: i32 = 3;
const LEVEL_BAR: (i32, i32) = (30, 5);
const TEXT_X: i32 = 40;
const TEXT_RAISE: i32 = 10;

/// Drawing surface over a blue-green-red pixel buffer. Anything outside the
/// frame is clipped.
pub struct Canvas<'a> {
    pixels: &'a mut PixelBuffer,
}

impl<'a> Canvas<'a> {
    pub fn new(pixels: &'a mut PixelBuffer) -> Self {
        Self { pixels }
    }

    fn set(&mut self, x: i32, y: i32, color: Rgb888) {
        self.pixels.put_pixel(x, y, [color.b(), color.g(), color.r()]);
    }

    pub fn hline(&mut self, x: i32, y: i32, len: i32, color: Rgb888) {
        for dx in 0..len {
            self.set(x + dx, y, color);
        }
    }

    pub fn vline(&mut self, x: i32, y: i32, len: i32, color: Rgb888) {
        for dy in 0..len {
            self.set(x, y + dy, color);
        }
    }

    pub fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: Rgb888) {
        for dy in 0..h {
            self.hline(x, y + dy, w, color);
        }
    }

    /// Renders `text` with its top-left corner at `(x, y)`.
    pub fn text(&mut self, x: i32, y: i32, text: &str, color: Rgb888) {
        let style = MonoTextStyle::new(&FONT_6X10, color);
        let _ = Text::with_baseline(text, Point::new(x, y), style, Baseline::Top).draw(self);
    }
}

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.pixels.width() as u32, self.pixels.height() as u32)
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(coord, color) in pixels {
            self.set(coord.x, coord.y, color);
        }
        Ok(())
    }
}

/// Draws reference lines, the window, the presence marker and the level bar.
/// The percentage is printed next to the bar when `show_text` is set and a
/// level could be computed.
pub fn draw_overlay(pixels: &mut PixelBuffer, reading: &LevelReading, show_text: bool) {
    let g = reading.geometry;
    let (width, height) = (g.width as i32, g.height as i32);
    let mut canvas = Canvas::new(pixels);

    canvas.hline(0, g.min_line_y as i32, width, GREEN);
    canvas.hline(0, g.max_line_y as i32, width, GREEN);
    canvas.vline(g.left_x as i32, 0, height, GREEN);
    canvas.vline(g.right_x as i32, 0, height, GREEN);

    let marker = if reading.present { GREEN } else { RED };
    canvas.fill_rect(
        g.marker_x as i32,
        g.marker_y as i32,
        MARKER_SIZE,
        MARKER_SIZE,
        marker,
    );

    let row = reading.row as i32;
    canvas.fill_rect(0, row, LEVEL_BAR.0, LEVEL_BAR.1, GREEN);

    if let (true, Some(level)) = (show_text, reading.level) {
        canvas.text(TEXT_X, row - TEXT_RAISE, &format!("{level:.2}"), GREEN);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        analyzer::analyze,
        settings::{SettingsTable, Slot},
    };

    const GREEN_BGR: [u8; 3] = [0x00, 0xFF, 0x00];
    const RED_BGR: [u8; 3] = [0x34, 0x30, 0xFF];

    fn analyzed(present: bool, text: bool) -> (PixelBuffer, LevelReading) {
        let mut table = SettingsTable::default();
        table.set(Slot::CoffeeText, i32::from(text));
        table.set(Slot::CoffeeExistsThreshold, if present { 255 } else { 0 });
        let mut pixels = PixelBuffer::try_alloc(100, 100).unwrap();
        for y in 60..100 {
            pixels.row_mut(y).fill(200);
        }
        let reading = analyze(&mut pixels, &table);
        (pixels, reading)
    }

    fn green_pixels_in_rows(pixels: &PixelBuffer, rows: core::ops::Range<usize>) -> usize {
        rows.flat_map(|y| (40..100).map(move |x| (x, y)))
            .filter(|(x, y)| pixels.pixel(*x, *y) == Some(GREEN_BGR))
            .count()
    }

    #[test]
    fn draws_reference_lines_and_level_bar() {
        let (mut pixels, reading) = analyzed(true, false);
        draw_overlay(&mut pixels, &reading, false);

        let g = reading.geometry;
        assert_eq!(pixels.pixel(0, g.min_line_y), Some(GREEN_BGR));
        assert_eq!(pixels.pixel(99, g.max_line_y), Some(GREEN_BGR));
        assert_eq!(pixels.pixel(g.left_x, 0), Some(GREEN_BGR));
        assert_eq!(pixels.pixel(g.right_x, 99), Some(GREEN_BGR));
        assert_eq!(pixels.pixel(29, reading.row + 4), Some(GREEN_BGR));
        assert_eq!(pixels.pixel(g.marker_x + 2, g.marker_y + 2), Some(GREEN_BGR));
    }

    #[test]
    fn absent_pot_marker_is_red() {
        let (mut pixels, reading) = analyzed(false, false);
        assert!(!reading.present);
        draw_overlay(&mut pixels, &reading, false);

        let g = reading.geometry;
        assert_eq!(pixels.pixel(g.marker_x, g.marker_y), Some(RED_BGR));
    }

    #[test]
    fn text_only_rendered_when_enabled() {
        let (mut plain, reading) = analyzed(true, false);
        draw_overlay(&mut plain, &reading, false);
        let (mut labelled, reading) = analyzed(true, true);
        draw_overlay(&mut labelled, &reading, true);

        let rows = reading.row - 10..reading.row;
        assert!(green_pixels_in_rows(&labelled, rows.clone()) > green_pixels_in_rows(&plain, rows));
    }

    #[test]
    fn shapes_clip_at_frame_edges() {
        let mut pixels = PixelBuffer::try_alloc(8, 8).unwrap();
        let mut canvas = Canvas::new(&mut pixels);
        canvas.fill_rect(-4, 6, 30, 5, GREEN);
        canvas.text(5, -3, "99.00", GREEN);

        assert_eq!(pixels.pixel(0, 7), Some(GREEN_BGR));
        assert_eq!(pixels.pixel(0, 5), Some([0, 0, 0]));
    }
}
