//! Camera stand-in for host builds.
//!
//! Frames follow the simulated sensor's framesize, so `/control?var=framesize`
//! moves the stream across the passthrough width just like the board does.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use tracing::{info, warn};

use coffeecam_common::{
    FrameCodec, FrameSource, ImageCodec, OwnedFrame, PixelBuffer, PixelFormat, Sensor,
    SimulatedSensor,
};

const FRAME_INTERVAL: Duration = Duration::from_millis(66);

const WALL: [u8; 3] = [170, 175, 180];
const GLASS: [u8; 3] = [215, 220, 220];
const COFFEE: [u8; 3] = [25, 35, 60];

#[derive(Clone)]
pub struct SimulatedCamera {
    sensor: Arc<Mutex<SimulatedSensor>>,
    replay: Arc<Vec<OwnedFrame>>,
    tick: Arc<AtomicU64>,
}

impl SimulatedCamera {
    pub fn new(sensor: Arc<Mutex<SimulatedSensor>>) -> Self {
        Self {
            sensor,
            replay: Arc::new(Vec::new()),
            tick: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_replay(mut self, frames: Vec<OwnedFrame>) -> Self {
        self.replay = Arc::new(frames);
        self
    }

    /// Loads every `.jpg`/`.jpeg` in `dir`, in name order.
    pub fn load_replay_dir(dir: &Path) -> anyhow::Result<Vec<OwnedFrame>> {
        let mut paths = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read frame dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect::<Vec<_>>();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let data = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut frame = OwnedFrame {
                width: 0,
                height: 0,
                format: PixelFormat::Jpeg,
                data,
            };
            let pixels = ImageCodec
                .to_pixels(&frame)
                .with_context(|| format!("failed to decode {}", path.display()))?;
            frame.width = pixels.width();
            frame.height = pixels.height();
            frames.push(frame);
        }

        info!("loaded {} replay frames from {}", frames.len(), dir.display());
        Ok(frames)
    }

    fn synthetic_frame(&self, tick: u64) -> Option<OwnedFrame> {
        let (width, height, quality) = {
            let sensor = self.sensor.lock().unwrap();
            let (width, height) = sensor.dimensions();
            (width, height, sensor.status().quality)
        };

        let mut pixels = match PixelBuffer::try_alloc(width, height) {
            Ok(pixels) => pixels,
            Err(err) => {
                warn!("simulated frame dropped: {err}");
                return None;
            }
        };

        let fill = 0.5 + 0.4 * (tick as f32 * 0.05).sin();
        let pot_top = height / 10;
        let pot_bottom = height * 19 / 20;
        let surface = pot_bottom - ((pot_bottom - pot_top) as f32 * fill) as usize;
        let pot_columns = width / 4..width * 3 / 4;

        for y in 0..height {
            let row = pixels.row_mut(y);
            for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
                let shade = if !pot_columns.contains(&x) || !(pot_top..pot_bottom).contains(&y) {
                    WALL
                } else if y >= surface {
                    COFFEE
                } else {
                    GLASS
                };
                pixel.copy_from_slice(&shade);
            }
        }

        // Sensor quality runs 0 (best) to 63.
        let jpeg_quality = 100_u8.saturating_sub(quality);
        match ImageCodec.encode(&pixels, jpeg_quality) {
            Ok(data) => Some(OwnedFrame {
                width,
                height,
                format: PixelFormat::Jpeg,
                data,
            }),
            Err(err) => {
                warn!("simulated frame encode failed: {err}");
                None
            }
        }
    }
}

impl FrameSource for SimulatedCamera {
    type Frame = OwnedFrame;

    fn acquire(&mut self) -> Option<OwnedFrame> {
        thread::sleep(FRAME_INTERVAL);
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);

        if !self.replay.is_empty() {
            let index = (tick % self.replay.len() as u64) as usize;
            return Some(self.replay[index].clone());
        }
        self.synthetic_frame(tick)
    }
}
