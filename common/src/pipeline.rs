//! Frame pipeline shared by `/stream`, `/capture` and the level reporter.
//!
//! Each pass runs acquire, convert, analyze, encode. Camera frames are RAII
//! guards, so whichever step ends a pass, the driver buffer goes back exactly
//! once. Small frames are converted, released, then analyzed and encoded;
//! frames wider than the passthrough width skip analysis entirely.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    analyzer::{analyze, darken, LevelReading},
    config::StreamConfig,
    filter::RunningAverage,
    frame::{CameraFrame, CodecError, FrameCodec, FrameSource, PixelFormat},
    multipart::{part_header, STREAM_BOUNDARY},
    overlay::draw_overlay,
    settings::{SettingsTable, SharedSettings, Slot},
};

pub type SharedTiming = Arc<Mutex<RunningAverage>>;

/// Size of the pieces a chunked capture body is written in.
pub const CAPTURE_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeMode {
    /// Overlay plus the darkening pass.
    Stream,
    /// Overlay only.
    Capture,
}

/// Why a pass produced nothing. None of these end a stream.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("camera capture failed")]
    NoFrame,
    #[error("frame conversion failed: {0}")]
    Convert(#[source] CodecError),
    #[error("jpeg compression failed: {0}")]
    Encode(#[source] CodecError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Closed,
    #[error("chunk write failed: {0}")]
    Write(String),
}

/// Destination of a chunked HTTP response body.
pub trait ChunkSink {
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    /// Lets the stream notice a closed peer while no frames are arriving.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Bytes for one response part: either the camera's own JPEG buffer or a
/// buffer produced by the codec, never both.
#[derive(Debug)]
pub enum Payload<F> {
    Frame(F),
    Encoded(Vec<u8>),
}

impl<F: CameraFrame> Payload<F> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Frame(frame) => frame.data(),
            Self::Encoded(jpeg) => jpeg,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

#[derive(Debug)]
pub enum StreamEnd {
    WriteFailed(SinkError),
    Closed,
}

#[derive(Debug)]
pub struct StreamSummary {
    pub parts_sent: usize,
    pub frames_skipped: usize,
    pub end: StreamEnd,
}

/// Result of a single-shot capture.
#[derive(Debug)]
pub struct CaptureOutput<F> {
    pub payload: Payload<F>,
    /// Passthrough JPEGs go out as one body, everything else chunked.
    pub chunked: bool,
}

impl<F: CameraFrame> CaptureOutput<F> {
    pub fn write_to<K: ChunkSink>(&self, sink: &mut K) -> Result<(), SinkError> {
        let bytes = self.payload.bytes();
        if !self.chunked {
            return sink.send_chunk(bytes);
        }
        for chunk in bytes.chunks(CAPTURE_CHUNK) {
            sink.send_chunk(chunk)?;
        }
        Ok(())
    }
}

pub struct FramePipeline<S, C> {
    source: S,
    codec: C,
    settings: SharedSettings,
    timing: SharedTiming,
    config: StreamConfig,
    last_frame: Instant,
}

impl<S, C> FramePipeline<S, C>
where
    S: FrameSource,
    C: FrameCodec,
{
    pub fn new(
        source: S,
        codec: C,
        settings: SharedSettings,
        timing: SharedTiming,
        config: StreamConfig,
    ) -> Self {
        Self {
            source,
            codec,
            settings,
            timing,
            config,
            last_frame: Instant::now(),
        }
    }

    fn settings_snapshot(&self) -> SettingsTable {
        self.settings.lock().unwrap().clone()
    }

    /// One acquire..encode pass.
    pub fn next_payload(&mut self, mode: AnalyzeMode) -> Result<Payload<S::Frame>, SkipReason> {
        let frame = self.source.acquire().ok_or(SkipReason::NoFrame)?;

        if frame.width() > self.config.passthrough_width {
            if frame.format() == PixelFormat::Jpeg {
                return Ok(Payload::Frame(frame));
            }
            let jpeg = self
                .codec
                .frame_to_jpeg(&frame, self.config.passthrough_quality)
                .map_err(SkipReason::Encode)?;
            return Ok(Payload::Encoded(jpeg));
        }

        let mut pixels = self.codec.to_pixels(&frame).map_err(SkipReason::Convert)?;
        drop(frame);

        let settings = self.settings_snapshot();
        let reading = analyze(&mut pixels, &settings);
        draw_overlay(&mut pixels, &reading, settings.flag(Slot::CoffeeText));
        if mode == AnalyzeMode::Stream {
            darken(&mut pixels, self.config.darken_offset);
        }

        let jpeg = self
            .codec
            .encode(&pixels, self.config.analysis_quality)
            .map_err(SkipReason::Encode)?;
        Ok(Payload::Encoded(jpeg))
    }

    /// Streams multipart parts into `sink` until a write fails or the peer
    /// goes away. Failed passes are logged and skipped.
    pub fn run_stream<K: ChunkSink>(&mut self, sink: &mut K) -> StreamSummary {
        let mut parts_sent = 0;
        let mut frames_skipped = 0;
        self.last_frame = Instant::now();

        let finish = |parts_sent, frames_skipped, end| StreamSummary {
            parts_sent,
            frames_skipped,
            end,
        };

        if let Err(err) = sink.send_chunk(STREAM_BOUNDARY.as_bytes()) {
            return finish(parts_sent, frames_skipped, StreamEnd::WriteFailed(err));
        }

        loop {
            if sink.is_closed() {
                return finish(parts_sent, frames_skipped, StreamEnd::Closed);
            }

            let payload = match self.next_payload(AnalyzeMode::Stream) {
                Ok(payload) => payload,
                Err(reason) => {
                    warn!("stream frame skipped: {reason}");
                    frames_skipped += 1;
                    continue;
                }
            };

            let header = part_header(payload.len());
            let written = sink
                .send_chunk(header.as_bytes())
                .and_then(|()| sink.send_chunk(payload.bytes()))
                .and_then(|()| sink.send_chunk(STREAM_BOUNDARY.as_bytes()));
            if let Err(err) = written {
                return finish(parts_sent, frames_skipped, StreamEnd::WriteFailed(err));
            }

            parts_sent += 1;
            self.record_frame_time(payload.len());
        }
    }

    pub fn capture(&mut self) -> Result<CaptureOutput<S::Frame>, SkipReason> {
        let payload = self.next_payload(AnalyzeMode::Capture)?;
        let chunked = !matches!(payload, Payload::Frame(_));
        Ok(CaptureOutput { payload, chunked })
    }

    /// Analysis-only pass used by the level reporter. Nothing is drawn.
    pub fn measure(&mut self) -> Result<LevelReading, SkipReason> {
        let frame = self.source.acquire().ok_or(SkipReason::NoFrame)?;
        let mut pixels = self.codec.to_pixels(&frame).map_err(SkipReason::Convert)?;
        drop(frame);

        let reading = analyze(&mut pixels, &self.settings_snapshot());
        self.record_frame_time(0);
        Ok(reading)
    }

    fn record_frame_time(&mut self, len: usize) {
        let now = Instant::now();
        let frame_ms = now.duration_since(self.last_frame).as_millis() as u32;
        self.last_frame = now;

        let avg_ms = self.timing.lock().unwrap().run(frame_ms);
        debug!(
            "MJPG: {len}B {frame_ms}ms ({:.1}fps), AVG: {avg_ms}ms ({:.1}fps)",
            fps(frame_ms),
            fps(avg_ms)
        );
    }
}

fn fps(ms: u32) -> f32 {
    if ms == 0 {
        return 0.0;
    }
    1000.0 / ms as f32
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::{ImageCodec, OwnedFrame};

    #[derive(Debug)]
    struct TrackedFrame {
        inner: OwnedFrame,
        released: Arc<AtomicUsize>,
    }

    impl CameraFrame for TrackedFrame {
        fn width(&self) -> usize {
            self.inner.width
        }

        fn height(&self) -> usize {
            self.inner.height
        }

        fn format(&self) -> PixelFormat {
            self.inner.format
        }

        fn data(&self) -> &[u8] {
            &self.inner.data
        }
    }

    impl Drop for TrackedFrame {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedSource {
        script: VecDeque<Option<OwnedFrame>>,
        acquired: usize,
        released: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Option<OwnedFrame>>) -> Self {
            Self {
                script: script.into(),
                acquired: 0,
                released: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FrameSource for &mut ScriptedSource {
        type Frame = TrackedFrame;

        fn acquire(&mut self) -> Option<TrackedFrame> {
            let inner = self.script.pop_front().flatten()?;
            self.acquired += 1;
            Some(TrackedFrame {
                inner,
                released: self.released.clone(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<Vec<u8>>,
        fail_on_write: Option<usize>,
        closed: bool,
    }

    impl ChunkSink for RecordingSink {
        fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
            if self.fail_on_write == Some(self.chunks.len()) {
                return Err(SinkError::Closed);
            }
            self.chunks.push(chunk.to_vec());
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn raw_frame(width: usize, height: usize) -> OwnedFrame {
        OwnedFrame {
            width,
            height,
            format: PixelFormat::Rgb888,
            data: vec![90; width * height * 3],
        }
    }

    fn jpeg_frame(width: usize, data: Vec<u8>) -> OwnedFrame {
        OwnedFrame {
            width,
            height: 2,
            format: PixelFormat::Jpeg,
            data,
        }
    }

    fn pipeline(source: &mut ScriptedSource) -> FramePipeline<&mut ScriptedSource, ImageCodec> {
        FramePipeline::new(
            source,
            ImageCodec,
            Arc::new(Mutex::new(SettingsTable::default())),
            Arc::new(Mutex::new(RunningAverage::new(20))),
            StreamConfig::default(),
        )
    }

    /// Splits recorded chunks into parts, checking the framing on the way.
    fn parts(chunks: &[Vec<u8>]) -> Vec<Vec<u8>> {
        assert_eq!(chunks[0], STREAM_BOUNDARY.as_bytes());
        chunks[1..]
            .chunks_exact(3)
            .map(|part| {
                assert_eq!(part[0], part_header(part[1].len()).as_bytes());
                assert_eq!(part[2], STREAM_BOUNDARY.as_bytes());
                part[1].clone()
            })
            .collect()
    }

    #[test]
    fn stream_sends_one_part_per_frame() {
        let mut source = ScriptedSource::new((0..4).map(|_| Some(raw_frame(40, 30))).collect());
        // Opening boundary plus three full parts, then the fourth header fails.
        let mut sink = RecordingSink {
            fail_on_write: Some(10),
            ..RecordingSink::default()
        };

        let summary = pipeline(&mut source).run_stream(&mut sink);

        assert_eq!(summary.parts_sent, 3);
        assert!(matches!(summary.end, StreamEnd::WriteFailed(SinkError::Closed)));
        let parts = parts(&sink.chunks);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|jpeg| jpeg.starts_with(&[0xFF, 0xD8])));
    }

    #[test]
    fn missing_frame_is_skipped_not_fatal() {
        let mut source = ScriptedSource::new(vec![
            Some(raw_frame(40, 30)),
            None,
            Some(raw_frame(40, 30)),
            Some(raw_frame(40, 30)),
        ]);
        let mut sink = RecordingSink {
            fail_on_write: Some(7),
            ..RecordingSink::default()
        };

        let summary = pipeline(&mut source).run_stream(&mut sink);

        assert_eq!(summary.parts_sent, 2);
        assert_eq!(summary.frames_skipped, 1);
        assert_eq!(parts(&sink.chunks).len(), 2);
    }

    #[test]
    fn every_acquired_frame_is_released_once() {
        let passthrough = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let mut source = ScriptedSource::new(vec![
            Some(jpeg_frame(800, passthrough.clone())),
            Some(jpeg_frame(40, vec![1, 2, 3])),
            Some(raw_frame(40, 30)),
            Some(raw_frame(401, 2)),
            Some(raw_frame(40, 30)),
        ]);
        let mut sink = RecordingSink {
            fail_on_write: Some(10),
            ..RecordingSink::default()
        };

        let summary = pipeline(&mut source).run_stream(&mut sink);

        assert_eq!(summary.parts_sent, 3);
        assert_eq!(summary.frames_skipped, 1);
        assert_eq!(source.acquired, 5);
        assert_eq!(source.released.load(Ordering::SeqCst), 5);
        assert_eq!(parts(&sink.chunks)[0], passthrough);
    }

    #[test]
    fn closed_sink_ends_stream_before_acquiring() {
        let mut source = ScriptedSource::new(vec![Some(raw_frame(40, 30))]);
        let mut sink = RecordingSink {
            closed: true,
            ..RecordingSink::default()
        };

        let summary = pipeline(&mut source).run_stream(&mut sink);

        assert!(matches!(summary.end, StreamEnd::Closed));
        assert_eq!(source.acquired, 0);
        assert_eq!(sink.chunks.len(), 1);
    }

    #[test]
    fn capture_chunks_analyzed_frames_only() {
        let passthrough = vec![0xFF, 0xD8, 9, 0xFF, 0xD9];
        let mut source = ScriptedSource::new(vec![
            Some(raw_frame(40, 30)),
            Some(jpeg_frame(1600, passthrough.clone())),
            None,
        ]);
        let mut pipeline = pipeline(&mut source);

        let small = pipeline.capture().unwrap();
        assert!(small.chunked);
        assert!(small.payload.bytes().starts_with(&[0xFF, 0xD8]));

        let large = pipeline.capture().unwrap();
        assert!(!large.chunked);
        let mut sink = RecordingSink::default();
        large.write_to(&mut sink).unwrap();
        assert_eq!(sink.chunks, vec![passthrough]);

        assert!(matches!(pipeline.capture(), Err(SkipReason::NoFrame)));
    }

    #[test]
    fn measure_records_timing() {
        let timing = Arc::new(Mutex::new(RunningAverage::new(20)));
        let mut source = ScriptedSource::new(vec![Some(raw_frame(40, 30))]);
        let mut pipeline = FramePipeline::new(
            &mut source,
            ImageCodec,
            Arc::new(Mutex::new(SettingsTable::default())),
            timing.clone(),
            StreamConfig::default(),
        );

        let reading = pipeline.measure().unwrap();

        assert!(reading.level.is_some());
        assert_eq!(timing.lock().unwrap().count(), 1);
    }
}
