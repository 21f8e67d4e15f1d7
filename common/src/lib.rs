pub mod analyzer;
pub mod config;
pub mod control;
pub mod filter;
pub mod frame;
pub mod multipart;
pub mod overlay;
pub mod pipeline;
pub mod report;
pub mod sensor;
pub mod settings;
pub mod status;

pub use analyzer::{analyze, darken, LevelGeometry, LevelReading};
pub use config::{NetworkConfig, ReportConfig, RuntimeConfig, StreamConfig};
pub use control::{apply_control, restore_sensor, ControlError, ControlOutcome, ControlRequest};
pub use filter::RunningAverage;
pub use frame::{
    CameraFrame, CodecError, FrameCodec, FrameSource, ImageCodec, OwnedFrame, PixelBuffer,
    PixelFormat,
};
pub use multipart::{part_header, PART_BOUNDARY, STREAM_BOUNDARY, STREAM_CONTENT_TYPE};
pub use overlay::{draw_overlay, Canvas};
pub use pipeline::{
    AnalyzeMode, CaptureOutput, ChunkSink, FramePipeline, Payload, SharedTiming, SinkError,
    SkipReason, StreamEnd, StreamSummary,
};
pub use report::{
    report_level, LevelReport, ReportError, ReportResponse, ReportTransport, DEFAULT_REPORT_URL,
};
pub use sensor::{frame_dimensions, Sensor, SensorControl, SensorError, SensorStatus, SimulatedSensor};
pub use settings::{
    MemoryStore, SettingsStore, SettingsTable, SharedSettings, Slot, StoreError, SETTINGS_SLOTS,
};
pub use status::StatusReport;
