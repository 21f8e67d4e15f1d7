//! Posting measured levels to the remote coffee API.

use log::{info, warn};
use thiserror::Error;

use crate::{
    analyzer::LevelReading,
    frame::{FrameCodec, FrameSource},
    pipeline::{FramePipeline, SkipReason},
    settings::{SettingsTable, SharedSettings, Slot},
};

pub const DEFAULT_REPORT_URL: &str = "http://php-alnino200534546.codeanyapp.com/coffee/api.php";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no frame to measure: {0}")]
    Skipped(#[from] SkipReason),
    #[error("reference lines coincide, level is undefined")]
    NoLevel,
    #[error("report request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportResponse {
    pub status: u16,
    pub body: String,
}

/// Minimal HTTP client used for the level GET.
pub trait ReportTransport {
    fn get(&mut self, url: &str) -> Result<ReportResponse, ReportError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReport {
    pub value: f32,
    pub cups: u8,
    pub pot_id: u8,
    pub exists: bool,
}

impl LevelReport {
    pub fn from_reading(reading: &LevelReading, settings: &SettingsTable) -> Option<Self> {
        Some(Self {
            value: reading.level?,
            cups: settings.get(Slot::CoffeeCups),
            pot_id: settings.get(Slot::CoffeePotId),
            exists: reading.present,
        })
    }

    pub fn to_url(&self, base: &str) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{base}{separator}value={:.2}&cups={}&pot_id={}&exists={}",
            self.value,
            self.cups,
            self.pot_id,
            u8::from(self.exists)
        )
    }
}

/// Measures one frame and sends the result. Non-success statuses are
/// logged but still returned as a response.
pub fn report_level<S, C, T>(
    pipeline: &mut FramePipeline<S, C>,
    settings: &SharedSettings,
    transport: &mut T,
    base_url: &str,
) -> Result<ReportResponse, ReportError>
where
    S: FrameSource,
    C: FrameCodec,
    T: ReportTransport + ?Sized,
{
    let reading = pipeline.measure()?;
    let table = settings.lock().unwrap().clone();
    let report = LevelReport::from_reading(&reading, &table).ok_or(ReportError::NoLevel)?;

    let response = transport.get(&report.to_url(base_url))?;
    if (200..300).contains(&response.status) {
        info!(
            "reported level {:.2} (exists={}) -> {}: {}",
            report.value, report.exists, response.status, response.body
        );
    } else {
        warn!("level report returned {}: {}", response.status, response.body);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::StreamConfig,
        filter::RunningAverage,
        frame::{ImageCodec, OwnedFrame, PixelFormat},
    };

    struct OneFrame(Option<OwnedFrame>);

    impl FrameSource for OneFrame {
        type Frame = OwnedFrame;

        fn acquire(&mut self) -> Option<OwnedFrame> {
            self.0.take()
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        urls: Vec<String>,
    }

    impl ReportTransport for RecordingTransport {
        fn get(&mut self, url: &str) -> Result<ReportResponse, ReportError> {
            self.urls.push(url.to_string());
            Ok(ReportResponse {
                status: 200,
                body: "ok".to_string(),
            })
        }
    }

    fn pot_frame() -> OwnedFrame {
        let (width, height) = (100, 100);
        let mut data = vec![220; width * height * 3];
        data[60 * width * 3..].fill(30);
        OwnedFrame {
            width,
            height,
            format: PixelFormat::Rgb888,
            data,
        }
    }

    fn pipeline(
        frame: Option<OwnedFrame>,
        settings: &SharedSettings,
    ) -> FramePipeline<OneFrame, ImageCodec> {
        FramePipeline::new(
            OneFrame(frame),
            ImageCodec,
            settings.clone(),
            Arc::new(Mutex::new(RunningAverage::new(20))),
            StreamConfig::default(),
        )
    }

    #[test]
    fn url_carries_two_decimal_value() {
        let report = LevelReport {
            value: 37.5,
            cups: 12,
            pot_id: 3,
            exists: false,
        };

        assert_eq!(
            report.to_url("http://host/api.php"),
            "http://host/api.php?value=37.50&cups=12&pot_id=3&exists=0"
        );
        assert_eq!(
            report.to_url("http://host/api.php?key=abc"),
            "http://host/api.php?key=abc&value=37.50&cups=12&pot_id=3&exists=0"
        );
    }

    #[test]
    fn reports_measured_level() {
        let settings: SharedSettings = Arc::new(Mutex::new(SettingsTable::default()));
        let mut transport = RecordingTransport::default();

        let response = report_level(
            &mut pipeline(Some(pot_frame()), &settings),
            &settings,
            &mut transport,
            "http://host/api.php",
        )
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(
            transport.urls,
            vec!["http://host/api.php?value=37.50&cups=12&pot_id=1&exists=1".to_string()]
        );
    }

    #[test]
    fn nothing_sent_without_frame_or_level() {
        let settings: SharedSettings = Arc::new(Mutex::new(SettingsTable::default()));
        let mut transport = RecordingTransport::default();

        let missing = report_level(&mut pipeline(None, &settings), &settings, &mut transport, "x");
        assert!(matches!(missing, Err(ReportError::Skipped(SkipReason::NoFrame))));

        {
            let mut table = settings.lock().unwrap();
            table.set(Slot::CoffeeMin, 50);
            table.set(Slot::CoffeeMax, 50);
        }
        let flat = report_level(
            &mut pipeline(Some(pot_frame()), &settings),
            &settings,
            &mut transport,
            "x",
        );
        assert!(matches!(flat, Err(ReportError::NoLevel)));
        assert!(transport.urls.is_empty());
    }
}
