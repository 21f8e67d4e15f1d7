use serde::{Deserialize, Serialize};

use crate::report::DEFAULT_REPORT_URL;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    /// Main server port. The stream server listens on the next port up.
    pub http_port: u16,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

impl NetworkConfig {
    pub fn stream_port(&self) -> u16 {
        self.http_port.wrapping_add(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportConfig {
    pub enabled: bool,
    pub url: String,
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_REPORT_URL.to_string(),
            interval_secs: 60,
            timeout_ms: 5_000,
        }
    }
}

impl ReportConfig {
    pub fn sanitize(&mut self) {
        self.interval_secs = self.interval_secs.clamp(5, 86_400);
        self.timeout_ms = self.timeout_ms.clamp(500, 60_000);
        if self.url.trim().is_empty() {
            self.url = DEFAULT_REPORT_URL.to_string();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    /// Frames wider than this skip analysis and go out as plain JPEG.
    pub passthrough_width: usize,
    pub analysis_quality: u8,
    pub passthrough_quality: u8,
    pub darken_offset: u8,
    pub timing_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            passthrough_width: 400,
            analysis_quality: 90,
            passthrough_quality: 80,
            darken_offset: 25,
            timing_depth: 20,
        }
    }
}

impl StreamConfig {
    pub fn sanitize(&mut self) {
        self.analysis_quality = self.analysis_quality.clamp(1, 100);
        self.passthrough_quality = self.passthrough_quality.clamp(1, 100);
        self.timing_depth = self.timing_depth.min(256);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.report.sanitize();
        self.stream.sanitize();
    }
}
