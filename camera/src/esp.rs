use core::convert::TryInto;
use std::{
    ffi::c_void,
    net::Ipv4Addr,
    ptr::{self, NonNull},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{modem::Modem, prelude::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::camera,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use coffeecam_common::{
    apply_control, report_level, restore_sensor, CameraFrame, ChunkSink, CodecError,
    ControlOutcome, ControlRequest, FrameCodec, FramePipeline, FrameSource, NetworkConfig,
    PixelBuffer, PixelFormat, ReportConfig, ReportError, ReportResponse, ReportTransport,
    RunningAverage, RuntimeConfig, Sensor, SensorControl, SensorError, SensorStatus,
    SettingsStore, SettingsTable, SharedSettings, SharedTiming, SinkError, Slot, StatusReport,
    StoreError, StreamConfig, STREAM_CONTENT_TYPE,
};

const NVS_NAMESPACE: &str = "coffeecam";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const REPORT_BODY_LIMIT: usize = 1024;
const REPORT_STACK_SIZE: usize = 16 * 1024;

const INDEX_HTML_GZ: &[u8] = include_bytes!("../web/index.html.gz");

/// AI-Thinker ESP32-CAM wiring.
mod pins {
    pub const PWDN: i32 = 32;
    pub const RESET: i32 = -1;
    pub const XCLK: i32 = 0;
    pub const SIOD: i32 = 26;
    pub const SIOC: i32 = 27;
    pub const D7: i32 = 35;
    pub const D6: i32 = 34;
    pub const D5: i32 = 39;
    pub const D4: i32 = 36;
    pub const D3: i32 = 21;
    pub const D2: i32 = 19;
    pub const D1: i32 = 18;
    pub const D0: i32 = 5;
    pub const VSYNC: i32 = 25;
    pub const HREF: i32 = 23;
    pub const PCLK: i32 = 22;
}

#[derive(Clone)]
struct SharedState {
    settings: SharedSettings,
    sensor: Arc<Mutex<EspSensor>>,
    timing: SharedTiming,
    store: NvsSettingsStore,
    stream: StreamConfig,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// Settings table kept as one NVS byte per slot.
#[derive(Clone)]
struct NvsSettingsStore {
    nvs: NvsStore,
}

/// Driver frame buffer. Returned to the driver on drop.
struct EspFrame {
    fb: NonNull<camera::camera_fb_t>,
}

#[derive(Clone, Copy, Default)]
struct EspCamera;

#[derive(Clone, Copy, Default)]
struct EspCodec;

/// Handle on the driver's `sensor_t` function table.
#[derive(Default)]
struct EspSensor;

struct ResponseSink<W> {
    writer: W,
}

struct EspReportTransport {
    timeout: Duration,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, static_ip={}, port={}",
        runtime.network.wifi_ssid, runtime.network.use_static_ip, runtime.network.http_port,
    );

    init_camera().context("camera init failed")?;
    info!("camera initialized");

    let settings_store = NvsSettingsStore {
        nvs: nvs_store.clone(),
    };
    let table = settings_store.load().unwrap_or_else(|err| {
        warn!("failed to load settings from NVS: {err}");
        SettingsTable::default()
    });

    let mut sensor = EspSensor;
    let rejected = restore_sensor(&mut sensor, &table);
    if rejected > 0 {
        warn!("{rejected} persisted sensor settings were rejected");
    }

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let shared_state = SharedState {
        settings: Arc::new(Mutex::new(table)),
        sensor: Arc::new(Mutex::new(sensor)),
        timing: Arc::new(Mutex::new(RunningAverage::new(runtime.stream.timing_depth))),
        store: settings_store,
        stream: runtime.stream,
    };

    let server = create_http_server(shared_state.clone(), runtime.network.http_port)?;
    let stream_server = create_stream_server(shared_state.clone(), runtime.network.stream_port())?;
    info!(
        "camera ready: http://<ip>:{}/ stream on :{}",
        runtime.network.http_port,
        runtime.network.stream_port()
    );

    spawn_report_loop(shared_state, runtime.report.clone())?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let _stream_server = stream_server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_camera() -> anyhow::Result<()> {
    let psram = unsafe { esp_idf_svc::sys::esp_psram_is_initialized() };
    let (frame_size, jpeg_quality, fb_count) = if psram {
        (camera::framesize_t_FRAMESIZE_UXGA, 10, 2)
    } else {
        (camera::framesize_t_FRAMESIZE_SVGA, 12, 1)
    };

    let config = camera::camera_config_t {
        pin_pwdn: pins::PWDN,
        pin_reset: pins::RESET,
        pin_xclk: pins::XCLK,
        __bindgen_anon_1: camera::camera_config_t__bindgen_ty_1 {
            pin_sccb_sda: pins::SIOD,
        },
        __bindgen_anon_2: camera::camera_config_t__bindgen_ty_2 {
            pin_sccb_scl: pins::SIOC,
        },
        pin_d7: pins::D7,
        pin_d6: pins::D6,
        pin_d5: pins::D5,
        pin_d4: pins::D4,
        pin_d3: pins::D3,
        pin_d2: pins::D2,
        pin_d1: pins::D1,
        pin_d0: pins::D0,
        pin_vsync: pins::VSYNC,
        pin_href: pins::HREF,
        pin_pclk: pins::PCLK,
        xclk_freq_hz: 20_000_000,
        ledc_timer: esp_idf_svc::sys::ledc_timer_t_LEDC_TIMER_0,
        ledc_channel: esp_idf_svc::sys::ledc_channel_t_LEDC_CHANNEL_0,
        pixel_format: camera::pixformat_t_PIXFORMAT_JPEG,
        frame_size,
        jpeg_quality,
        fb_count,
        fb_location: if psram {
            camera::camera_fb_location_t_CAMERA_FB_IN_PSRAM
        } else {
            camera::camera_fb_location_t_CAMERA_FB_IN_DRAM
        },
        grab_mode: camera::camera_grab_mode_t_CAMERA_GRAB_WHEN_EMPTY,
        ..Default::default()
    };

    let rc = unsafe { camera::esp_camera_init(&config) };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("esp_camera_init failed with code 0x{rc:x}"));
    }

    // Start small so the default view goes through the analyzer.
    if let Err(err) = EspSensor.apply(SensorControl::Framesize, 5) {
        warn!("failed to set initial framesize: {err}");
    }
    Ok(())
}

fn create_http_server(state: SharedState, port: u16) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        http_port: port,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(
            200,
            Some("OK"),
            &[("Content-Type", "text/html"), ("Content-Encoding", "gzip")],
        )?
        .write_all(INDEX_HTML_GZ)?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/status", Method::Get, move |req| {
            let sensor = state.sensor.lock().unwrap().status();
            let status = StatusReport::build(&sensor, &state.settings.lock().unwrap());
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/control", Method::Get, move |req| {
            let uri = req.uri().to_string();
            let query = uri.split_once('?').map(|(_, query)| query).unwrap_or_default();
            let request = match ControlRequest::from_query(query) {
                Ok(request) => request,
                Err(err) => {
                    warn!("rejected control query: {err}");
                    return write_error(req, 404, &err.to_string());
                }
            };

            let outcome = {
                let mut sensor = state.sensor.lock().unwrap();
                let mut table = state.settings.lock().unwrap();
                apply_control(&request, &mut *sensor, &mut table, &state.store)
            };

            match outcome {
                ControlOutcome::Rejected(err) => write_error(req, 500, &err.to_string()),
                ControlOutcome::Applied | ControlOutcome::Ignored => {
                    req.into_response(200, Some("OK"), &[("Access-Control-Allow-Origin", "*")])?;
                    Ok(())
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/capture", Method::Get, move |req| {
            let output = match state.pipeline().capture() {
                Ok(output) => output,
                Err(reason) => {
                    warn!("capture failed: {reason}");
                    req.into_status_response(500)?;
                    return Ok(());
                }
            };

            let len = output.payload.len().to_string();
            let mut headers = vec![
                ("Content-Type", "image/jpeg"),
                ("Content-Disposition", "inline; filename=capture.jpg"),
            ];
            if !output.chunked {
                headers.push(("Content-Length", len.as_str()));
            }

            let response = req.into_response(200, Some("OK"), &headers)?;
            let mut sink = ResponseSink { writer: response };
            output
                .write_to(&mut sink)
                .map_err(|err| anyhow!("capture write failed: {err}"))?;
            info!("JPG: {}B", output.payload.len());
            Ok(())
        })?;
    }

    Ok(server)
}

fn create_stream_server(state: SharedState, port: u16) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        http_port: port,
        // Second httpd instance needs its own control socket.
        ctrl_port: HttpConfiguration::default().ctrl_port.wrapping_add(1),
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/stream", Method::Get, move |req| {
        let response = req.into_response(200, Some("OK"), &[("Content-Type", STREAM_CONTENT_TYPE)])?;
        let mut sink = ResponseSink { writer: response };

        info!("stream client connected");
        let summary = state.pipeline().run_stream(&mut sink);
        info!(
            "stream closed after {} parts ({} skipped): {:?}",
            summary.parts_sent, summary.frames_skipped, summary.end
        );
        Ok(())
    })?;

    Ok(server)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[
            ("Content-Type", "application/json"),
            ("Access-Control-Allow-Origin", "*"),
        ],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[
            ("Content-Type", "application/json; charset=utf-8"),
            ("Access-Control-Allow-Origin", "*"),
        ],
    )?
    .write_all(&body)?;
    Ok(())
}

impl SharedState {
    fn pipeline(&self) -> FramePipeline<EspCamera, EspCodec> {
        FramePipeline::new(
            EspCamera,
            EspCodec,
            self.settings.clone(),
            self.timing.clone(),
            self.stream,
        )
    }
}

fn spawn_report_loop(state: SharedState, report: ReportConfig) -> anyhow::Result<()> {
    if !report.enabled {
        info!("level reporting disabled");
        return Ok(());
    }

    thread::Builder::new()
        .name("level-report".into())
        .stack_size(REPORT_STACK_SIZE)
        .spawn(move || {
            let mut transport = EspReportTransport {
                timeout: Duration::from_millis(report.timeout_ms),
            };
            loop {
                thread::sleep(Duration::from_secs(report.interval_secs));
                if let Err(err) =
                    report_level(&mut state.pipeline(), &state.settings, &mut transport, &report.url)
                {
                    warn!("level report failed: {err}");
                }
            }
        })
        .context("failed to spawn report thread")?;
    Ok(())
}

impl ReportTransport for EspReportTransport {
    fn get(&mut self, url: &str) -> Result<ReportResponse, ReportError> {
        let transport = |err: &dyn std::fmt::Debug| ReportError::Transport(format!("{err:?}"));

        let connection = EspHttpConnection::new(&HttpClientConfiguration {
            timeout: Some(self.timeout),
            ..Default::default()
        })
        .map_err(|err| transport(&err))?;
        let mut client = HttpClient::wrap(connection);

        let request = client
            .request(Method::Get, url, &[])
            .map_err(|err| transport(&err))?;
        let mut response = request.submit().map_err(|err| transport(&err))?;
        let status = response.status();

        let mut body = Vec::new();
        let mut buf = [0_u8; 256];
        while body.len() < REPORT_BODY_LIMIT {
            let read = response.read(&mut buf).map_err(|err| transport(&err))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&buf[..read]);
        }

        Ok(ReportResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl<W> ChunkSink for ResponseSink<W>
where
    W: Write,
{
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.writer
            .write_all(chunk)
            .map_err(|err| SinkError::Write(format!("{err:?}")))
    }
}

impl CameraFrame for EspFrame {
    fn width(&self) -> usize {
        unsafe { self.fb.as_ref().width }
    }

    fn height(&self) -> usize {
        unsafe { self.fb.as_ref().height }
    }

    fn format(&self) -> PixelFormat {
        from_pixformat(unsafe { self.fb.as_ref().format })
    }

    fn data(&self) -> &[u8] {
        let fb = unsafe { self.fb.as_ref() };
        if fb.buf.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(fb.buf, fb.len) }
    }
}

impl Drop for EspFrame {
    fn drop(&mut self) {
        unsafe { camera::esp_camera_fb_return(self.fb.as_ptr()) };
    }
}

impl FrameSource for EspCamera {
    type Frame = EspFrame;

    fn acquire(&mut self) -> Option<EspFrame> {
        let fb = unsafe { camera::esp_camera_fb_get() };
        NonNull::new(fb).map(|fb| EspFrame { fb })
    }
}

impl FrameCodec for EspCodec {
    fn to_pixels<F: CameraFrame>(&self, frame: &F) -> Result<PixelBuffer, CodecError> {
        let mut pixels = PixelBuffer::try_alloc(frame.width(), frame.height())?;
        let data = frame.data();
        let converted = unsafe {
            camera::fmt2rgb888(
                data.as_ptr(),
                data.len(),
                to_pixformat(frame.format()),
                pixels.data_mut().as_mut_ptr(),
            )
        };
        if !converted {
            return Err(CodecError::Decode("fmt2rgb888 failed".to_string()));
        }
        Ok(pixels)
    }

    fn encode(&self, pixels: &PixelBuffer, quality: u8) -> Result<Vec<u8>, CodecError> {
        compress(
            pixels.data(),
            pixels.width(),
            pixels.height(),
            camera::pixformat_t_PIXFORMAT_RGB888,
            quality,
        )
    }

    fn frame_to_jpeg<F: CameraFrame>(&self, frame: &F, quality: u8) -> Result<Vec<u8>, CodecError> {
        compress(
            frame.data(),
            frame.width(),
            frame.height(),
            to_pixformat(frame.format()),
            quality,
        )
    }
}

fn compress(
    data: &[u8],
    width: usize,
    height: usize,
    format: camera::pixformat_t,
    quality: u8,
) -> Result<Vec<u8>, CodecError> {
    let (Ok(width), Ok(height)) = (u16::try_from(width), u16::try_from(height)) else {
        return Err(CodecError::Encode(format!("{width}x{height} is too large")));
    };

    let mut out: *mut u8 = ptr::null_mut();
    let mut out_len = 0_usize;
    let encoded = unsafe {
        camera::fmt2jpg(
            data.as_ptr() as *mut u8,
            data.len(),
            width,
            height,
            format,
            quality,
            &mut out,
            &mut out_len,
        )
    };
    if !encoded || out.is_null() {
        return Err(CodecError::Encode("fmt2jpg failed".to_string()));
    }

    let jpeg = unsafe { std::slice::from_raw_parts(out, out_len) }.to_vec();
    unsafe { esp_idf_svc::sys::free(out as *mut c_void) };
    Ok(jpeg)
}

fn from_pixformat(format: camera::pixformat_t) -> PixelFormat {
    match format {
        camera::pixformat_t_PIXFORMAT_JPEG => PixelFormat::Jpeg,
        camera::pixformat_t_PIXFORMAT_RGB565 => PixelFormat::Rgb565,
        camera::pixformat_t_PIXFORMAT_GRAYSCALE => PixelFormat::Grayscale,
        _ => PixelFormat::Rgb888,
    }
}

fn to_pixformat(format: PixelFormat) -> camera::pixformat_t {
    match format {
        PixelFormat::Jpeg => camera::pixformat_t_PIXFORMAT_JPEG,
        PixelFormat::Rgb565 => camera::pixformat_t_PIXFORMAT_RGB565,
        PixelFormat::Grayscale => camera::pixformat_t_PIXFORMAT_GRAYSCALE,
        PixelFormat::Rgb888 => camera::pixformat_t_PIXFORMAT_RGB888,
    }
}

impl EspSensor {
    fn raw(&self) -> Option<NonNull<camera::sensor_t>> {
        NonNull::new(unsafe { camera::esp_camera_sensor_get() })
    }
}

impl Sensor for EspSensor {
    fn apply(&mut self, control: SensorControl, value: i32) -> Result<(), SensorError> {
        let raw = self.raw().ok_or(SensorError::Unavailable)?;
        let s = raw.as_ptr();
        let table = unsafe { raw.as_ref() };

        let rc = unsafe {
            match control {
                SensorControl::Framesize => table.set_framesize.map(|f| f(s, value as _)),
                SensorControl::Quality => table.set_quality.map(|f| f(s, value)),
                SensorControl::Contrast => table.set_contrast.map(|f| f(s, value)),
                SensorControl::Brightness => table.set_brightness.map(|f| f(s, value)),
                SensorControl::Saturation => table.set_saturation.map(|f| f(s, value)),
                SensorControl::GainCeiling => table.set_gainceiling.map(|f| f(s, value as _)),
                SensorControl::Colorbar => table.set_colorbar.map(|f| f(s, value)),
                SensorControl::Awb => table.set_whitebal.map(|f| f(s, value)),
                SensorControl::Aec => table.set_exposure_ctrl.map(|f| f(s, value)),
                SensorControl::Hmirror => table.set_hmirror.map(|f| f(s, value)),
                SensorControl::Vflip => table.set_vflip.map(|f| f(s, value)),
                SensorControl::AwbGain => table.set_awb_gain.map(|f| f(s, value)),
                SensorControl::AgcGain => table.set_agc_gain.map(|f| f(s, value)),
                SensorControl::AecValue => table.set_aec_value.map(|f| f(s, value)),
                SensorControl::Aec2 => table.set_aec2.map(|f| f(s, value)),
                SensorControl::Dcw => table.set_dcw.map(|f| f(s, value)),
                SensorControl::AeLevel => table.set_ae_level.map(|f| f(s, value)),
            }
        };

        match rc {
            Some(0) => Ok(()),
            _ => Err(SensorError::Rejected { control, value }),
        }
    }

    fn status(&self) -> SensorStatus {
        let Some(raw) = self.raw() else {
            return SensorStatus::default();
        };
        let status = unsafe { raw.as_ref() }.status;

        SensorStatus {
            framesize: status.framesize as u8,
            quality: status.quality,
            brightness: status.brightness,
            contrast: status.contrast,
            saturation: status.saturation,
            awb: status.awb,
            awb_gain: status.awb_gain,
            aec: status.aec,
            aec2: status.aec2,
            ae_level: status.ae_level,
            aec_value: status.aec_value,
            agc_gain: status.agc_gain,
            gainceiling: status.gainceiling as u8,
            bpc: status.bpc,
            wpc: status.wpc,
            raw_gma: status.raw_gma,
            lenc: status.lenc,
            vflip: status.vflip,
            hmirror: status.hmirror,
            dcw: status.dcw,
            colorbar: status.colorbar,
        }
    }

    fn is_jpeg(&self) -> bool {
        self.raw()
            .is_some_and(|raw| unsafe { raw.as_ref() }.pixformat == camera::pixformat_t_PIXFORMAT_JPEG)
    }
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let static_ip = network
        .static_ip
        .ok_or_else(|| anyhow!("static_ip is required when use_static_ip is true"))?;
    let gateway = network
        .gateway
        .ok_or_else(|| anyhow!("gateway is required when use_static_ip is true"))?;
    let subnet = network
        .subnet
        .ok_or_else(|| anyhow!("subnet is required when use_static_ip is true"))?;

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(static_ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(gateway),
                    mask,
                },
                dns: network.dns.map(ipv4_from_octets),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    if let Some(sta_netif) = build_sta_netif(network)? {
        esp_wifi
            .swap_netif_sta(sta_netif)
            .context("failed to apply static IP netif configuration")?;
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }
    if let Ok(ip) = wifi.wifi().sta_netif().get_ip_info() {
        info!("station address {}", ip.ip);
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = self.open()?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn slot_key(slot: Slot) -> String {
    format!("s{}", slot.address())
}

impl SettingsStore for NvsSettingsStore {
    fn load(&self) -> Result<SettingsTable, StoreError> {
        let _guard = self.nvs.lock.lock().unwrap();
        let mut nvs = self
            .nvs
            .open()
            .map_err(|err| StoreError::Backend(format!("{err:#}")))?;

        let mut bytes = *SettingsTable::default().bytes();
        for slot in Slot::ALL {
            let stored = nvs
                .get_u8(&slot_key(slot))
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            if let Some(value) = stored {
                bytes[slot.address()] = value;
            }
        }
        Ok(SettingsTable::from_bytes(bytes))
    }

    fn commit(&self, writes: &[(Slot, u8)]) -> Result<(), StoreError> {
        let _guard = self.nvs.lock.lock().unwrap();
        let mut nvs = self
            .nvs
            .open()
            .map_err(|err| StoreError::Backend(format!("{err:#}")))?;

        for (slot, value) in writes {
            nvs.set_u8(&slot_key(*slot), *value)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        Ok(())
    }
}
