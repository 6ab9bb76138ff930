use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyleBuilder},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use tempguard_common::{
    config::{default_api_base_url, KEY_API_BASE_URL, KEY_DEVICE_ID},
    plan_boot,
    provisioning::{
        associate_with_retry, provision, render_config_page, render_confirmation_page, AP_CHANNEL,
        AP_PASSWORD, AP_SSID, CAPTIVE_PROBE_PATHS, MAX_FORM_BODY, PROVISION_RESTART_DELAY_MS,
    },
    BootMode, DisplayError, HttpReply, KvStore, Node, Poll, ProvisioningError, ProvisioningForm,
    ReportTransport, RestartLatch, Screen, SensorError, SensorReader, StatusDisplay, StoreError,
    TransportError,
    types::{append_reply_chunk, MAX_REPLY_BODY},
};

const NVS_NAMESPACE: &str = "tempguard";
const NVS_MAX_STR: usize = 512;

const DHT11_PIN: i32 = 16;
const OLED_LINE_HEIGHT: i32 = 16;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const LOOP_IDLE_MS: u64 = 50;

type Oled = Ssd1306<
    I2CInterface<I2cDriver<'static>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;

type ServerRequest<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct Dht11Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

struct OledDisplay {
    oled: Oled,
}

struct HttpReporter;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let display = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )
    .map_err(|err| DisplayError::Init(format!("I2C bus: {err:?}")))
    .and_then(OledDisplay::new);
    let mut display = match display {
        Ok(display) => display,
        Err(err) => halt(&err),
    };
    show(&mut display, &Screen::message("TempGuard", "Starting..."));

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let plan = plan_boot(&mut store, factory_mac()).context("failed to load node config")?;
    let station_planned = match &plan.mode {
        BootMode::Station { ssid, .. } => {
            show(&mut display, &Screen::message("Connecting", ssid.as_str()));
            true
        }
        BootMode::AccessPoint => false,
    };

    let sensor = Dht11Sensor::new(pins.gpio16.downgrade())
        .context("failed to initialize DHT11 sensor")?;

    let startup = connect_wifi(modem, sys_loop, nvs_partition, &plan.mode)
        .context("wifi startup failed")?;

    let restart = RestartLatch::default();
    let mut node = Node::new(
        plan.config,
        store.clone(),
        sensor,
        display,
        HttpReporter,
        restart.clone(),
        monotonic_ms(),
    );

    let (_wifi, _server) = match startup {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            (wifi, None)
        }
        WifiStartup::Provisioning(wifi) => {
            if station_planned {
                node.enter_ap_fallback();
            }
            let server = create_provisioning_http_server(store, restart)?;
            (wifi, Some(server))
        }
    };

    loop {
        match node.poll(monotonic_ms()) {
            Poll::Continue => thread::sleep(Duration::from_millis(LOOP_IDLE_MS)),
            Poll::Restart { delay_ms } => {
                info!("restarting in {delay_ms} ms");
                thread::sleep(Duration::from_millis(delay_ms));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        }
    }
}

/// Parks the main task for good.
fn halt(err: &DisplayError) -> ! {
    error!("{err}; halting");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn show(display: &mut OledDisplay, screen: &Screen) {
    if let Err(err) = display.render(screen) {
        warn!("{err}");
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    mode: &BootMode,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let BootMode::Station { ssid, password } = mode else {
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    };

    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let joined = associate_with_retry(
        |_| {
            let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
            if result.is_err() {
                let _ = wifi.disconnect();
            }
            result
        },
        |ms| thread::sleep(Duration::from_millis(ms)),
    );

    if joined {
        return Ok(WifiStartup::Connected(esp_wifi));
    }

    warn!("station `{ssid}` unreachable; falling back to access point for this session");
    let _ = wifi.disconnect();
    let _ = wifi.stop();
    start_provisioning_ap(&mut wifi)?;
    Ok(WifiStartup::Provisioning(esp_wifi))
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: AP_CHANNEL,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{AP_SSID}` (password: `{AP_PASSWORD}`)");
    Ok(())
}

fn create_provisioning_http_server(
    store: NvsStore,
    restart: RestartLatch,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in std::iter::once("/").chain(CAPTIVE_PROBE_PATHS) {
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let page = config_page(&store)?;
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/configure", Method::Post, move |mut req| {
        let mut store = store.clone();
        let result = read_request_body(&mut req)
            .and_then(|body| ProvisioningForm::from_urlencoded(&body))
            .and_then(|form| provision(&mut store, &form).map(|()| form));

        match result {
            Ok(form) => {
                restart.request(PROVISION_RESTART_DELAY_MS);
                let page = render_confirmation_page(form.ssid.as_deref().unwrap_or_default());
                req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                    .write_all(page.as_bytes())?;
                Ok(())
            }
            Err(err) => {
                warn!("provisioning rejected: {err}");
                write_error(req, err.status_code(), &err.to_string())
            }
        }
    })?;

    Ok(server)
}

fn config_page(store: &NvsStore) -> Result<String, StoreError> {
    let device_id = store.get_str(KEY_DEVICE_ID)?.unwrap_or_default();
    let api_base_url = store
        .get_str(KEY_API_BASE_URL)?
        .unwrap_or_else(|| default_api_base_url().to_string());
    Ok(render_config_page(&device_id, &api_base_url))
}

fn read_request_body(req: &mut ServerRequest<'_, '_>) -> Result<Vec<u8>, ProvisioningError> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_FORM_BODY {
        return Err(ProvisioningError::BodyTooLarge(len));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|err| ProvisioningError::InvalidForm(format!("{err:?}")))?;
    }
    Ok(body)
}

fn write_error(req: ServerRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(message.as_bytes())?;
    Ok(())
}

impl NvsStore {
    fn open(&self) -> Result<(MutexGuard<'_, ()>, EspNvs<NvsDefault>), StoreError> {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(format!("{err:?}")))?;
        Ok((guard, nvs))
    }
}

fn backend(err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Backend(format!("{err:?}"))
}

impl KvStore for NvsStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (_guard, nvs) = self.open()?;
        let mut buffer = vec![0_u8; NVS_MAX_STR];
        Ok(nvs
            .get_str(key, &mut buffer)
            .map_err(backend)?
            .map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let (_guard, mut nvs) = self.open()?;
        nvs.set_str(key, value).map_err(backend)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        let (_guard, nvs) = self.open()?;
        Ok(nvs.get_u8(key).map_err(backend)?.map(|value| value != 0))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        let (_guard, mut nvs) = self.open()?;
        nvs.set_u8(key, u8::from(value)).map_err(backend)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let (_guard, mut nvs) = self.open()?;
        nvs.remove(key).map(|_| ()).map_err(backend)
    }
}

impl Dht11Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl SensorReader for Dht11Sensor {
    fn read(&mut self) -> Result<f32, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Read(format!("failed to release DHT11 line: {err:?}")))?;

        let reading = dht11::blocking::read(&mut self.delay, &mut self.pin).map_err(|err| {
            SensorError::Read(format!("DHT11 on GPIO{DHT11_PIN}: {err:?}"))
        })?;

        let celsius = f32::from(reading.temperature);
        // DHT11 rated range.
        if !(0.0..=50.0).contains(&celsius) {
            return Err(SensorError::OutOfRange(celsius));
        }
        info!(
            "[DHT11] {celsius:.1} C, {}% RH",
            reading.relative_humidity
        );
        Ok(celsius)
    }
}

impl OledDisplay {
    fn new(i2c: I2cDriver<'static>) -> Result<Self, DisplayError> {
        let interface = I2CDisplayInterface::new(i2c);
        let mut oled = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        oled.init()
            .map_err(|err| DisplayError::Init(format!("SSD1306: {err:?}")))?;
        Ok(Self { oled })
    }
}

impl StatusDisplay for OledDisplay {
    fn render(&mut self, screen: &Screen) -> Result<(), DisplayError> {
        let style = MonoTextStyleBuilder::new()
            .font(&FONT_6X10)
            .text_color(BinaryColor::On)
            .build();

        self.oled.clear_buffer();
        for (row, line) in (0_i32..).zip(screen.lines()) {
            Text::with_baseline(
                &line,
                Point::new(0, row * OLED_LINE_HEIGHT),
                style,
                Baseline::Top,
            )
            .draw(&mut self.oled)
            .map_err(|err| DisplayError::Draw(format!("{err:?}")))?;
        }
        self.oled
            .flush()
            .map_err(|err| DisplayError::Draw(format!("{err:?}")))
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        self.oled.clear_buffer();
        self.oled
            .flush()
            .map_err(|err| DisplayError::Draw(format!("{err:?}")))
    }
}

impl ReportTransport for HttpReporter {
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError> {
        post_json(url, body).map_err(|err| TransportError::Request(format!("{err:#}")))
    }
}

fn post_json(url: &str, body: &[u8]) -> anyhow::Result<HttpReply> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let content_length = body.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
    ];
    let mut request = client.request(Method::Post, url, &headers)?;
    request.write_all(body).map_err(|e| anyhow!("{e:?}"))?;
    request.flush().map_err(|e| anyhow!("{e:?}"))?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    let mut reply = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        if !append_reply_chunk(&mut reply, &chunk[..read]) {
            warn!(
                "reply from {url} exceeds {MAX_REPLY_BODY} bytes; any command it carries is dropped"
            );
            break;
        }
    }

    Ok(HttpReply {
        status,
        body: reply,
    })
}

fn factory_mac() -> [u8; 6] {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC: esp_err_t={rc}");
    }
    mac
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
