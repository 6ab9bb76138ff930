use std::fmt::Display;

use log::{info, warn};
use serde::Deserialize;

use crate::{
    config::{NodeConfig, KEY_API_BASE_URL, KEY_IS_CONFIGURED, KEY_STA_PASSWORD, KEY_STA_SSID},
    error::{ProvisioningError, StoreError},
    store::KvStore,
};

pub const AP_SSID: &str = "TempGuard";
pub const AP_PASSWORD: &str = "12345678";
pub const AP_CHANNEL: u8 = 1;

pub const WIFI_CONNECT_ATTEMPTS: u32 = 20;
pub const WIFI_RETRY_DELAY_MS: u64 = 500;

pub const MAX_FORM_BODY: usize = 4096;
pub const PROVISION_RESTART_DELAY_MS: u64 = 5_000;

const MAX_SSID_BYTES: usize = 32;
const MAX_PASSWORD_BYTES: usize = 64;

/// Captive portal probes answered with the configuration form.
pub const CAPTIVE_PROBE_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootMode {
    Station { ssid: String, password: String },
    AccessPoint,
}

pub fn boot_mode(config: &NodeConfig) -> BootMode {
    if config.configured && !config.sta_ssid.is_empty() {
        BootMode::Station {
            ssid: config.sta_ssid.clone(),
            password: config.sta_password.clone(),
        }
    } else {
        BootMode::AccessPoint
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPlan {
    pub config: NodeConfig,
    pub mode: BootMode,
}

pub fn plan_boot<S: KvStore>(store: &mut S, mac: [u8; 6]) -> Result<BootPlan, StoreError> {
    let config = NodeConfig::load(store, mac)?;
    let mode = boot_mode(&config);
    match &mode {
        BootMode::Station { ssid, .. } => info!("configured; joining `{ssid}`"),
        BootMode::AccessPoint => info!("unconfigured; starting access point `{AP_SSID}`"),
    }
    Ok(BootPlan { config, mode })
}

/// Runs up to `WIFI_CONNECT_ATTEMPTS` association attempts with a blocking
/// pause after each failure. Returns whether the station came up.
pub fn associate_with_retry<E: Display>(
    mut attempt: impl FnMut(u32) -> Result<(), E>,
    mut pause_ms: impl FnMut(u64),
) -> bool {
    for n in 1..=WIFI_CONNECT_ATTEMPTS {
        match attempt(n) {
            Ok(()) => {
                info!("station associated on attempt {n}/{WIFI_CONNECT_ATTEMPTS}");
                return true;
            }
            Err(err) => warn!("station attempt {n}/{WIFI_CONNECT_ATTEMPTS} failed: {err}"),
        }
        pause_ms(WIFI_RETRY_DELAY_MS);
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisioningForm {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

impl ProvisioningForm {
    pub fn from_urlencoded(body: &[u8]) -> Result<Self, ProvisioningError> {
        if body.len() > MAX_FORM_BODY {
            return Err(ProvisioningError::BodyTooLarge(body.len()));
        }
        serde_urlencoded::from_bytes(body)
            .map_err(|err| ProvisioningError::InvalidForm(err.to_string()))
    }

    fn validate(&self) -> Result<&str, ProvisioningError> {
        let ssid = self
            .ssid
            .as_deref()
            .filter(|ssid| !ssid.trim().is_empty())
            .ok_or(ProvisioningError::MissingSsid)?;
        if ssid.len() > MAX_SSID_BYTES {
            return Err(ProvisioningError::SsidTooLong);
        }
        if self.password.as_deref().unwrap_or_default().len() > MAX_PASSWORD_BYTES {
            return Err(ProvisioningError::PasswordTooLong);
        }
        Ok(ssid)
    }
}

/// Persists submitted credentials and marks the node configured. The
/// transition takes effect on the next boot.
pub fn provision<S: KvStore>(store: &mut S, form: &ProvisioningForm) -> Result<(), ProvisioningError> {
    let ssid = form.validate()?;

    store.set_str(KEY_STA_SSID, ssid)?;
    store.set_str(
        KEY_STA_PASSWORD,
        form.password.as_deref().unwrap_or_default(),
    )?;
    if let Some(url) = form
        .api_base_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        store.set_str(KEY_API_BASE_URL, url)?;
    }
    store.set_bool(KEY_IS_CONFIGURED, true)?;

    info!("provisioned station credentials for `{ssid}`");
    Ok(())
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>TempGuard Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:520px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
"#;

pub fn render_config_page(device_id: &str, api_base_url: &str) -> String {
    format!(
        r#"{PAGE_HEAD}  <h1>TempGuard Setup</h1>
  <p class="muted">Device ID: <code>{device_id}</code></p>
  <form class="card" method="POST" action="/configure">
    <label>Device ID</label><input type="text" value="{device_id}" readonly>
    <label>WiFi SSID</label><input name="ssid" type="text" required maxlength="32">
    <label>WiFi Password</label><input name="password" type="password" maxlength="64">
    <label>API URL</label><input name="api_base_url" type="text" value="{api_base_url}">
    <button type="submit">Save and restart</button>
  </form>
</body>
</html>
"#,
        device_id = escape_html(device_id),
        api_base_url = escape_html(api_base_url),
    )
}

pub fn render_confirmation_page(ssid: &str) -> String {
    format!(
        r#"{PAGE_HEAD}  <h1>Configuration saved</h1>
  <p>The device will join <code>{ssid}</code> and restart in 5 seconds.</p>
</body>
</html>
"#,
        ssid = escape_html(ssid),
    )
}
