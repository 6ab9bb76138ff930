use log::{info, warn};
use serde::Serialize;

use crate::{error::StoreError, identity::ensure_device_id, store::KvStore};

pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_API_BASE_URL: &str = "api_base_url";
pub const KEY_READING_TIME: &str = "reading_time";
pub const KEY_IS_CONFIGURED: &str = "isConfigured";
pub const KEY_STA_SSID: &str = "sta_ssid";
pub const KEY_STA_PASSWORD: &str = "sta_password";

pub const PERSISTED_KEYS: [&str; 6] = [
    KEY_DEVICE_ID,
    KEY_API_BASE_URL,
    KEY_READING_TIME,
    KEY_IS_CONFIGURED,
    KEY_STA_SSID,
    KEY_STA_PASSWORD,
];

pub const DEFAULT_READING_MINUTES: u32 = 15;
pub const MAX_READING_MINUTES: u32 = 1_440;
pub const FALLBACK_API_BASE_URL: &str = "http://192.168.1.100:8000/api";

pub fn default_api_base_url() -> &'static str {
    option_env!("API_BASE_URL").unwrap_or(FALLBACK_API_BASE_URL)
}

/// Typed view of every persisted key, validated once at load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    pub device_id: String,
    pub api_base_url: String,
    pub reading_minutes: u32,
    pub configured: bool,
    pub sta_ssid: String,
    #[serde(skip_serializing)]
    pub sta_password: String,
}

impl NodeConfig {
    /// Loads the configuration, generating the device id on first boot and
    /// rewriting any persisted value that fails validation.
    pub fn load<S: KvStore>(store: &mut S, mac: [u8; 6]) -> Result<Self, StoreError> {
        let device_id = ensure_device_id(store, mac)?;

        let api_base_url = match store.get_str(KEY_API_BASE_URL)? {
            Some(url) if !url.trim().is_empty() => url,
            _ => {
                let url = default_api_base_url().to_string();
                info!("api base url not set; using default `{url}`");
                store.set_str(KEY_API_BASE_URL, &url)?;
                url
            }
        };

        let reading_minutes = load_reading_minutes(store)?;

        let sta_ssid = store.get_str(KEY_STA_SSID)?.unwrap_or_default();
        let sta_password = store.get_str(KEY_STA_PASSWORD)?.unwrap_or_default();

        let mut configured = store.get_bool(KEY_IS_CONFIGURED)?.unwrap_or(false);
        if configured && sta_ssid.is_empty() {
            warn!("configured flag set without a station SSID; clearing flag");
            store.set_bool(KEY_IS_CONFIGURED, false)?;
            configured = false;
        }

        Ok(Self {
            device_id,
            api_base_url,
            reading_minutes,
            configured,
            sta_ssid,
            sta_password,
        })
    }

    pub fn reading_interval_ms(&self) -> u64 {
        u64::from(self.reading_minutes) * 60_000
    }

    pub fn report_url(&self) -> String {
        format!(
            "{}/sensor-readings/",
            self.api_base_url.trim_end_matches('/')
        )
    }
}

/// Accepts whole minutes in `(0, 1440]`.
pub fn parse_reading_minutes(raw: &str) -> Option<u32> {
    let minutes = raw.trim().parse::<u32>().ok()?;
    (1..=MAX_READING_MINUTES).contains(&minutes).then_some(minutes)
}

fn load_reading_minutes<S: KvStore>(store: &mut S) -> Result<u32, StoreError> {
    let raw = store.get_str(KEY_READING_TIME)?;
    if let Some(minutes) = raw.as_deref().and_then(parse_reading_minutes) {
        return Ok(minutes);
    }

    match raw {
        Some(value) => warn!(
            "invalid reading time `{value}`; resetting to {DEFAULT_READING_MINUTES} minutes"
        ),
        None => info!("reading time not set; using {DEFAULT_READING_MINUTES} minutes"),
    }
    store.set_str(KEY_READING_TIME, &DEFAULT_READING_MINUTES.to_string())?;
    Ok(DEFAULT_READING_MINUTES)
}

/// Flag as the scheduler loop sees it: set and backed by a station SSID.
pub fn configured_flag<S: KvStore>(store: &S) -> Result<bool, StoreError> {
    if !store.get_bool(KEY_IS_CONFIGURED)?.unwrap_or(false) {
        return Ok(false);
    }
    Ok(store
        .get_str(KEY_STA_SSID)?
        .is_some_and(|ssid| !ssid.is_empty()))
}

pub fn factory_reset<S: KvStore>(store: &mut S) -> Result<(), StoreError> {
    for key in PERSISTED_KEYS {
        store.remove(key)?;
    }
    store.set_bool(KEY_IS_CONFIGURED, false)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    const MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0x1a, 0x2b, 0x3c];

    #[test]
    fn invalid_reading_times_fall_back_and_are_rewritten() {
        for raw in ["0", "1441", "-5", "abc", "", "30abc", "99999999999", "1.5"] {
            let mut store = MemoryStore::new();
            store.set_str(KEY_READING_TIME, raw).unwrap();

            let config = NodeConfig::load(&mut store, MAC).unwrap();

            assert_eq!(config.reading_minutes, 15, "input {raw:?}");
            assert_eq!(
                store.get_str(KEY_READING_TIME).unwrap().as_deref(),
                Some("15"),
                "input {raw:?}"
            );
        }
    }

    #[test]
    fn valid_reading_times_are_kept_verbatim() {
        for (raw, expected) in [("1", 1), ("30", 30), (" 45 ", 45), ("1440", 1_440)] {
            let mut store = MemoryStore::new();
            store.set_str(KEY_READING_TIME, raw).unwrap();

            let config = NodeConfig::load(&mut store, MAC).unwrap();

            assert_eq!(config.reading_minutes, expected);
            assert_eq!(store.get_str(KEY_READING_TIME).unwrap().as_deref(), Some(raw));
        }
    }

    #[test]
    fn configured_without_ssid_is_forced_unconfigured() {
        let mut store = MemoryStore::new();
        store.set_bool(KEY_IS_CONFIGURED, true).unwrap();
        store.set_str(KEY_STA_SSID, "").unwrap();

        assert!(!configured_flag(&store).unwrap());

        let config = NodeConfig::load(&mut store, MAC).unwrap();
        assert!(!config.configured);
        assert_eq!(store.get_bool(KEY_IS_CONFIGURED).unwrap(), Some(false));
    }

    #[test]
    fn fresh_store_gets_defaults() {
        let mut store = MemoryStore::new();
        let config = NodeConfig::load(&mut store, MAC).unwrap();

        assert_eq!(config.device_id, "HG-246F281A2B3C");
        assert_eq!(config.api_base_url, default_api_base_url());
        assert_eq!(config.reading_minutes, DEFAULT_READING_MINUTES);
        assert!(!config.configured);
        assert_eq!(config.reading_interval_ms(), 900_000);
    }

    #[test]
    fn report_url_does_not_double_the_slash() {
        let mut store = MemoryStore::new();
        store
            .set_str(KEY_API_BASE_URL, "https://collector.example/api/")
            .unwrap();
        let config = NodeConfig::load(&mut store, MAC).unwrap();

        assert_eq!(
            config.report_url(),
            "https://collector.example/api/sensor-readings/"
        );
    }

    #[test]
    fn factory_reset_clears_everything_but_the_flag() {
        let mut store = MemoryStore::new();
        store.set_str(KEY_STA_SSID, "HomeNet").unwrap();
        store.set_str(KEY_STA_PASSWORD, "secret123").unwrap();
        store.set_bool(KEY_IS_CONFIGURED, true).unwrap();
        NodeConfig::load(&mut store, MAC).unwrap();

        factory_reset(&mut store).unwrap();

        assert_eq!(store.keys().collect::<Vec<_>>(), vec![KEY_IS_CONFIGURED]);
        assert_eq!(store.get_bool(KEY_IS_CONFIGURED).unwrap(), Some(false));
    }
}
