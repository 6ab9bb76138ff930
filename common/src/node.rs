use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};

use crate::{
    cadence::{LoopAction, LoopScheduler},
    command::{decode_response, RemoteCommand},
    config::{configured_flag, factory_reset, NodeConfig, KEY_READING_TIME},
    provisioning::{AP_PASSWORD, AP_SSID},
    screen::Screen,
    store::KvStore,
    traits::{ReportTransport, SensorReader, StatusDisplay},
    types::{ConnectionStatus, ReadingReport},
};

pub const REBOOT_DELAY_MS: u64 = 2_000;
pub const FACTORY_RESET_DELAY_MS: u64 = 2_000;
pub const INTERVAL_CHANGE_DELAY_MS: u64 = 1_000;

/// What the platform must do after a loop pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Continue,
    Restart { delay_ms: u64 },
}

/// Restart request raised outside the loop, e.g. by the provisioning web
/// handler, and honoured at the start of the next pass.
#[derive(Debug, Clone, Default)]
pub struct RestartLatch {
    pending: Arc<Mutex<Option<u64>>>,
}

impl RestartLatch {
    pub fn request(&self, delay_ms: u64) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay_ms);
    }

    pub fn take(&self) -> Option<u64> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Transient runtime state. Reset on every boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub connection: ConnectionStatus,
    pub screen_enabled: bool,
    /// Station association failed this session; AP behaviour without
    /// touching the persisted flag.
    pub ap_fallback: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Unknown,
            screen_enabled: true,
            ap_fallback: false,
        }
    }
}

pub struct Node<S, R, D, T> {
    config: NodeConfig,
    store: S,
    sensor: R,
    display: D,
    transport: T,
    restart: RestartLatch,
    scheduler: LoopScheduler,
    state: DeviceState,
}

impl<S, R, D, T> Node<S, R, D, T>
where
    S: KvStore,
    R: SensorReader,
    D: StatusDisplay,
    T: ReportTransport,
{
    pub fn new(
        config: NodeConfig,
        store: S,
        sensor: R,
        display: D,
        transport: T,
        restart: RestartLatch,
        boot_ms: u64,
    ) -> Self {
        let scheduler = LoopScheduler::new(config.reading_interval_ms(), boot_ms);
        Self {
            config,
            store,
            sensor,
            display,
            transport,
            restart,
            scheduler,
            state: DeviceState::default(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn enter_ap_fallback(&mut self) {
        warn!("station unavailable; serving access point until next restart");
        self.state.ap_fallback = true;
    }

    /// Re-read from the store on every call. A session that booted
    /// unconfigured stays unconfigured until the next boot.
    pub fn is_configured(&self) -> bool {
        if self.state.ap_fallback || !self.config.configured {
            return false;
        }
        configured_flag(&self.store).unwrap_or_else(|err| {
            warn!("failed to read configured flag: {err}");
            self.config.configured
        })
    }

    /// One pass of the cooperative main loop.
    pub fn poll(&mut self, now_ms: u64) -> Poll {
        if let Some(delay_ms) = self.restart.take() {
            info!("restart requested; restarting in {delay_ms} ms");
            return Poll::Restart { delay_ms };
        }

        let configured = self.is_configured();
        for action in self.scheduler.due_actions(now_ms, configured) {
            let outcome = match action {
                LoopAction::ShowAccessPoint => {
                    self.show_access_point();
                    Poll::Continue
                }
                LoopAction::RefreshDisplay => {
                    self.refresh_display();
                    Poll::Continue
                }
                LoopAction::SendReport => self.send_report(),
            };
            if outcome != Poll::Continue {
                return outcome;
            }
        }

        Poll::Continue
    }

    pub fn handle_command(&mut self, command: RemoteCommand) -> Poll {
        info!("remote command `{}`", command.token());
        match command {
            RemoteCommand::DisableScreen => {
                self.state.screen_enabled = false;
                if let Err(err) = self.display.clear() {
                    warn!("failed to blank display: {err}");
                }
                Poll::Continue
            }
            RemoteCommand::EnableScreen => {
                self.state.screen_enabled = true;
                Poll::Continue
            }
            RemoteCommand::Reboot => {
                self.show(&Screen::message("Rebooting...", ""));
                Poll::Restart {
                    delay_ms: REBOOT_DELAY_MS,
                }
            }
            RemoteCommand::ChangeReadingTime(minutes) => {
                // Stored verbatim; the next boot's load path validates it.
                if let Err(err) = self.store.set_str(KEY_READING_TIME, &minutes) {
                    warn!("failed to persist reading time `{minutes}`: {err}");
                    return Poll::Continue;
                }
                self.show(&Screen::message("Interval updated", format!("{minutes} min")));
                Poll::Restart {
                    delay_ms: INTERVAL_CHANGE_DELAY_MS,
                }
            }
            RemoteCommand::FactoryReset => {
                if let Err(err) = factory_reset(&mut self.store) {
                    warn!("factory reset failed: {err}");
                    return Poll::Continue;
                }
                self.show(&Screen::message("Factory reset", "Restarting..."));
                Poll::Restart {
                    delay_ms: FACTORY_RESET_DELAY_MS,
                }
            }
            RemoteCommand::Unknown(token) => {
                info!("ignoring unknown command `{token}`");
                Poll::Continue
            }
        }
    }

    fn show(&mut self, screen: &Screen) {
        if !self.state.screen_enabled {
            return;
        }
        if let Err(err) = self.display.render(screen) {
            warn!("display render failed: {err}");
        }
    }

    fn show_access_point(&mut self) {
        let screen = Screen::AccessPoint {
            ssid: AP_SSID,
            password: AP_PASSWORD,
            device_id: self.config.device_id.clone(),
        };
        self.show(&screen);
    }

    fn refresh_display(&mut self) {
        if !self.state.screen_enabled {
            return;
        }

        let device_id = self.config.device_id.clone();
        let status = self.state.connection;
        let screen = match self.sensor.read() {
            Ok(celsius) => Screen::Reading {
                celsius,
                device_id,
                status,
            },
            Err(err) => {
                warn!("display refresh: {err}");
                Screen::SensorFault { device_id, status }
            }
        };
        self.show(&screen);
    }

    fn send_report(&mut self) -> Poll {
        let final_value = match self.sensor.read() {
            Ok(value) => value,
            Err(err) => {
                warn!("skipping report: {err}");
                return Poll::Continue;
            }
        };

        let report = ReadingReport {
            device_id: self.config.device_id.clone(),
            final_value,
        };
        let body = match serde_json::to_vec(&report) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode report: {err}");
                return Poll::Continue;
            }
        };

        let url = self.config.report_url();
        match self.transport.post_json(&url, &body) {
            Ok(reply) if reply.is_success() => {
                self.state.connection = ConnectionStatus::Online;
                info!("reported {final_value:.1} to {url}");
                match decode_response(&reply.body) {
                    Some(command) => self.handle_command(command),
                    None => Poll::Continue,
                }
            }
            Ok(reply) => {
                warn!("report rejected with HTTP {} (body {} bytes)", reply.status, reply.body.len());
                self.state.connection = ConnectionStatus::Offline;
                Poll::Continue
            }
            Err(err) => {
                warn!("report failed: {err}");
                self.state.connection = ConnectionStatus::Offline;
                Poll::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{default_api_base_url, KEY_IS_CONFIGURED, KEY_STA_PASSWORD, KEY_STA_SSID},
        error::{DisplayError, SensorError, TransportError},
        provisioning::{plan_boot, provision, BootMode, ProvisioningForm},
        store::MemoryStore,
        types::HttpReply,
    };

    const MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0x1a, 0x2b, 0x3c];

    struct FakeSensor {
        values: VecDeque<Result<f32, String>>,
        reads: usize,
    }

    impl FakeSensor {
        fn steady(value: f32) -> Self {
            Self {
                values: VecDeque::from([Ok(value)]),
                reads: 0,
            }
        }
    }

    impl SensorReader for FakeSensor {
        fn read(&mut self) -> Result<f32, SensorError> {
            self.reads += 1;
            let next = if self.values.len() > 1 {
                self.values.pop_front()
            } else {
                self.values.front().cloned()
            };
            next.unwrap_or(Ok(0.0)).map_err(SensorError::Read)
        }
    }

    #[derive(Default)]
    struct FakeDisplay {
        rendered: Vec<Screen>,
        clears: usize,
    }

    impl StatusDisplay for FakeDisplay {
        fn render(&mut self, screen: &Screen) -> Result<(), DisplayError> {
            self.rendered.push(screen.clone());
            Ok(())
        }

        fn clear(&mut self) -> Result<(), DisplayError> {
            self.clears += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        replies: VecDeque<Result<HttpReply, TransportError>>,
        posts: Vec<(String, serde_json::Value)>,
    }

    impl FakeTransport {
        fn replying(bodies: &[&str]) -> Self {
            Self {
                replies: bodies
                    .iter()
                    .map(|body| {
                        Ok(HttpReply {
                            status: 200,
                            body: body.as_bytes().to_vec(),
                        })
                    })
                    .collect(),
                posts: Vec::new(),
            }
        }
    }

    impl ReportTransport for FakeTransport {
        fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError> {
            self.posts
                .push((url.to_string(), serde_json::from_slice(body).unwrap()));
            self.replies.pop_front().unwrap_or(Ok(HttpReply {
                status: 200,
                body: b"{}".to_vec(),
            }))
        }
    }

    type TestNode = Node<MemoryStore, FakeSensor, FakeDisplay, FakeTransport>;

    fn configured_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.set_str(KEY_STA_SSID, "HomeNet").unwrap();
        store.set_str(KEY_STA_PASSWORD, "secret123").unwrap();
        store.set_bool(KEY_IS_CONFIGURED, true).unwrap();
        store
    }

    fn boot(mut store: MemoryStore, transport: FakeTransport) -> TestNode {
        let plan = plan_boot(&mut store, MAC).unwrap();
        Node::new(
            plan.config,
            store,
            FakeSensor::steady(21.5),
            FakeDisplay::default(),
            transport,
            RestartLatch::default(),
            0,
        )
    }

    #[test]
    fn first_report_fires_at_boot_with_the_wire_body() {
        let mut node = boot(configured_store(), FakeTransport::default());

        assert_eq!(node.poll(0), Poll::Continue);

        let (url, body) = &node.transport().posts[0];
        assert_eq!(
            url,
            &format!("{}/sensor-readings/", default_api_base_url().trim_end_matches('/'))
        );
        assert_eq!(
            body,
            &serde_json::json!({ "device_id": "HG-246F281A2B3C", "final_value": 21.5 })
        );
        assert_eq!(node.state().connection, ConnectionStatus::Online);
    }

    #[test]
    fn reports_honour_the_full_interval_after_the_first() {
        let mut node = boot(configured_store(), FakeTransport::default());

        node.poll(0);
        node.poll(899_999);
        assert_eq!(node.transport().posts.len(), 1);
        node.poll(900_000);
        assert_eq!(node.transport().posts.len(), 2);
    }

    #[test]
    fn each_cadence_reads_its_own_sample() {
        let mut store = configured_store();
        store.set_str(KEY_READING_TIME, "1").unwrap();
        let mut node = boot(store, FakeTransport::default());

        node.poll(0);
        node.poll(60_000);

        // Report at 0, then display and report both due at 60 000.
        assert_eq!(node.sensor.reads, 3);
        assert_eq!(node.transport().posts.len(), 2);
        assert_eq!(node.display().rendered.len(), 1);
    }

    #[test]
    fn unconfigured_node_never_reads_or_sends() {
        let mut node = boot(MemoryStore::new(), FakeTransport::default());

        for now in (0..30_000).step_by(500) {
            assert_eq!(node.poll(now), Poll::Continue);
        }

        assert_eq!(node.sensor.reads, 0);
        assert!(node.transport().posts.is_empty());
        assert_eq!(node.display().rendered.len(), 15);
        assert!(matches!(
            node.display().rendered[0],
            Screen::AccessPoint { ssid: "TempGuard", .. }
        ));
    }

    #[test]
    fn failed_association_falls_back_without_persisting() {
        let mut node = boot(configured_store(), FakeTransport::default());
        node.enter_ap_fallback();

        node.poll(0);
        assert!(node.transport().posts.is_empty());
        assert!(matches!(node.display().rendered[0], Screen::AccessPoint { .. }));
        assert_eq!(node.store().get_bool(KEY_IS_CONFIGURED).unwrap(), Some(true));

        let mut store = node.into_store();
        let plan = plan_boot(&mut store, MAC).unwrap();
        assert!(matches!(plan.mode, BootMode::Station { .. }));
    }

    #[test]
    fn transport_failures_mark_offline_and_retry_next_cadence() {
        let transport = FakeTransport {
            replies: VecDeque::from([
                Err(TransportError::Request("timed out".to_string())),
                Ok(HttpReply {
                    status: 503,
                    body: b"busy".to_vec(),
                }),
                Ok(HttpReply {
                    status: 200,
                    body: Vec::new(),
                }),
            ]),
            posts: Vec::new(),
        };
        let mut store = configured_store();
        store.set_str(KEY_READING_TIME, "1").unwrap();
        let mut node = boot(store, transport);

        for now in [0, 60_000, 120_000] {
            assert_eq!(node.poll(now), Poll::Continue);
            assert_eq!(node.state().connection, ConnectionStatus::Offline);
        }
        node.poll(180_000);
        assert_eq!(node.state().connection, ConnectionStatus::Online);
    }

    #[test]
    fn sensor_failure_skips_the_report_and_shows_a_fault() {
        let mut node = boot(configured_store(), FakeTransport::default());
        node.sensor = FakeSensor {
            values: VecDeque::from([Err("checksum mismatch".to_string())]),
            reads: 0,
        };

        node.poll(0);
        node.poll(5_000);

        assert!(node.transport().posts.is_empty());
        assert!(matches!(
            node.display().rendered[0],
            Screen::SensorFault { .. }
        ));
    }

    #[test]
    fn disable_screen_silences_the_display_until_enabled() {
        let transport = FakeTransport::replying(&[r#"{"command":"disable_screen"}"#]);
        let mut node = boot(configured_store(), transport);

        node.poll(0);
        assert!(!node.state().screen_enabled);
        assert_eq!(node.display().clears, 1);

        node.poll(5_000);
        node.poll(10_000);
        assert!(node.display().rendered.is_empty());

        assert_eq!(node.handle_command(RemoteCommand::EnableScreen), Poll::Continue);
        node.poll(15_000);
        assert_eq!(node.display().rendered.len(), 1);
    }

    #[test]
    fn change_reading_time_persists_the_raw_payload_and_restarts() {
        for payload in ["30", "5000", "soon"] {
            let body = format!(r#"{{"command":"change_reading_time","payload":"{payload}"}}"#);
            let mut node = boot(configured_store(), FakeTransport::replying(&[body.as_str()]));

            assert_eq!(
                node.poll(0),
                Poll::Restart {
                    delay_ms: INTERVAL_CHANGE_DELAY_MS
                }
            );
            assert_eq!(
                node.store().get_str(KEY_READING_TIME).unwrap().as_deref(),
                Some(payload)
            );
        }
    }

    #[test]
    fn out_of_range_interval_is_corrected_on_the_next_boot() {
        let body = r#"{"command":"change_reading_time","payload":"5000"}"#;
        let mut node = boot(configured_store(), FakeTransport::replying(&[body]));
        node.poll(0);

        let node = boot(node.into_store(), FakeTransport::default());
        assert_eq!(node.config().reading_minutes, 15);
        assert_eq!(
            node.store().get_str(KEY_READING_TIME).unwrap().as_deref(),
            Some("15")
        );
    }

    #[test]
    fn factory_reset_returns_to_access_point_mode_after_reboot() {
        let transport = FakeTransport::replying(&[r#"{"command":"factory_reset"}"#]);
        let mut node = boot(configured_store(), transport);

        assert_eq!(
            node.poll(0),
            Poll::Restart {
                delay_ms: FACTORY_RESET_DELAY_MS
            }
        );

        let mut store = node.into_store();
        assert_eq!(store.get_str(KEY_STA_SSID).unwrap(), None);
        let plan = plan_boot(&mut store, MAC).unwrap();
        assert_eq!(plan.mode, BootMode::AccessPoint);
        assert_eq!(plan.config.device_id, "HG-246F281A2B3C");
    }

    #[test]
    fn reboot_shows_a_message_and_restarts() {
        let transport = FakeTransport::replying(&[r#"{"command":"reboot"}"#]);
        let mut node = boot(configured_store(), transport);

        assert_eq!(
            node.poll(0),
            Poll::Restart {
                delay_ms: REBOOT_DELAY_MS
            }
        );
        assert_eq!(
            node.display().rendered,
            vec![Screen::message("Rebooting...", "")]
        );
    }

    #[test]
    fn unknown_and_malformed_commands_are_ignored() {
        let transport = FakeTransport::replying(&[
            r#"{"command":"launch"}"#,
            "not json",
            r#"{"payload":"30"}"#,
        ]);
        let mut store = configured_store();
        store.set_str(KEY_READING_TIME, "1").unwrap();
        let mut node = boot(store, transport);

        for now in [0, 60_000, 120_000] {
            assert_eq!(node.poll(now), Poll::Continue);
            assert_eq!(node.state().connection, ConnectionStatus::Online);
        }
        assert_eq!(
            node.store().get_str(KEY_READING_TIME).unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn latch_restart_wins_over_due_work() {
        let latch = RestartLatch::default();
        let mut store = MemoryStore::new();
        let plan = plan_boot(&mut store, MAC).unwrap();
        let mut node = Node::new(
            plan.config,
            store,
            FakeSensor::steady(20.0),
            FakeDisplay::default(),
            FakeTransport::default(),
            latch.clone(),
            0,
        );

        latch.request(5_000);
        assert_eq!(node.poll(0), Poll::Restart { delay_ms: 5_000 });
        assert_eq!(latch.take(), None);
        assert!(node.display().rendered.is_empty());
    }

    #[test]
    fn provisioning_during_an_access_point_session_sends_nothing() {
        let mut node = boot(MemoryStore::new(), FakeTransport::default());
        assert_eq!(node.poll(0), Poll::Continue);

        let form = ProvisioningForm::from_urlencoded(b"ssid=HomeNet&password=x").unwrap();
        provision(&mut node.store, &form).unwrap();

        for now in [50, 2_000, 5_000, 60_000] {
            assert_eq!(node.poll(now), Poll::Continue);
        }
        assert!(!node.is_configured());
        assert!(node.transport().posts.is_empty());
        assert_eq!(node.sensor.reads, 0);
        assert_eq!(node.state().connection, ConnectionStatus::Unknown);

        let plan = plan_boot(&mut node.into_store(), MAC).unwrap();
        assert!(matches!(plan.mode, BootMode::Station { .. }));
    }

    #[test]
    fn cleared_flag_is_noticed_within_the_session() {
        let mut node = boot(configured_store(), FakeTransport::default());
        assert!(node.is_configured());

        node.store.set_bool(KEY_IS_CONFIGURED, false).unwrap();

        assert!(!node.is_configured());
        node.poll(1);
        assert!(node.transport().posts.is_empty());
    }
}
