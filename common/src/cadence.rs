pub const AP_SCREEN_INTERVAL_MS: u64 = 2_000;
pub const DISPLAY_INTERVAL_MS: u64 = 5_000;

/// Non-blocking periodic timer checked against a monotonic millisecond tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period_ms: u64,
    last_run_ms: Option<u64>,
}

impl Cadence {
    /// First run is due immediately ("never run" sentinel).
    pub fn immediate(period_ms: u64) -> Self {
        Self {
            period_ms,
            last_run_ms: None,
        }
    }

    /// First run is due one full period after `start_ms`.
    pub fn anchored(period_ms: u64, start_ms: u64) -> Self {
        Self {
            period_ms,
            last_run_ms: Some(start_ms),
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        match self.last_run_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.period_ms,
        }
    }

    /// Marks the run and returns true when due.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.last_run_ms = Some(now_ms);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    ShowAccessPoint,
    RefreshDisplay,
    SendReport,
}

/// The three cadences driven by the main loop. Each keeps its own reference
/// timestamp, so display and report can both fire in the same pass.
#[derive(Debug, Clone)]
pub struct LoopScheduler {
    ap_screen: Cadence,
    display: Cadence,
    report: Cadence,
}

impl LoopScheduler {
    pub fn new(report_interval_ms: u64, boot_ms: u64) -> Self {
        Self {
            ap_screen: Cadence::immediate(AP_SCREEN_INTERVAL_MS),
            display: Cadence::anchored(DISPLAY_INTERVAL_MS, boot_ms),
            report: Cadence::immediate(report_interval_ms),
        }
    }

    pub fn due_actions(&mut self, now_ms: u64, configured: bool) -> Vec<LoopAction> {
        let mut actions = Vec::new();

        if !configured {
            if self.ap_screen.poll(now_ms) {
                actions.push(LoopAction::ShowAccessPoint);
            }
            return actions;
        }

        if self.display.poll(now_ms) {
            actions.push(LoopAction::RefreshDisplay);
        }
        if self.report.poll(now_ms) {
            actions.push(LoopAction::SendReport);
        }

        actions
    }
}
