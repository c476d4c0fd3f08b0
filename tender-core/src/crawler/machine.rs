use std::time::Duration;

use serde::Serialize;

use crate::browser::FaultClass;
use crate::config::RecoverySection;

/// The browser operation a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStep {
    Scan,
    CheckNext,
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The portal shows no "next" control.
    LastPage,
    /// The "next" control is present but disabled.
    NextDisabled,
    PageCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    SessionRebuildFailed,
    RebuildLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlState {
    Scanning,
    Paginating,
    Retrying { step: CrawlStep, delay: Duration },
    /// Make the page usable, search again and replay pagination up to the
    /// current page. A crawl starts here with nothing to replay.
    RebuildingPage,
    RebuildingSession { delay: Duration },
    Done(StopReason),
    Aborted(AbortReason),
}

impl CrawlState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CrawlState::Done(_) | CrawlState::Aborted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlEvent {
    PageScanned,
    NextPage,
    Exhausted(StopReason),
    Advanced,
    Fault { step: CrawlStep, class: FaultClass },
    RetryElapsed,
    /// `page` is where replay actually ended, which is lower than requested
    /// when the portal now has fewer pages.
    PageRebuilt { page: u32 },
    PageRebuildFailed,
    SessionRebuilt { page: u32 },
    SessionRebuildFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub page_cooldown: Duration,
    pub failed_page_threshold: u32,
    pub relaunch_delay: Duration,
    pub max_session_rebuilds: u32,
    pub max_pages: u32,
}

impl RecoveryPolicy {
    pub fn from_config(config: &RecoverySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            page_cooldown: Duration::from_millis(config.page_cooldown_ms),
            failed_page_threshold: config.failed_page_threshold.max(1),
            relaunch_delay: Duration::from_millis(config.relaunch_delay_ms),
            max_session_rebuilds: config.max_session_rebuilds,
            max_pages: config.max_pages.max(1),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoverySection::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineCounters {
    pub retries: u32,
    pub page_rebuilds: u32,
    pub session_rebuilds: u32,
    pub failed_pages: u32,
}

/// Pure transition function of the crawl. Holds counters and the logical
/// page index; every delay the driver must honour is carried in the state.
#[derive(Debug, Clone)]
pub struct RecoveryMachine {
    policy: RecoveryPolicy,
    state: CrawlState,
    page_index: u32,
    attempts: u32,
    consecutive_failed_pages: u32,
    counters: MachineCounters,
}

impl RecoveryMachine {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            state: CrawlState::RebuildingPage,
            page_index: 1,
            attempts: 0,
            consecutive_failed_pages: 0,
            counters: MachineCounters::default(),
        }
    }

    pub fn state(&self) -> &CrawlState {
        &self.state
    }

    /// 1-based index of the page the crawl is positioned on.
    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_failed_pages(&self) -> u32 {
        self.consecutive_failed_pages
    }

    pub fn counters(&self) -> &MachineCounters {
        &self.counters
    }

    pub fn on_event(&mut self, event: CrawlEvent) -> &CrawlState {
        if self.state.is_terminal() {
            return &self.state;
        }
        let next = match (&self.state, event) {
            (CrawlState::Scanning, CrawlEvent::PageScanned) => {
                self.attempts = 0;
                self.consecutive_failed_pages = 0;
                CrawlState::Paginating
            }
            (CrawlState::Paginating, CrawlEvent::NextPage) => {
                if self.page_index >= self.policy.max_pages {
                    CrawlState::Done(StopReason::PageCeiling)
                } else {
                    CrawlState::Paginating
                }
            }
            (CrawlState::Paginating, CrawlEvent::Exhausted(reason)) => CrawlState::Done(reason),
            (CrawlState::Paginating, CrawlEvent::Advanced) => {
                self.page_index += 1;
                self.attempts = 0;
                CrawlState::Scanning
            }
            (CrawlState::Scanning | CrawlState::Paginating, CrawlEvent::Fault { step, class }) => {
                self.on_fault(step, class)
            }
            (CrawlState::Retrying { step, .. }, CrawlEvent::RetryElapsed) => match step {
                CrawlStep::Scan => CrawlState::Scanning,
                CrawlStep::CheckNext | CrawlStep::Advance => CrawlState::Paginating,
            },
            (CrawlState::RebuildingPage, CrawlEvent::PageRebuilt { page }) => {
                self.page_index = page.max(1);
                CrawlState::Scanning
            }
            (CrawlState::RebuildingPage, CrawlEvent::PageRebuildFailed) => {
                self.escalate_to_session()
            }
            (CrawlState::RebuildingSession { .. }, CrawlEvent::SessionRebuilt { page }) => {
                self.page_index = page.max(1);
                self.attempts = 0;
                self.consecutive_failed_pages = 0;
                CrawlState::Scanning
            }
            (CrawlState::RebuildingSession { .. }, CrawlEvent::SessionRebuildFailed) => {
                CrawlState::Aborted(AbortReason::SessionRebuildFailed)
            }
            (state, _) => state.clone(),
        };
        self.state = next;
        &self.state
    }

    fn on_fault(&mut self, step: CrawlStep, class: FaultClass) -> CrawlState {
        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            self.attempts = 0;
            self.consecutive_failed_pages += 1;
            self.counters.failed_pages += 1;
            if self.consecutive_failed_pages >= self.policy.failed_page_threshold {
                return self.escalate_to_session();
            }
            return match class {
                FaultClass::Fatal => self.rebuild_page(),
                FaultClass::Soft => {
                    self.counters.retries += 1;
                    CrawlState::Retrying {
                        step,
                        delay: self.policy.page_cooldown,
                    }
                }
            };
        }
        match class {
            FaultClass::Fatal => self.rebuild_page(),
            FaultClass::Soft => {
                self.counters.retries += 1;
                CrawlState::Retrying {
                    step,
                    delay: self.policy.retry_backoff,
                }
            }
        }
    }

    fn rebuild_page(&mut self) -> CrawlState {
        self.counters.page_rebuilds += 1;
        CrawlState::RebuildingPage
    }

    fn escalate_to_session(&mut self) -> CrawlState {
        if self.counters.session_rebuilds >= self.policy.max_session_rebuilds {
            return CrawlState::Aborted(AbortReason::RebuildLimit);
        }
        self.counters.session_rebuilds += 1;
        CrawlState::RebuildingSession {
            delay: self.policy.relaunch_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            page_cooldown: Duration::from_millis(50),
            failed_page_threshold: 3,
            relaunch_delay: Duration::from_millis(100),
            max_session_rebuilds: 2,
            max_pages: 4,
        }
    }

    fn started() -> RecoveryMachine {
        let mut machine = RecoveryMachine::new(policy());
        machine.on_event(CrawlEvent::PageRebuilt { page: 1 });
        machine
    }

    fn soft(step: CrawlStep) -> CrawlEvent {
        CrawlEvent::Fault {
            step,
            class: FaultClass::Soft,
        }
    }

    fn fatal(step: CrawlStep) -> CrawlEvent {
        CrawlEvent::Fault {
            step,
            class: FaultClass::Fatal,
        }
    }

    /// Drives one page to a full failure with soft faults.
    fn fail_page(machine: &mut RecoveryMachine) -> CrawlState {
        for _ in 0..policy().max_attempts - 1 {
            machine.on_event(soft(CrawlStep::Scan));
            machine.on_event(CrawlEvent::RetryElapsed);
        }
        machine.on_event(soft(CrawlStep::Scan)).clone()
    }

    #[test]
    fn starts_with_initial_search() {
        let machine = RecoveryMachine::new(policy());
        assert_eq!(machine.state(), &CrawlState::RebuildingPage);
        assert_eq!(machine.page_index(), 1);
        assert_eq!(machine.counters().page_rebuilds, 0);
    }

    #[test]
    fn happy_path_walks_pages_until_exhausted() {
        let mut machine = started();
        for expected in 1..=2 {
            assert_eq!(machine.page_index(), expected);
            assert_eq!(machine.on_event(CrawlEvent::PageScanned), &CrawlState::Paginating);
            assert_eq!(machine.on_event(CrawlEvent::NextPage), &CrawlState::Paginating);
            assert_eq!(machine.on_event(CrawlEvent::Advanced), &CrawlState::Scanning);
        }
        machine.on_event(CrawlEvent::PageScanned);
        assert_eq!(
            machine.on_event(CrawlEvent::Exhausted(StopReason::NextDisabled)),
            &CrawlState::Done(StopReason::NextDisabled)
        );
        assert_eq!(machine.page_index(), 3);
    }

    #[test]
    fn page_ceiling_stops_before_advancing() {
        let mut machine = started();
        for _ in 1..4 {
            machine.on_event(CrawlEvent::PageScanned);
            machine.on_event(CrawlEvent::NextPage);
            machine.on_event(CrawlEvent::Advanced);
        }
        machine.on_event(CrawlEvent::PageScanned);
        assert_eq!(
            machine.on_event(CrawlEvent::NextPage),
            &CrawlState::Done(StopReason::PageCeiling)
        );
    }

    #[test]
    fn soft_fault_retries_same_step_with_backoff() {
        let mut machine = started();
        machine.on_event(CrawlEvent::PageScanned);
        assert_eq!(
            machine.on_event(soft(CrawlStep::Advance)),
            &CrawlState::Retrying {
                step: CrawlStep::Advance,
                delay: Duration::from_millis(10),
            }
        );
        assert_eq!(machine.on_event(CrawlEvent::RetryElapsed), &CrawlState::Paginating);
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn fatal_fault_rebuilds_page_and_consumes_attempt() {
        let mut machine = started();
        machine.on_event(CrawlEvent::PageScanned);
        machine.on_event(CrawlEvent::NextPage);
        machine.on_event(CrawlEvent::Advanced);
        assert_eq!(
            machine.on_event(fatal(CrawlStep::Scan)),
            &CrawlState::RebuildingPage
        );
        assert_eq!(machine.attempts(), 1);
        assert_eq!(machine.counters().page_rebuilds, 1);
        assert_eq!(
            machine.on_event(CrawlEvent::PageRebuilt { page: 2 }),
            &CrawlState::Scanning
        );
        assert_eq!(machine.page_index(), 2);
    }

    #[test]
    fn exhausted_page_cools_down_below_threshold() {
        let mut machine = started();
        assert_eq!(
            fail_page(&mut machine),
            CrawlState::Retrying {
                step: CrawlStep::Scan,
                delay: Duration::from_millis(50),
            }
        );
        assert_eq!(machine.consecutive_failed_pages(), 1);
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn threshold_triggers_exactly_one_session_rebuild() {
        let mut machine = started();
        fail_page(&mut machine);
        machine.on_event(CrawlEvent::RetryElapsed);
        fail_page(&mut machine);
        machine.on_event(CrawlEvent::RetryElapsed);
        assert_eq!(machine.counters().session_rebuilds, 0);
        assert_eq!(
            fail_page(&mut machine),
            CrawlState::RebuildingSession {
                delay: Duration::from_millis(100),
            }
        );
        assert_eq!(machine.counters().session_rebuilds, 1);
        machine.on_event(CrawlEvent::SessionRebuilt { page: 1 });
        assert_eq!(machine.consecutive_failed_pages(), 0);
        assert_eq!(machine.counters().session_rebuilds, 1);
    }

    #[test]
    fn successful_page_resets_failed_page_counter() {
        let mut machine = started();
        fail_page(&mut machine);
        machine.on_event(CrawlEvent::RetryElapsed);
        fail_page(&mut machine);
        machine.on_event(CrawlEvent::RetryElapsed);
        assert_eq!(machine.consecutive_failed_pages(), 2);
        machine.on_event(CrawlEvent::PageScanned);
        assert_eq!(machine.consecutive_failed_pages(), 0);
        machine.on_event(CrawlEvent::NextPage);
        machine.on_event(CrawlEvent::Advanced);
        fail_page(&mut machine);
        assert_eq!(machine.consecutive_failed_pages(), 1);
        assert_eq!(machine.counters().session_rebuilds, 0);
    }

    #[test]
    fn failed_page_rebuild_escalates_to_session() {
        let mut machine = RecoveryMachine::new(policy());
        assert_eq!(
            machine.on_event(CrawlEvent::PageRebuildFailed),
            &CrawlState::RebuildingSession {
                delay: Duration::from_millis(100),
            }
        );
        assert_eq!(
            machine.on_event(CrawlEvent::SessionRebuildFailed),
            &CrawlState::Aborted(AbortReason::SessionRebuildFailed)
        );
        assert!(machine.on_event(CrawlEvent::PageScanned).is_terminal());
    }

    #[test]
    fn rebuild_cap_aborts() {
        let mut machine = RecoveryMachine::new(policy());
        for _ in 0..2 {
            machine.on_event(CrawlEvent::PageRebuildFailed);
            machine.on_event(CrawlEvent::SessionRebuilt { page: 1 });
            machine.on_event(fatal(CrawlStep::Scan));
        }
        assert_eq!(
            machine.on_event(CrawlEvent::PageRebuildFailed),
            &CrawlState::Aborted(AbortReason::RebuildLimit)
        );
    }

    #[test]
    fn early_replay_stop_moves_position_back() {
        let mut machine = started();
        for _ in 0..2 {
            machine.on_event(CrawlEvent::PageScanned);
            machine.on_event(CrawlEvent::NextPage);
            machine.on_event(CrawlEvent::Advanced);
        }
        machine.on_event(fatal(CrawlStep::Scan));
        machine.on_event(CrawlEvent::PageRebuilt { page: 2 });
        assert_eq!(machine.page_index(), 2);
    }

    #[test]
    fn unrelated_events_leave_state_untouched() {
        let mut machine = started();
        assert_eq!(machine.on_event(CrawlEvent::Advanced), &CrawlState::Scanning);
        assert_eq!(machine.page_index(), 1);
    }
}
