use crate::config::ScanConfig;
use crate::scan::classify::truncate_chars;
use crate::scan::consent::ConsentPrompt;
use crate::scan::privilege::PrivilegeProbe;
use crate::scan::{
    CheckOutcome, CheckResult, CheckStatus, PassSummary, ScanCheck, ScanError, ScanEvent,
};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

const OK_MARKER: &str = "OK";

/// Runs the configured checks one pass at a time, strictly in order.
///
/// `start` blocks for the whole pass; callers run it off the async runtime
/// (`spawn_blocking`) and follow progress through the [`ScanEvent`] channel.
pub struct FullScanOrchestrator {
    checks: Vec<ScanCheck>,
    privilege: Arc<dyn PrivilegeProbe>,
    consent: Arc<dyn ConsentPrompt>,
    events: UnboundedSender<ScanEvent>,
    ok_message_max_len: usize,
    error_message_max_len: usize,
    running: AtomicBool,
    statuses: Mutex<Vec<CheckStatus>>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FullScanOrchestrator {
    pub fn new(
        checks: Vec<ScanCheck>,
        privilege: Arc<dyn PrivilegeProbe>,
        consent: Arc<dyn ConsentPrompt>,
        events: UnboundedSender<ScanEvent>,
        cfg: &ScanConfig,
    ) -> Result<Self, ScanError> {
        let mut names = HashSet::new();
        for check in &checks {
            if !names.insert(check.name.as_str()) {
                return Err(ScanError::DuplicateCheck(check.name.clone()));
            }
        }

        let statuses = checks
            .iter()
            .map(|c| CheckStatus::new(c.name.clone(), CheckOutcome::Pending))
            .collect();

        Ok(Self {
            checks,
            privilege,
            consent,
            events,
            ok_message_max_len: cfg.ok_message_max_len,
            error_message_max_len: cfg.error_message_max_len,
            running: AtomicBool::new(false),
            statuses: Mutex::new(statuses),
        })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Latest known state of every check, in execution order.
    pub fn statuses(&self) -> Vec<CheckStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn start(&self) -> Result<PassSummary, ScanError> {
        if !self.privilege.is_elevated() {
            warn!("full scan refused: process is not elevated");
            return Err(ScanError::AdminRequired);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("full scan refused: a pass is already running");
            return Err(ScanError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let started = Instant::now();
        let reset: Vec<CheckStatus> = self
            .checks
            .iter()
            .map(|c| CheckStatus::new(c.name.clone(), CheckOutcome::Pending))
            .collect();
        *self.statuses.lock().unwrap_or_else(|p| p.into_inner()) = reset.clone();
        let _ = self.events.send(ScanEvent::PassStarted { checks: reset });
        info!(checks = self.checks.len(), "full scan started");

        for (index, check) in self.checks.iter().enumerate() {
            self.transition(index, CheckOutcome::Running);
            let outcome = self.execute(check);
            match &outcome {
                CheckOutcome::Failed(message) => {
                    warn!(check = %check.name, message = %message, "check failed")
                }
                other => info!(check = %check.name, outcome = other.label(), "check finished"),
            }
            self.transition(index, outcome);
        }

        let summary = PassSummary {
            checks: self.statuses(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            elapsed = %humantime::format_duration(started.elapsed()),
            failed = summary.count("failed"),
            "full scan finished"
        );
        let _ = self.events.send(ScanEvent::PassFinished(summary.clone()));
        Ok(summary)
    }

    fn execute(&self, check: &ScanCheck) -> CheckOutcome {
        if check.requires_confirmation && !self.consent.ask_yes_no(&check.consent_prompt()) {
            return CheckOutcome::SkippedNoConsent;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| check.run())) {
            Ok(CheckResult::Passed(message)) => {
                if message.chars().count() < self.ok_message_max_len {
                    CheckOutcome::Succeeded(message)
                } else {
                    CheckOutcome::Succeeded(OK_MARKER.to_string())
                }
            }
            Ok(CheckResult::Failed(failure)) if failure.is_not_applicable() => {
                CheckOutcome::SkippedNotApplicable
            }
            Ok(CheckResult::Failed(failure)) => CheckOutcome::Failed(failure.to_string()),
            Err(payload) => {
                let description = panic_description(payload.as_ref());
                warn!(check = %check.name, error = %description, "check action panicked");
                CheckOutcome::Failed(format!(
                    "Error: {}",
                    truncate_chars(&description, self.error_message_max_len)
                ))
            }
        }
    }

    fn transition(&self, index: usize, outcome: CheckOutcome) {
        let status = CheckStatus::new(self.checks[index].name.clone(), outcome);
        {
            let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(slot) = statuses.get_mut(index) {
                *slot = status.clone();
            }
        }
        let _ = self.events.send(ScanEvent::Check(status));
    }
}

pub(crate) fn panic_description(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unexpected panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::classify::Failure;
    use crate::scan::consent::FixedAnswer;
    use crate::scan::ColorHint;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct CountingConsent {
        answer: bool,
        asked: AtomicUsize,
    }

    impl ConsentPrompt for CountingConsent {
        fn ask_yes_no(&self, _prompt: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn orchestrator(
        checks: Vec<ScanCheck>,
        elevated: bool,
        consent: Arc<dyn ConsentPrompt>,
    ) -> (FullScanOrchestrator, UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = unbounded_channel();
        let privilege: Arc<dyn PrivilegeProbe> = Arc::new(move || elevated);
        let orch = FullScanOrchestrator::new(checks, privilege, consent, tx, &ScanConfig::default())
            .expect("unique names");
        (orch, rx)
    }

    fn passing(name: &str, ran: &Arc<AtomicUsize>) -> ScanCheck {
        let ran = Arc::clone(ran);
        ScanCheck::new(name, move || {
            ran.fetch_add(1, Ordering::SeqCst);
            CheckResult::Passed("Done".to_string())
        })
    }

    fn drain(rx: &mut UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn outcomes(orch: &FullScanOrchestrator) -> Vec<CheckOutcome> {
        orch.statuses().into_iter().map(|s| s.outcome).collect()
    }

    #[test]
    fn declined_consent_skips_only_that_check() {
        let ran = Arc::new(AtomicUsize::new(0));
        let consent = Arc::new(CountingConsent {
            answer: false,
            asked: AtomicUsize::new(0),
        });
        let checks = vec![
            passing("first", &ran),
            passing("reboot", &ran).rebooting(),
            passing("last", &ran),
        ];
        let (orch, _rx) = orchestrator(checks, true, consent.clone());

        let summary = orch.start().expect("pass runs");
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(consent.asked.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes(&orch),
            vec![
                CheckOutcome::Succeeded("Done".into()),
                CheckOutcome::SkippedNoConsent,
                CheckOutcome::Succeeded("Done".into()),
            ]
        );
        assert_eq!(summary.checks[1].message, "Skipped by User");
    }

    #[test]
    fn consent_is_asked_every_pass() {
        let ran = Arc::new(AtomicUsize::new(0));
        let consent = Arc::new(CountingConsent {
            answer: true,
            asked: AtomicUsize::new(0),
        });
        let (orch, _rx) = orchestrator(vec![passing("confirm", &ran).with_confirmation()], true, consent.clone());
        orch.start().unwrap();
        orch.start().unwrap();
        assert_eq!(consent.asked.load(Ordering::SeqCst), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_action_fails_without_stopping_the_pass() {
        let ran = Arc::new(AtomicUsize::new(0));
        let checks = vec![
            ScanCheck::new("boom", || panic!("{}", "x".repeat(200))),
            passing("after", &ran),
        ];
        let (orch, _rx) = orchestrator(checks, true, Arc::new(FixedAnswer(true)));

        orch.start().unwrap();
        let statuses = orch.statuses();
        assert_eq!(
            statuses[0].outcome,
            CheckOutcome::Failed(format!("Error: {}", "x".repeat(50)))
        );
        assert_eq!(statuses[1].outcome, CheckOutcome::Succeeded("Done".into()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!orch.is_running());
    }

    #[test]
    fn long_success_message_collapses_to_ok() {
        let checks = vec![
            ScanCheck::new("short", || CheckResult::Passed("Scan Complete".into())),
            ScanCheck::new("long", || CheckResult::Passed("r".repeat(50))),
        ];
        let (orch, _rx) = orchestrator(checks, true, Arc::new(FixedAnswer(true)));
        orch.start().unwrap();
        assert_eq!(
            outcomes(&orch),
            vec![
                CheckOutcome::Succeeded("Scan Complete".into()),
                CheckOutcome::Succeeded("OK".into()),
            ]
        );
    }

    #[test]
    fn failures_are_classified_and_battery_absence_is_skipped() {
        let checks = vec![
            ScanCheck::new("dism", || {
                CheckResult::Failed(Failure::from_output("Error: 0x800f0906"))
            }),
            ScanCheck::new("Battery Health", || {
                CheckResult::Failed(Failure::from_output("Error 0x10d2 occurred"))
            }),
        ];
        let (orch, _rx) = orchestrator(checks, true, Arc::new(FixedAnswer(true)));
        let summary = orch.start().unwrap();
        assert_eq!(
            summary.checks[0].outcome,
            CheckOutcome::Failed("Cannot Download Source Files".into())
        );
        assert_eq!(summary.checks[1].outcome, CheckOutcome::SkippedNotApplicable);
        assert_eq!(summary.checks[1].color, ColorHint::Caution);
        assert_eq!(summary.count("failed"), 1);
    }

    #[test]
    fn every_check_ends_terminal_and_events_are_ordered() {
        let ran = Arc::new(AtomicUsize::new(0));
        let checks = vec![passing("a", &ran), passing("b", &ran)];
        let (orch, mut rx) = orchestrator(checks, true, Arc::new(FixedAnswer(true)));
        orch.start().unwrap();

        assert!(orch.statuses().iter().all(|s| s.outcome.is_terminal()));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 6);
        match &events[0] {
            ScanEvent::PassStarted { checks } => {
                assert!(checks.iter().all(|c| c.outcome == CheckOutcome::Pending))
            }
            other => panic!("unexpected first event {other:?}"),
        }
        let transitions: Vec<(String, &'static str)> = events[1..5]
            .iter()
            .map(|e| match e {
                ScanEvent::Check(s) => (s.name.clone(), s.outcome.label()),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                ("a".to_string(), "running"),
                ("a".to_string(), "succeeded"),
                ("b".to_string(), "running"),
                ("b".to_string(), "succeeded"),
            ]
        );
        assert!(matches!(events[5], ScanEvent::PassFinished(_)));
    }

    #[test]
    fn not_elevated_refuses_without_touching_state() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (orch, mut rx) = orchestrator(vec![passing("a", &ran)], false, Arc::new(FixedAnswer(true)));

        assert_eq!(orch.start().unwrap_err(), ScanError::AdminRequired);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes(&orch), vec![CheckOutcome::Pending]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn second_start_while_running_is_rejected() {
        let (entered_tx, entered_rx) = std_mpsc::channel::<()>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let entered_tx = Mutex::new(entered_tx);
        let check = ScanCheck::new("slow", move || {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
            CheckResult::Passed("Done".into())
        });
        let (orch, _rx) = orchestrator(vec![check], true, Arc::new(FixedAnswer(true)));
        let orch = Arc::new(orch);

        let worker = {
            let orch = Arc::clone(&orch);
            std::thread::spawn(move || orch.start())
        };
        entered_rx.recv().unwrap();
        assert!(orch.is_running());
        assert_eq!(orch.start().unwrap_err(), ScanError::AlreadyRunning);

        release_tx.send(()).unwrap();
        assert!(worker.join().unwrap().is_ok());
        assert!(!orch.is_running());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (tx, _rx) = unbounded_channel();
        let privilege: Arc<dyn PrivilegeProbe> = Arc::new(|| true);
        let checks = vec![
            ScanCheck::new("same", || CheckResult::Passed("a".into())),
            ScanCheck::new("same", || CheckResult::Passed("b".into())),
        ];
        let err = FullScanOrchestrator::new(
            checks,
            privilege,
            Arc::new(FixedAnswer(true)),
            tx,
            &ScanConfig::default(),
        )
        .err();
        assert_eq!(err, Some(ScanError::DuplicateCheck("same".into())));
    }

    #[test]
    fn integrity_check_success_reports_positive_status() {
        let check = ScanCheck::new("System File Checker", || {
            CheckResult::Passed("No Integrity Violations".into())
        });
        let (orch, _rx) = orchestrator(vec![check], true, Arc::new(FixedAnswer(true)));
        let summary = orch.start().unwrap();
        assert_eq!(
            summary.checks[0].outcome,
            CheckOutcome::Succeeded("No Integrity Violations".into())
        );
        assert_eq!(summary.checks[0].color, ColorHint::Positive);
    }
}
