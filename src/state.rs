use crate::cache::{AlertLevel, SectionChange, SectionUpdate};
use crate::collectors::MetricSnapshot;
use crate::scan::{CheckStatus, PassSummary, ScanEvent};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything the read-only export can see.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_collect_timestamp_seconds: i64,
    pub snapshot: Option<Arc<MetricSnapshot>>,
    /// `section/key/field` → value, for fields currently at critical level.
    pub critical_fields: BTreeMap<String, String>,
    pub scan: ScanState,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanState {
    pub running: bool,
    pub checks: Vec<CheckStatus>,
    pub last_summary: Option<PassSummary>,
    pub passes_completed: u64,
}

/// A field entering or leaving critical level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertTransition {
    Raised { field: String, value: String },
    Cleared { field: String },
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn update_collected(
        &mut self,
        snapshot: Arc<MetricSnapshot>,
        updates: &[SectionUpdate],
    ) -> Vec<AlertTransition> {
        self.last_collect_timestamp_seconds = snapshot.captured_at_unix;
        self.snapshot = Some(snapshot);

        let mut transitions = Vec::new();
        for update in updates {
            let section = update.section.as_str();
            match &update.change {
                SectionChange::Rebuild(items) => {
                    let prefix = format!("{section}/");
                    let stale: Vec<String> = self
                        .critical_fields
                        .keys()
                        .filter(|k| k.starts_with(&prefix))
                        .cloned()
                        .collect();
                    let mut fresh = BTreeMap::new();
                    for item in items {
                        for field in &item.fields {
                            if field.alert == AlertLevel::Critical {
                                fresh.insert(
                                    format!("{section}/{}/{}", item.key, field.name),
                                    field.value.clone(),
                                );
                            }
                        }
                    }
                    for key in stale {
                        if !fresh.contains_key(&key) {
                            self.critical_fields.remove(&key);
                            transitions.push(AlertTransition::Cleared { field: key });
                        }
                    }
                    for (key, value) in fresh {
                        self.raise(key, value, &mut transitions);
                    }
                }
                SectionChange::Patch(deltas) => {
                    for delta in deltas {
                        let key = format!("{section}/{}/{}", delta.key, delta.field);
                        match delta.alert {
                            AlertLevel::Critical => {
                                self.raise(key, delta.value.clone(), &mut transitions)
                            }
                            AlertLevel::Normal => {
                                if self.critical_fields.remove(&key).is_some() {
                                    transitions.push(AlertTransition::Cleared { field: key });
                                }
                            }
                        }
                    }
                }
            }
        }
        transitions
    }

    fn raise(&mut self, key: String, value: String, transitions: &mut Vec<AlertTransition>) {
        let newly = !self.critical_fields.contains_key(&key);
        self.critical_fields.insert(key.clone(), value.clone());
        if newly {
            transitions.push(AlertTransition::Raised { field: key, value });
        }
    }

    pub fn apply_scan_event(&mut self, event: &ScanEvent) {
        match event {
            ScanEvent::PassStarted { checks } => {
                self.scan.running = true;
                self.scan.checks = checks.clone();
            }
            ScanEvent::Check(status) => {
                match self.scan.checks.iter_mut().find(|c| c.name == status.name) {
                    Some(slot) => *slot = status.clone(),
                    None => self.scan.checks.push(status.clone()),
                }
            }
            ScanEvent::PassFinished(summary) => {
                self.scan.running = false;
                self.scan.checks = summary.checks.clone();
                self.scan.last_summary = Some(summary.clone());
                self.scan.passes_completed += 1;
            }
        }
    }
}
