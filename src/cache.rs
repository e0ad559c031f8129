//! Poll-to-poll diffing of rendered metric sections.
//!
//! Each section remembers the ordered keys of the items it rendered last time.
//! When the new keys are identical (same members, same order) only changed
//! fields are emitted as a patch; any structural difference throws the cached
//! state away and re-renders the whole section.

use crate::collectors::{AcquisitionError, DeviceReading, FieldList, MetricSnapshot, Reading};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDiff {
    Rebuild,
    Patch,
}

/// Order-sensitive: a reordered key set is a structural change.
pub fn diff_keys<T, K, F>(previous: &[K], items: &[T], key_of: F) -> KeyDiff
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    if previous.len() != items.len() {
        return KeyDiff::Rebuild;
    }
    if previous
        .iter()
        .zip(items)
        .all(|(prev, item)| *prev == key_of(item))
    {
        KeyDiff::Patch
    } else {
        KeyDiff::Rebuild
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    CpuInfo,
    CpuCores,
    Memory,
    Gpu,
    Disk,
    Smart,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CpuInfo => "cpu_info",
            Self::CpuCores => "cpu_cores",
            Self::Memory => "memory",
            Self::Gpu => "gpu",
            Self::Disk => "disk",
            Self::Smart => "smart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Normal,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedField {
    pub name: String,
    pub value: String,
    pub alert: AlertLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedItem {
    pub key: String,
    pub title: String,
    pub fields: Vec<RenderedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDelta {
    pub key: String,
    pub field: String,
    pub value: String,
    pub alert: AlertLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SectionChange {
    Rebuild(Vec<RenderedItem>),
    Patch(Vec<FieldDelta>),
}

impl SectionChange {
    pub fn is_empty_patch(&self) -> bool {
        matches!(self, Self::Patch(deltas) if deltas.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionUpdate {
    pub section: Section,
    pub change: SectionChange,
}

/// One displayable item before diffing.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionItem {
    pub key: String,
    pub title: String,
    pub fields: FieldList,
}

impl SectionItem {
    fn error(section: Section, err: &AcquisitionError) -> Self {
        Self {
            key: "Error".to_string(),
            title: section.as_str().to_string(),
            fields: vec![("Error".to_string(), err.message.clone())],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AlertRule {
    threshold: f64,
}

impl AlertRule {
    fn level(&self, field: &str, value: &str) -> AlertLevel {
        if !field.to_ascii_lowercase().contains("temp") {
            return AlertLevel::Normal;
        }
        match leading_number(value) {
            Some(v) if v >= self.threshold => AlertLevel::Critical,
            _ => AlertLevel::Normal,
        }
    }
}

fn leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && *c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

/// Cached state for one section: item key → field → (rendered value, alert level).
#[derive(Debug)]
pub struct SectionCache {
    section: Section,
    skip: Vec<&'static str>,
    rule: AlertRule,
    keys: Vec<String>,
    items: HashMap<String, HashMap<String, (String, AlertLevel)>>,
}

impl SectionCache {
    pub fn new(section: Section, skip: &[&'static str], threshold: f64) -> Self {
        Self {
            section,
            skip: skip.to_vec(),
            rule: AlertRule { threshold },
            keys: Vec::new(),
            items: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn update(&mut self, items: &[SectionItem]) -> SectionChange {
        match diff_keys(&self.keys, items, |item| item.key.clone()) {
            KeyDiff::Rebuild => SectionChange::Rebuild(self.rebuild(items)),
            KeyDiff::Patch => SectionChange::Patch(self.patch(items)),
        }
    }

    fn visible<'a>(&'a self, item: &'a SectionItem) -> impl Iterator<Item = &'a (String, String)> {
        item.fields
            .iter()
            .filter(move |(name, _)| !self.skip.iter().any(|s| *s == name.as_str()))
    }

    fn rebuild(&mut self, items: &[SectionItem]) -> Vec<RenderedItem> {
        debug!(
            section = self.section.as_str(),
            previous = self.keys.len(),
            current = items.len(),
            "section rebuild"
        );
        let mut cached = HashMap::with_capacity(items.len());
        let rendered: Vec<RenderedItem> = items
            .iter()
            .map(|item| {
                let fields: Vec<RenderedField> = self
                    .visible(item)
                    .map(|(name, value)| RenderedField {
                        name: name.clone(),
                        value: value.clone(),
                        alert: self.rule.level(name, value),
                    })
                    .collect();
                cached.insert(
                    item.key.clone(),
                    fields
                        .iter()
                        .map(|f| (f.name.clone(), (f.value.clone(), f.alert)))
                        .collect(),
                );
                RenderedItem {
                    key: item.key.clone(),
                    title: item.title.clone(),
                    fields,
                }
            })
            .collect();

        self.keys = items.iter().map(|i| i.key.clone()).collect();
        self.items = cached;
        rendered
    }

    fn patch(&mut self, items: &[SectionItem]) -> Vec<FieldDelta> {
        let mut deltas = Vec::new();
        for item in items {
            let changed: Vec<FieldDelta> = self
                .visible(item)
                .filter_map(|(name, value)| {
                    let alert = self.rule.level(name, value);
                    let previous = self.items.get(&item.key).and_then(|f| f.get(name));
                    match previous {
                        Some((old_value, old_alert)) if old_value == value && *old_alert == alert => {
                            None
                        }
                        _ => Some(FieldDelta {
                            key: item.key.clone(),
                            field: name.clone(),
                            value: value.clone(),
                            alert,
                        }),
                    }
                })
                .collect();

            let cached = self.items.entry(item.key.clone()).or_default();
            for delta in &changed {
                cached.insert(delta.field.clone(), (delta.value.clone(), delta.alert));
            }
            deltas.extend(changed);
        }
        deltas
    }
}

/// Per-session diff state for every section of the live view.
#[derive(Debug)]
pub struct DifferentialCache {
    cpu_info: SectionCache,
    cpu: SectionCache,
    memory: SectionCache,
    gpu: SectionCache,
    disk: SectionCache,
    smart: SectionCache,
}

impl DifferentialCache {
    pub fn new(temp_alert_threshold_celsius: f64) -> Self {
        let t = temp_alert_threshold_celsius;
        Self {
            cpu_info: SectionCache::new(Section::CpuInfo, &["Name"], t),
            cpu: SectionCache::new(Section::CpuCores, &[], t),
            memory: SectionCache::new(Section::Memory, &[], t),
            gpu: SectionCache::new(Section::Gpu, &["Name", "DeviceID"], t),
            disk: SectionCache::new(Section::Disk, &["Device", "Mountpoint"], t),
            smart: SectionCache::new(Section::Smart, &[], t),
        }
    }

    /// Section changes for a new snapshot; empty patches are dropped.
    pub fn apply(&mut self, snapshot: &MetricSnapshot) -> Vec<SectionUpdate> {
        let sections = [
            (Section::CpuInfo, &mut self.cpu_info, cpu_info_items(snapshot)),
            (Section::CpuCores, &mut self.cpu, cpu_items(&snapshot.cpu_per_core)),
            (Section::Memory, &mut self.memory, memory_items(snapshot)),
            (Section::Gpu, &mut self.gpu, gpu_items(&snapshot.gpus)),
            (Section::Disk, &mut self.disk, disk_items(&snapshot.disks)),
            (Section::Smart, &mut self.smart, smart_items(&snapshot.smart)),
        ];

        sections
            .into_iter()
            .filter_map(|(section, cache, items)| {
                let change = cache.update(&items);
                (!change.is_empty_patch()).then_some(SectionUpdate { section, change })
            })
            .collect()
    }
}

fn or_error(section: Section, reading: Result<Vec<SectionItem>, &AcquisitionError>) -> Vec<SectionItem> {
    reading.unwrap_or_else(|err| vec![SectionItem::error(section, err)])
}

fn cpu_info_items(snapshot: &MetricSnapshot) -> Vec<SectionItem> {
    or_error(
        Section::CpuInfo,
        snapshot.cpu_info.as_ref().map(|info| {
            let mut fields = info.fields();
            if let Ok(frequency) = &snapshot.cpu_frequency {
                fields.push(("CurrentClockSpeed".to_string(), frequency.clone()));
            }
            if let Ok(usage) = &snapshot.cpu_overall_percent {
                fields.push(("Usage".to_string(), format!("{usage:.1}%")));
            }
            vec![SectionItem {
                key: "CPU".to_string(),
                title: info.name.clone(),
                fields,
            }]
        }),
    )
}

fn cpu_items(per_core: &Reading<Vec<f64>>) -> Vec<SectionItem> {
    or_error(
        Section::CpuCores,
        per_core.as_ref().map(|loads| {
            loads
                .iter()
                .enumerate()
                .map(|(i, load)| SectionItem {
                    key: format!("Thread {i}"),
                    title: format!("Thread {i}"),
                    fields: vec![("Load".to_string(), format!("{load:.1}%"))],
                })
                .collect()
        }),
    )
}

fn memory_items(snapshot: &MetricSnapshot) -> Vec<SectionItem> {
    or_error(
        Section::Memory,
        snapshot.ram.as_ref().map(|ram| {
            vec![SectionItem {
                key: "Memory".to_string(),
                title: "Memory".to_string(),
                fields: ram.fields(),
            }]
        }),
    )
}

fn gpu_items(gpus: &Reading<Vec<DeviceReading>>) -> Vec<SectionItem> {
    or_error(
        Section::Gpu,
        gpus.as_ref().map(|gpus| {
            gpus.iter()
                .enumerate()
                .map(|(n, gpu)| SectionItem {
                    key: gpu.key().to_string(),
                    title: format!("GPU {}: {}", n + 1, gpu.name),
                    fields: gpu.fields.clone(),
                })
                .collect()
        }),
    )
}

fn disk_items(disks: &Reading<Vec<DeviceReading>>) -> Vec<SectionItem> {
    or_error(
        Section::Disk,
        disks.as_ref().map(|disks| {
            disks
                .iter()
                .map(|disk| {
                    let device = disk.field("Device").unwrap_or(&disk.name);
                    let mount = disk.field("Mountpoint").unwrap_or_else(|| disk.key());
                    SectionItem {
                        key: disk.key().to_string(),
                        title: format!("{device} ({mount})"),
                        fields: disk.fields.clone(),
                    }
                })
                .collect()
        }),
    )
}

fn smart_items(smart: &Reading<FieldList>) -> Vec<SectionItem> {
    or_error(
        Section::Smart,
        smart.as_ref().map(|drives| {
            drives
                .iter()
                .map(|(drive, status)| SectionItem {
                    key: drive.clone(),
                    title: drive.clone(),
                    fields: vec![("Status".to_string(), status.clone())],
                })
                .collect()
        }),
    )
}
