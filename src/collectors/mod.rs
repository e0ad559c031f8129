pub mod system;

use crate::scan::orchestrator::panic_description;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::warn;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A metric category that could not be read this tick.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{category}: {message}")]
pub struct AcquisitionError {
    pub category: &'static str,
    pub message: String,
}

impl AcquisitionError {
    pub fn new(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

pub type Reading<T> = Result<T, AcquisitionError>;

/// Ordered metric-name → display text pairs.
pub type FieldList = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuInfo {
    pub name: String,
    pub cores: u32,
    pub threads: u32,
    pub max_clock_mhz: u64,
}

impl CpuInfo {
    pub fn fields(&self) -> FieldList {
        vec![
            ("Name".to_string(), self.name.clone()),
            ("Cores".to_string(), self.cores.to_string()),
            ("Threads".to_string(), self.threads.to_string()),
            ("MaxClockSpeed".to_string(), format!("{} MHz", self.max_clock_mhz)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RamStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub percent: f64,
}

impl RamStats {
    pub fn fields(&self) -> FieldList {
        vec![
            ("Total".to_string(), format_gb(self.total_bytes)),
            ("Available".to_string(), format_gb(self.available_bytes)),
            ("Used".to_string(), format_gb(self.used_bytes)),
            ("Percentage".to_string(), format!("{:.1}", self.percent)),
        ]
    }
}

/// One GPU or disk partition. `stable_id` identifies the physical device across polls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub stable_id: Option<String>,
    pub name: String,
    pub fields: FieldList,
}

impl DeviceReading {
    /// Cache key: the stable id, or the device name when the source has none.
    pub fn key(&self) -> &str {
        match self.stable_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id,
            _ => &self.name,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Point-in-time readings from the host. Every call may fail on its own.
pub trait MetricSource: Send {
    /// Called once at the start of each tick, before any reading.
    fn refresh(&mut self) {}

    fn cpu_static_info(&mut self) -> Reading<CpuInfo>;
    fn cpu_overall_percent(&mut self) -> Reading<f64>;
    fn cpu_per_core_loads(&mut self) -> Reading<Vec<f64>>;
    fn cpu_frequency(&mut self) -> Reading<String>;
    fn ram_stats(&mut self) -> Reading<RamStats>;
    fn gpu_readings(&mut self) -> Reading<Vec<DeviceReading>>;
    fn disk_partition_usage(&mut self) -> Reading<Vec<DeviceReading>>;
    fn disk_smart_status(&mut self) -> Reading<FieldList>;
    fn board_info(&mut self) -> Reading<FieldList>;
}

/// Immutable record of one poll tick; superseded, never merged, by the next one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub captured_at_unix: i64,
    pub cpu_info: Reading<CpuInfo>,
    pub cpu_overall_percent: Reading<f64>,
    pub cpu_per_core: Reading<Vec<f64>>,
    pub cpu_frequency: Reading<String>,
    pub ram: Reading<RamStats>,
    pub gpus: Reading<Vec<DeviceReading>>,
    pub disks: Reading<Vec<DeviceReading>>,
    pub smart: Reading<FieldList>,
    pub board: Reading<FieldList>,
}

impl MetricSnapshot {
    /// A panicking category is recorded as that category's error; the rest of
    /// the tick is still read.
    pub fn capture(source: &mut dyn MetricSource, captured_at_unix: i64) -> Self {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| source.refresh())) {
            warn!(error = %panic_description(payload.as_ref()), "metric source refresh panicked");
        }
        Self {
            captured_at_unix,
            cpu_info: guarded("cpu", || source.cpu_static_info()),
            cpu_overall_percent: guarded("cpu", || source.cpu_overall_percent()),
            cpu_per_core: guarded("cpu", || source.cpu_per_core_loads()),
            cpu_frequency: guarded("cpu", || source.cpu_frequency()),
            ram: guarded("memory", || source.ram_stats()),
            gpus: guarded("gpu", || source.gpu_readings()),
            disks: guarded("disk", || source.disk_partition_usage()),
            smart: guarded("smart", || source.disk_smart_status()),
            board: guarded("board", || source.board_info()),
        }
    }

    pub fn errors(&self) -> Vec<&AcquisitionError> {
        [
            self.cpu_info.as_ref().err(),
            self.cpu_overall_percent.as_ref().err(),
            self.cpu_per_core.as_ref().err(),
            self.cpu_frequency.as_ref().err(),
            self.ram.as_ref().err(),
            self.gpus.as_ref().err(),
            self.disks.as_ref().err(),
            self.smart.as_ref().err(),
            self.board.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn guarded<T>(category: &'static str, read: impl FnOnce() -> Reading<T>) -> Reading<T> {
    panic::catch_unwind(AssertUnwindSafe(read)).unwrap_or_else(|payload| {
        Err(AcquisitionError::new(
            category,
            format!("panicked: {}", panic_description(payload.as_ref())),
        ))
    })
}

pub fn format_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / GIB)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory source; categories set to `Err` simulate acquisition failures.
    #[derive(Clone)]
    pub struct FakeSource {
        pub per_core: Reading<Vec<f64>>,
        pub ram: Reading<RamStats>,
        pub gpus: Reading<Vec<DeviceReading>>,
        pub disks: Reading<Vec<DeviceReading>>,
        pub smart: Reading<FieldList>,
        pub refreshes: u32,
        /// Number of upcoming `gpu_readings` calls that panic.
        pub gpu_panics: u32,
    }

    impl Default for FakeSource {
        fn default() -> Self {
            Self {
                per_core: Ok(vec![10.0, 20.0]),
                ram: Ok(sixteen_gib_half_used()),
                gpus: Ok(vec![gpu("GPU-1", "RTX", "45 C")]),
                disks: Ok(vec![disk("/dev/sda1", "/", "40.0%")]),
                smart: Ok(vec![("/dev/sda".to_string(), "Samsung SSD - OK".to_string())]),
                refreshes: 0,
                gpu_panics: 0,
            }
        }
    }

    impl MetricSource for FakeSource {
        fn refresh(&mut self) {
            self.refreshes += 1;
        }
        fn cpu_static_info(&mut self) -> Reading<CpuInfo> {
            Ok(CpuInfo {
                name: "Test CPU".to_string(),
                cores: 2,
                threads: 2,
                max_clock_mhz: 3000,
            })
        }
        fn cpu_overall_percent(&mut self) -> Reading<f64> {
            Ok(15.0)
        }
        fn cpu_per_core_loads(&mut self) -> Reading<Vec<f64>> {
            self.per_core.clone()
        }
        fn cpu_frequency(&mut self) -> Reading<String> {
            Ok("3000.00 MHz".to_string())
        }
        fn ram_stats(&mut self) -> Reading<RamStats> {
            self.ram.clone()
        }
        fn gpu_readings(&mut self) -> Reading<Vec<DeviceReading>> {
            if self.gpu_panics > 0 {
                self.gpu_panics -= 1;
                panic!("driver query crashed");
            }
            self.gpus.clone()
        }
        fn disk_partition_usage(&mut self) -> Reading<Vec<DeviceReading>> {
            self.disks.clone()
        }
        fn disk_smart_status(&mut self) -> Reading<FieldList> {
            self.smart.clone()
        }
        fn board_info(&mut self) -> Reading<FieldList> {
            Ok(vec![("System".to_string(), "TestOS".to_string())])
        }
    }

    pub fn sixteen_gib_half_used() -> RamStats {
        let gib = 1024_u64 * 1024 * 1024;
        RamStats {
            total_bytes: 16 * gib,
            available_bytes: 8 * gib,
            used_bytes: 8 * gib,
            percent: 50.0,
        }
    }

    pub fn gpu(id: &str, name: &str, temp: &str) -> DeviceReading {
        DeviceReading {
            stable_id: Some(id.to_string()),
            name: name.to_string(),
            fields: vec![
                ("Name".to_string(), name.to_string()),
                ("Load".to_string(), "10%".to_string()),
                ("Temperature".to_string(), temp.to_string()),
            ],
        }
    }

    pub fn disk(device: &str, mount: &str, percent: &str) -> DeviceReading {
        DeviceReading {
            stable_id: Some(mount.to_string()),
            name: device.to_string(),
            fields: vec![
                ("Device".to_string(), device.to_string()),
                ("Mountpoint".to_string(), mount.to_string()),
                ("Percent".to_string(), percent.to_string()),
            ],
        }
    }

    #[test]
    fn ram_fields_render_in_gigabytes() {
        let fields = sixteen_gib_half_used().fields();
        assert_eq!(fields[0], ("Total".to_string(), "16.00 GB".to_string()));
        assert_eq!(fields[1], ("Available".to_string(), "8.00 GB".to_string()));
        assert_eq!(fields[2], ("Used".to_string(), "8.00 GB".to_string()));
        assert_eq!(fields[3], ("Percentage".to_string(), "50.0".to_string()));
    }

    #[test]
    fn device_key_falls_back_to_name() {
        let mut reading = gpu("GPU-1", "RTX", "40 C");
        assert_eq!(reading.key(), "GPU-1");
        reading.stable_id = None;
        assert_eq!(reading.key(), "RTX");
        reading.stable_id = Some("  ".to_string());
        assert_eq!(reading.key(), "RTX");
    }

    #[test]
    fn capture_keeps_other_categories_when_one_fails() {
        let mut source = FakeSource {
            gpus: Err(AcquisitionError::new("gpu", "nvidia-smi exploded")),
            ..FakeSource::default()
        };
        let snapshot = MetricSnapshot::capture(&mut source, 42);

        assert_eq!(source.refreshes, 1);
        assert_eq!(snapshot.captured_at_unix, 42);
        assert!(snapshot.ram.is_ok());
        assert!(snapshot.disks.is_ok());
        let errors = snapshot.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "gpu: nvidia-smi exploded");
    }

    #[test]
    fn panicking_category_becomes_its_error() {
        let mut source = FakeSource {
            gpu_panics: 1,
            ..FakeSource::default()
        };
        let snapshot = MetricSnapshot::capture(&mut source, 1);

        let err = snapshot.gpus.clone().unwrap_err();
        assert_eq!(err.category, "gpu");
        assert_eq!(err.message, "panicked: driver query crashed");
        assert!(snapshot.ram.is_ok());
        assert!(snapshot.smart.is_ok());

        let next = MetricSnapshot::capture(&mut source, 2);
        assert!(next.gpus.is_ok());
    }
}
