use crate::collectors::{
    format_gb, AcquisitionError, CpuInfo, DeviceReading, FieldList, MetricSource, RamStats,
    Reading,
};
use crate::scan::runner::decode_cmd_stdout;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::path::Path;
use std::process::Command;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use tracing::debug;

/// Host metrics via sysinfo, nvidia-smi and the platform's hardware inventory.
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for SysinfoSource {
    fn refresh(&mut self) {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_disks_list();
        self.system.refresh_disks();
    }

    fn cpu_static_info(&mut self) -> Reading<CpuInfo> {
        let cpus = self.system.cpus();
        let first = cpus
            .first()
            .ok_or_else(|| AcquisitionError::new("cpu", "no processors reported"))?;
        Ok(CpuInfo {
            name: first.brand().trim().to_string(),
            cores: self.system.physical_core_count().unwrap_or(cpus.len()) as u32,
            threads: cpus.len() as u32,
            max_clock_mhz: cpus.iter().map(|c| c.frequency()).max().unwrap_or(0),
        })
    }

    fn cpu_overall_percent(&mut self) -> Reading<f64> {
        if self.system.cpus().is_empty() {
            return Err(AcquisitionError::new("cpu", "no processors reported"));
        }
        Ok(round1(self.system.global_cpu_info().cpu_usage() as f64))
    }

    fn cpu_per_core_loads(&mut self) -> Reading<Vec<f64>> {
        let loads: Vec<f64> = self
            .system
            .cpus()
            .iter()
            .map(|c| round1(c.cpu_usage() as f64))
            .collect();
        if loads.is_empty() {
            return Err(AcquisitionError::new("cpu", "no processors reported"));
        }
        Ok(loads)
    }

    fn cpu_frequency(&mut self) -> Reading<String> {
        let current = self
            .system
            .cpus()
            .first()
            .map(|c| c.frequency())
            .unwrap_or(0);
        if current == 0 {
            return Ok("N/A".to_string());
        }
        Ok(format!("{:.2} MHz", current as f64))
    }

    fn ram_stats(&mut self) -> Reading<RamStats> {
        let total = self.system.total_memory();
        if total == 0 {
            return Err(AcquisitionError::new("memory", "total memory reported as zero"));
        }
        let available = self.system.available_memory();
        Ok(RamStats {
            total_bytes: total,
            available_bytes: available,
            used_bytes: self.system.used_memory(),
            percent: round1(total.saturating_sub(available) as f64 / total as f64 * 100.0),
        })
    }

    fn gpu_readings(&mut self) -> Reading<Vec<DeviceReading>> {
        let gpus = collect_nvidia_smi();
        if !gpus.is_empty() {
            return Ok(gpus);
        }
        collect_platform_gpus()
    }

    fn disk_partition_usage(&mut self) -> Reading<Vec<DeviceReading>> {
        let disks = self
            .system
            .disks()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                partition_reading(
                    &d.name().to_string_lossy(),
                    &d.mount_point().to_string_lossy(),
                    d.total_space(),
                    d.available_space(),
                )
            })
            .collect();
        Ok(disks)
    }

    fn disk_smart_status(&mut self) -> Reading<FieldList> {
        collect_smart_status()
    }

    fn board_info(&mut self) -> Reading<FieldList> {
        let mut info = vec![
            field("System", self.system.name().unwrap_or_default()),
            field("Node Name", self.system.host_name().unwrap_or_default()),
            field("Release", self.system.kernel_version().unwrap_or_default()),
            field("Version", self.system.os_version().unwrap_or_default()),
            field("Machine", std::env::consts::ARCH),
        ];
        match collect_board_details() {
            Ok(details) => info.extend(details),
            Err(err) => info.push(field("Error", err.message)),
        }
        Ok(info)
    }
}

fn partition_reading(device: &str, mount: &str, total: u64, available: u64) -> DeviceReading {
    let used = total.saturating_sub(available);
    let percent = if total > 0 {
        round1(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };
    DeviceReading {
        stable_id: Some(mount.to_string()),
        name: device.to_string(),
        fields: vec![
            field("Device", device),
            field("Mountpoint", mount),
            field("Total", format_gb(total)),
            field("Used", format_gb(used)),
            field("Free", format_gb(available)),
            field("Percent", format!("{percent:.1}%")),
        ],
    }
}

fn collect_nvidia_smi() -> Vec<DeviceReading> {
    let output = run_nvidia_smi(&[
        "--query-gpu=gpu_uuid,name,utilization.gpu,memory.free,memory.used,memory.total,temperature.gpu",
        "--format=csv,noheader,nounits",
    ]);

    let Some(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    parse_nvidia_smi(&decode_cmd_stdout(&output.stdout))
}

fn parse_nvidia_smi(text: &str) -> Vec<DeviceReading> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
            if parts.len() < 7 {
                return None;
            }
            Some(DeviceReading {
                stable_id: Some(parts[0].to_string()),
                name: parts[1].to_string(),
                fields: vec![
                    field("DeviceID", parts[0]),
                    field("Name", parts[1]),
                    field("Load", format!("{}%", parts[2])),
                    field("Free Memory", format!("{}MB", parts[3])),
                    field("Used Memory", format!("{}MB", parts[4])),
                    field("Total Memory", format!("{}MB", parts[5])),
                    field("Temperature", format!("{} C", parts[6])),
                ],
            })
        })
        .collect()
}

/// Adapter listing without live counters; load and temperature are reported as N/A.
fn adapter_reading(id: Option<String>, name: &str, memory: String) -> DeviceReading {
    DeviceReading {
        stable_id: id.clone(),
        name: name.to_string(),
        fields: vec![
            field("DeviceID", id.unwrap_or_else(|| name.to_string())),
            field("Name", name),
            field("Load", "N/A"),
            field("Free Memory", "N/A"),
            field("Used Memory", "N/A"),
            field("Total Memory", memory),
            field("Temperature", "N/A"),
        ],
    }
}

#[cfg(target_os = "windows")]
fn collect_platform_gpus() -> Reading<Vec<DeviceReading>> {
    let script = "Get-CimInstance Win32_VideoController | ForEach-Object { \"$($_.Name)|$($_.PNPDeviceID)|$($_.AdapterRAM)\" }";
    let text = run_powershell_text(script).map_err(|e| AcquisitionError::new("gpu", e))?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').map(str::trim).collect();
            if parts.len() < 3 || parts[0].is_empty() {
                return None;
            }
            let id = Some(parts[1].to_string()).filter(|v| !v.is_empty());
            let memory = parts[2]
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .map(|v| format!("{:.0}MB", v as f64 / (1024.0 * 1024.0)))
                .unwrap_or_else(|| "N/A".to_string());
            Some(adapter_reading(id, parts[0], memory))
        })
        .collect())
}

#[cfg(target_os = "linux")]
fn collect_platform_gpus() -> Reading<Vec<DeviceReading>> {
    let entries = match fs::read_dir("/sys/class/drm") {
        Ok(entries) => entries,
        Err(err) => return Err(AcquisitionError::new("gpu", err.to_string())),
    };
    let mut cards: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("card") && !name.contains('-'))
        .collect();
    cards.sort();

    Ok(cards
        .iter()
        .filter_map(|card| {
            let device = Path::new("/sys/class/drm").join(card).join("device");
            let uevent = fs::read_to_string(device.join("uevent")).ok()?;
            let slot = uevent_value(&uevent, "PCI_SLOT_NAME");
            let pci_id = uevent_value(&uevent, "PCI_ID").unwrap_or_else(|| card.clone());
            let driver = uevent_value(&uevent, "DRIVER").unwrap_or_default();
            let name = if driver.is_empty() {
                pci_id
            } else {
                format!("{driver} {pci_id}")
            };
            let memory = read_sysfs_u64(&device.join("mem_info_vram_total"))
                .map(|v| format!("{:.0}MB", v as f64 / (1024.0 * 1024.0)))
                .unwrap_or_else(|| "N/A".to_string());
            Some(adapter_reading(slot, &name, memory))
        })
        .collect())
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn collect_platform_gpus() -> Reading<Vec<DeviceReading>> {
    Ok(Vec::new())
}

#[cfg(target_os = "windows")]
fn collect_smart_status() -> Reading<FieldList> {
    let script = "Get-CimInstance Win32_DiskDrive | ForEach-Object { \"$($_.DeviceID)|$($_.Caption)|$($_.Status)\" }";
    let text = run_powershell_text(script).map_err(|e| AcquisitionError::new("smart", e))?;
    Ok(parse_smart_lines(&text))
}

#[cfg(target_os = "linux")]
fn collect_smart_status() -> Reading<FieldList> {
    let entries =
        fs::read_dir("/sys/block").map_err(|e| AcquisitionError::new("smart", e.to_string()))?;
    let mut drives: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !["loop", "ram", "zram", "dm-", "sr"].iter().any(|p| name.starts_with(p)))
        .collect();
    drives.sort();

    Ok(drives
        .into_iter()
        .map(|drive| {
            let model = fs::read_to_string(Path::new("/sys/block").join(&drive).join("device/model"))
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|_| drive.clone());
            let dev = format!("/dev/{drive}");
            let status = smartctl_health(&dev);
            (dev, format!("{model} - {status}"))
        })
        .collect())
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn collect_smart_status() -> Reading<FieldList> {
    Err(AcquisitionError::new("smart", "SMART status is not supported on this platform"))
}

#[cfg(target_os = "linux")]
fn smartctl_health(device: &str) -> String {
    match Command::new("smartctl").args(["-H", device]).output() {
        Ok(output) => parse_smartctl_health(&decode_cmd_stdout(&output.stdout)),
        Err(err) => {
            debug!(device, error = %err, "smartctl unavailable");
            "Unknown".to_string()
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_smartctl_health(text: &str) -> String {
    for line in text.lines() {
        if let Some((_, verdict)) = line.split_once("self-assessment test result:") {
            return match verdict.trim() {
                "PASSED" => "OK".to_string(),
                other => other.to_string(),
            };
        }
        if let Some((_, verdict)) = line.split_once("SMART Health Status:") {
            return verdict.trim().to_string();
        }
    }
    "Unknown".to_string()
}

/// `DeviceID|Caption|Status` lines; the device id is the stable key.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_smart_lines(text: &str) -> FieldList {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').map(str::trim).collect();
            if parts.len() < 3 {
                return None;
            }
            let key = if parts[0].is_empty() { parts[1] } else { parts[0] };
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), format!("{} - {}", parts[1], parts[2])))
        })
        .collect()
}

#[cfg(target_os = "windows")]
fn collect_board_details() -> Reading<FieldList> {
    let script = "$b=Get-CimInstance Win32_BaseBoard | Select-Object -First 1; $s=Get-CimInstance Win32_BIOS | Select-Object -First 1; \"$($b.Manufacturer)|$($b.Product)|$($b.SerialNumber)|$($s.SMBIOSBIOSVersion)\"";
    let text = run_powershell_text(script).map_err(|e| AcquisitionError::new("board", e))?;
    let line = text.lines().find(|l| l.contains('|')).unwrap_or_default();
    let parts: Vec<&str> = line.split('|').map(str::trim).collect();
    let labels = ["Manufacturer", "Product", "SerialNumber", "BIOS Version"];
    Ok(labels
        .iter()
        .zip(parts)
        .map(|(label, value)| field(label, value))
        .collect())
}

#[cfg(target_os = "linux")]
fn collect_board_details() -> Reading<FieldList> {
    let base = Path::new("/sys/class/dmi/id");
    if !base.exists() {
        return Err(AcquisitionError::new("board", "DMI information is not available"));
    }
    let labels = [
        ("Manufacturer", "board_vendor"),
        ("Product", "board_name"),
        ("SerialNumber", "board_serial"),
        ("BIOS Version", "bios_version"),
    ];
    Ok(labels
        .iter()
        .filter_map(|(label, file)| {
            let value = fs::read_to_string(base.join(file)).ok()?;
            Some(field(label, value.trim()))
        })
        .collect())
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn collect_board_details() -> Reading<FieldList> {
    Ok(Vec::new())
}

fn run_nvidia_smi(args: &[&str]) -> Option<std::process::Output> {
    if let Ok(output) = Command::new("nvidia-smi").args(args).output() {
        return Some(output);
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(output) = Command::new(r"C:\Windows\System32\nvidia-smi.exe")
            .args(args)
            .output()
        {
            return Some(output);
        }
    }

    debug!("nvidia-smi not available");
    None
}

#[cfg(target_os = "windows")]
fn run_powershell_text(script: &str) -> Result<String, String> {
    let wrapped_script = format!(
        "[Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); $OutputEncoding=[System.Text.UTF8Encoding]::new($false); {script}"
    );
    let output = Command::new("powershell")
        .args(["-NoProfile", "-Command", &wrapped_script])
        .output()
        .or_else(|_| {
            Command::new(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe")
                .args(["-NoProfile", "-Command", &wrapped_script])
                .output()
        })
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(decode_cmd_stdout(&output.stderr).trim().to_string());
    }
    Ok(decode_cmd_stdout(&output.stdout))
}

#[cfg(target_os = "linux")]
fn uevent_value(uevent: &str, key: &str) -> Option<String> {
    uevent.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k == key).then(|| v.trim().to_string())
    })
}

#[cfg(target_os = "linux")]
fn read_sysfs_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn field(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_rows_keyed_by_uuid() {
        let text = "GPU-8f1c, NVIDIA GeForce RTX 3080, 37, 8000, 2000, 10240, 64\n\
                    garbage line\n";
        let gpus = parse_nvidia_smi(text);
        assert_eq!(gpus.len(), 1);
        let gpu = &gpus[0];
        assert_eq!(gpu.key(), "GPU-8f1c");
        assert_eq!(gpu.field("Load"), Some("37%"));
        assert_eq!(gpu.field("Free Memory"), Some("8000MB"));
        assert_eq!(gpu.field("Total Memory"), Some("10240MB"));
        assert_eq!(gpu.field("Temperature"), Some("64 C"));
    }

    #[test]
    fn adapter_without_id_keys_on_name() {
        let reading = adapter_reading(None, "Basic Display Adapter", "N/A".to_string());
        assert_eq!(reading.key(), "Basic Display Adapter");
        assert_eq!(reading.field("Load"), Some("N/A"));
    }

    #[test]
    fn partition_reading_formats_usage() {
        let gib = 1024_u64 * 1024 * 1024;
        let reading = partition_reading("/dev/nvme0n1p2", "/", 100 * gib, 25 * gib);
        assert_eq!(reading.key(), "/");
        assert_eq!(reading.field("Total"), Some("100.00 GB"));
        assert_eq!(reading.field("Used"), Some("75.00 GB"));
        assert_eq!(reading.field("Free"), Some("25.00 GB"));
        assert_eq!(reading.field("Percent"), Some("75.0%"));

        let partial = partition_reading("/dev/sdb1", "/data", 3 * gib, 2 * gib);
        assert_eq!(partial.field("Percent"), Some("33.3%"));
    }

    #[test]
    fn smart_lines_keyed_by_device_id() {
        let text = "\\\\.\\PHYSICALDRIVE0|Samsung SSD 970|OK\n|USB Disk|Pred Fail\nbad\n";
        let smart = parse_smart_lines(text);
        assert_eq!(
            smart,
            vec![
                (
                    "\\\\.\\PHYSICALDRIVE0".to_string(),
                    "Samsung SSD 970 - OK".to_string()
                ),
                ("USB Disk".to_string(), "USB Disk - Pred Fail".to_string()),
            ]
        );
    }

    #[test]
    fn smartctl_verdicts() {
        let ata = "SMART overall-health self-assessment test result: PASSED\n";
        assert_eq!(parse_smartctl_health(ata), "OK");
        let failing = "SMART overall-health self-assessment test result: FAILED!\n";
        assert_eq!(parse_smartctl_health(failing), "FAILED!");
        assert_eq!(parse_smartctl_health("SMART Health Status: OK\n"), "OK");
        assert_eq!(parse_smartctl_health("Permission denied"), "Unknown");
    }

    #[test]
    fn sysinfo_source_reports_memory_and_cores() {
        let mut source = SysinfoSource::new();
        source.refresh();
        let ram = source.ram_stats().expect("memory is readable");
        assert!(ram.total_bytes > 0);
        assert!((0.0..=100.0).contains(&ram.percent));
        let cores = source.cpu_per_core_loads().expect("cpus are readable");
        assert!(!cores.is_empty());
    }
}
