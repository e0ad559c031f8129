use crate::config::ScanConfig;
use crate::scan::classify::Failure;
use crate::scan::privilege::PrivilegeProbe;
use crate::scan::runner::CommandRunner;
use crate::scan::{CheckResult, ScanCheck};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The Windows repair and diagnostic tools that make up a full scan.
pub struct SystemChecks {
    runner: CommandRunner,
    privilege: Arc<dyn PrivilegeProbe>,
    report_dir: PathBuf,
    volume: String,
    energy_trace_secs: u64,
}

impl SystemChecks {
    pub fn new(runner: CommandRunner, privilege: Arc<dyn PrivilegeProbe>, cfg: &ScanConfig) -> Self {
        Self {
            runner,
            privilege,
            report_dir: cfg.report_dir.clone(),
            volume: cfg.system_volume.clone(),
            energy_trace_secs: cfg.energy_trace_secs,
        }
    }

    /// Execution order matters: disk-mutating checks first, the rebooting one last.
    pub fn full_scan_list(self: &Arc<Self>) -> Vec<ScanCheck> {
        vec![
            self.check("System File Checker", Self::run_sfc),
            self.check("DISM Image Repair", Self::run_dism),
            self.check("Disk Check (Scan)", Self::run_chkdsk_scan),
            self.check("Quick Disk Check", Self::run_chkdsk_quick),
            self.check("Power Monitor", Self::run_power_diag),
            self.check("Battery Health", Self::run_battery_report),
            self.check("Driver Verifier", Self::run_driver_verifier),
            self.check("Memory Diagnostic", Self::run_memory_diag).rebooting(),
        ]
    }

    fn check(self: &Arc<Self>, name: &str, run: fn(&Self) -> CheckResult) -> ScanCheck {
        let this = Arc::clone(self);
        ScanCheck::new(name, move || run(&this))
    }

    fn elevated(&self) -> Result<(), CheckResult> {
        if self.privilege.is_elevated() {
            Ok(())
        } else {
            Err(CheckResult::Failed(Failure::AdminRequired))
        }
    }

    pub fn run_sfc(&self) -> CheckResult {
        if let Err(denied) = self.elevated() {
            return denied;
        }
        self.runner.run(
            &argv(["sfc", "/scannow"]),
            &[
                (
                    "Windows Resource Protection did not find any integrity violations",
                    "No Integrity Violations",
                ),
                ("successfully repaired", "Violations Found & Repaired"),
            ],
            "Scan Complete",
        )
    }

    pub fn run_dism(&self) -> CheckResult {
        if let Err(denied) = self.elevated() {
            return denied;
        }
        self.runner.run(
            &argv(["DISM", "/Online", "/Cleanup-Image", "/RestoreHealth"]),
            &[],
            "Restore Operation Successful",
        )
    }

    pub fn run_chkdsk_scan(&self) -> CheckResult {
        if let Err(denied) = self.elevated() {
            return denied;
        }
        self.runner.run(
            &argv(["chkdsk", self.volume.as_str(), "/scan"]),
            &[("found no problems", "No Problems Found")],
            "Scan Complete",
        )
    }

    pub fn run_chkdsk_quick(&self) -> CheckResult {
        if let Err(denied) = self.elevated() {
            return denied;
        }
        self.runner.run(
            &argv(["chkdsk", self.volume.as_str(), "/scan", "/perf"]),
            &[("found no problems", "No Problems Found")],
            "Quick Scan Complete",
        )
    }

    pub fn run_power_diag(&self) -> CheckResult {
        if let Err(denied) = self.elevated() {
            return denied;
        }
        let report = self.fresh_report_path("energy-report.html");
        let report_arg = report.display().to_string();
        let duration = self.energy_trace_secs.to_string();
        self.runner.run(
            &argv(["powercfg", "/energy", "/output", report_arg.as_str(), "/duration", duration.as_str()]),
            &[],
            &format!("Report generated at {report_arg}"),
        )
    }

    pub fn run_battery_report(&self) -> CheckResult {
        if let Err(denied) = self.elevated() {
            return denied;
        }
        let report = self.fresh_report_path("battery-report.html");
        let report_arg = report.display().to_string();
        self.runner.run(
            &argv(["powercfg", "/batteryreport", "/output", report_arg.as_str()]),
            &[],
            &format!("Report generated at {report_arg}"),
        )
    }

    pub fn run_driver_verifier(&self) -> CheckResult {
        self.runner
            .launch(&argv(["verifier", "/gui"]), "Driver Verifier GUI launched.")
    }

    pub fn run_memory_diag(&self) -> CheckResult {
        self.runner
            .launch(&argv(["mdsched.exe"]), "Memory Diagnostic Launched")
    }

    /// Absolute report path with any previous report removed.
    fn fresh_report_path(&self, file_name: &str) -> PathBuf {
        let path = absolute(&self.report_dir.join(file_name));
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %err, "could not remove previous report");
            }
        }
        path
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
