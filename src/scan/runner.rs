use crate::scan::classify::Failure;
use crate::scan::CheckResult;
use std::io;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Process launching seam, so checks can be exercised without touching the host.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, argv: &[String]) -> io::Result<CommandOutput>;

    /// Starts the program and returns without waiting for it.
    fn spawn_detached(&self, argv: &[String]) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl SystemExecutor {
    fn command(argv: &[String]) -> io::Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command line"));
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        Ok(cmd)
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, argv: &[String]) -> io::Result<CommandOutput> {
        let output = Self::command(argv)?.stdin(Stdio::null()).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: decode_cmd_stdout(&output.stdout),
            stderr: decode_cmd_stdout(&output.stderr),
        })
    }

    fn spawn_detached(&self, argv: &[String]) -> io::Result<()> {
        let mut child = Self::command(argv)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let program = argv.first().cloned().unwrap_or_default();
        // Reaped off-thread so a long-lived daemon does not collect zombies.
        thread::Builder::new()
            .name("detached-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(program = %program, %status, "detached program exited"),
                Err(err) => debug!(program = %program, error = %err, "failed to wait on detached program"),
            })?;
        Ok(())
    }
}

/// Runs diagnostic tools to completion and turns their output into a [`CheckResult`].
pub struct CommandRunner {
    executor: Box<dyn CommandExecutor>,
}

impl CommandRunner {
    pub fn new(executor: impl CommandExecutor + 'static) -> Self {
        Self {
            executor: Box::new(executor),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemExecutor)
    }

    /// `markers` pairs a stdout substring with the message reported when it is
    /// present on a zero exit; the first hit wins, otherwise `fallback` is used.
    pub fn run(&self, argv: &[String], markers: &[(&str, &str)], fallback: &str) -> CheckResult {
        let output = match self.executor.execute(argv) {
            Ok(output) => output,
            Err(err) => {
                debug!(command = ?argv, error = %err, "command launch failed");
                return CheckResult::Failed(Failure::Launch(err.to_string()));
            }
        };

        if output.success {
            let message = markers
                .iter()
                .find(|(needle, _)| output.stdout.contains(needle))
                .map(|(_, message)| *message)
                .unwrap_or(fallback);
            return CheckResult::Passed(message.to_string());
        }

        let combined = output.combined();
        debug!(
            command = ?argv,
            exit_code = ?output.exit_code,
            output = %combined,
            "command reported failure"
        );
        CheckResult::Failed(Failure::from_output(&combined))
    }

    pub fn launch(&self, argv: &[String], message: &str) -> CheckResult {
        match self.executor.spawn_detached(argv) {
            Ok(()) => CheckResult::Passed(message.to_string()),
            Err(err) => {
                debug!(command = ?argv, error = %err, "detached launch failed");
                CheckResult::Failed(Failure::Launch(err.to_string()))
            }
        }
    }
}

/// Windows tools may print UTF-16LE when redirected; fall back through that to lossy UTF-8.
pub fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        if !utf8.contains('\0') {
            return utf8.to_string();
        }
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned outputs and records every command line it was given.
    #[derive(Clone, Default)]
    pub struct ScriptedExecutor {
        pub replies: Arc<Mutex<VecDeque<io::Result<CommandOutput>>>>,
        pub calls: Arc<Mutex<Vec<Vec<String>>>>,
        pub detached: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedExecutor {
        pub fn reply(self, reply: io::Result<CommandOutput>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }
    }

    impl CommandExecutor for ScriptedExecutor {
        fn execute(&self, argv: &[String]) -> io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(argv.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_output("")))
        }

        fn spawn_detached(&self, argv: &[String]) -> io::Result<()> {
            self.detached.lock().unwrap().push(argv.to_vec());
            Ok(())
        }
    }

    pub fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed_output(stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            exit_code: Some(1),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn zero_exit_picks_first_matching_marker() {
        let exec = ScriptedExecutor::default()
            .reply(Ok(ok_output("Windows Resource Protection found corrupt files and successfully repaired them.")));
        let runner = CommandRunner::new(exec);
        let result = runner.run(
            &argv(&["sfc", "/scannow"]),
            &[
                ("did not find any integrity violations", "No Integrity Violations"),
                ("successfully repaired", "Violations Found & Repaired"),
            ],
            "Scan Complete",
        );
        assert_eq!(result, CheckResult::Passed("Violations Found & Repaired".to_string()));
    }

    #[test]
    fn zero_exit_without_marker_uses_fallback() {
        let exec = ScriptedExecutor::default().reply(Ok(ok_output("done")));
        let runner = CommandRunner::new(exec);
        let result = runner.run(&argv(&["chkdsk"]), &[("found no problems", "x")], "Scan Complete");
        assert_eq!(result, CheckResult::Passed("Scan Complete".to_string()));
    }

    #[test]
    fn non_zero_exit_classifies_stdout_and_stderr() {
        let exec = ScriptedExecutor::default()
            .reply(Ok(failed_output("Deployment Image Servicing\n", "Error: 0x800f081f\n")));
        let runner = CommandRunner::new(exec);
        let result = runner.run(&argv(&["DISM"]), &[], "ok");
        assert_eq!(result, CheckResult::Failed(Failure::SourceFilesMissing));
    }

    #[test]
    fn launch_error_becomes_failure_with_error_text() {
        let exec = ScriptedExecutor::default().reply(Err(io::Error::new(
            io::ErrorKind::NotFound,
            "program not found",
        )));
        let runner = CommandRunner::new(exec);
        let result = runner.run(&argv(&["nope"]), &[], "ok");
        assert_eq!(result.message(), "program not found");
        assert!(!result.is_ok());
    }

    #[test]
    fn missing_binary_is_caught_by_system_executor() {
        let runner = CommandRunner::system();
        let result = runner.run(&argv(&["definitely-not-a-real-binary-7f3a"]), &[], "ok");
        assert!(matches!(result, CheckResult::Failed(Failure::Launch(_))));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let runner = CommandRunner::system();
        assert!(!runner.run(&[], &[], "ok").is_ok());
    }

    #[test]
    fn decodes_utf16_output() {
        let bytes: Vec<u8> = "ok\r\n".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(decode_cmd_stdout(&bytes), "ok\r\n");
        assert_eq!(decode_cmd_stdout(b"plain"), "plain");
    }

    #[cfg(target_os = "linux")]
    fn zombie_children() -> usize {
        let me = std::process::id().to_string();
        std::fs::read_dir("/proc")
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
            .filter(|stat| {
                let Some((_, rest)) = stat.rsplit_once(')') else {
                    return false;
                };
                let mut parts = rest.split_whitespace();
                parts.next() == Some("Z") && parts.next() == Some(me.as_str())
            })
            .count()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn detached_launch_is_reaped() {
        let runner = CommandRunner::system();
        let result = runner.launch(&argv(&["true"]), "launched");
        assert_eq!(result, CheckResult::Passed("launched".to_string()));

        std::thread::sleep(std::time::Duration::from_millis(300));
        assert_eq!(zombie_children(), 0);
    }
}
