use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use tracing::warn;

/// Operator consent for disruptive checks. Blocks until an answer is available.
pub trait ConsentPrompt: Send + Sync {
    fn ask_yes_no(&self, prompt: &str) -> bool;
}

/// Answers every prompt the same way (`--assume-yes` / `--assume-no`).
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl ConsentPrompt for FixedAnswer {
    fn ask_yes_no(&self, _prompt: &str) -> bool {
        self.0
    }
}

/// Line-oriented prompt; anything other than `y`/`yes` declines, and so does EOF.
pub struct LinePrompt {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl LinePrompt {
    pub fn new(input: impl BufRead + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
        }
    }

    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stderr())
    }

    fn ask(&self, prompt: &str) -> io::Result<bool> {
        {
            let mut out = self.output.lock().unwrap_or_else(|p| p.into_inner());
            write!(out, "{prompt} [y/N]: ")?;
            out.flush()?;
        }
        let mut line = String::new();
        let read = self
            .input
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .read_line(&mut line)?;
        if read == 0 {
            return Ok(false);
        }
        let answer = line.trim().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

impl ConsentPrompt for LinePrompt {
    fn ask_yes_no(&self, prompt: &str) -> bool {
        match self.ask(prompt) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "consent prompt failed, treating as declined");
                false
            }
        }
    }
}
