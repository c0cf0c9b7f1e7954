//! One-shot job title generation

use std::time::Duration;
use tracing::debug;

use crate::process::{self, ProcessSpec};

/// Maximum title length in characters
pub const MAX_TITLE_LEN: usize = 60;

const INSTRUCTION: &str =
    "Reply with a short label (at most 60 characters, one line, no quotes) \
     summarizing this request. Reply with the label only.";

/// Derive a short human-readable title from a prompt.
///
/// Runs the assistant once in print mode with a small deadline; any
/// failure (missing binary, timeout, empty reply) falls back to a
/// truncated prefix of the prompt, so job creation never fails here.
pub async fn generate_title(binary: &str, prompt: &str, timeout: Duration) -> String {
    match try_generate(binary, prompt, timeout).await {
        Some(title) => title,
        None => {
            debug!("title generation fell back to prompt prefix");
            truncate_title(prompt)
        }
    }
}

async fn try_generate(binary: &str, prompt: &str, timeout: Duration) -> Option<String> {
    let instruction = format!("{}\n\n{}", INSTRUCTION, prompt);
    let spec = ProcessSpec::new(binary)
        .arg("--print")
        .arg("--")
        .arg(instruction);

    let mut handle = process::spawn(spec).ok()?;
    let mut rx = handle.take_output()?;

    let run = async move {
        let mut first_line = None;
        while let Some(line) = rx.recv().await {
            let line = line.trim().to_string();
            if !line.is_empty() {
                first_line = Some(line);
                break;
            }
        }
        // Drain the rest so the one-shot never blocks on a full pipe.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let status = handle.wait().await.ok()?;
        if !status.success() {
            return None;
        }
        first_line
    };

    // On deadline the future is dropped and kill_on_drop reaps the
    // straggler.
    match tokio::time::timeout(timeout, run).await {
        Ok(Some(line)) => Some(truncate_title(&line)),
        _ => None,
    }
}

/// Single-line prefix of at most [`MAX_TITLE_LEN`] characters
pub fn truncate_title(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or("").trim();
    first_line.chars().take(MAX_TITLE_LEN).collect()
}
