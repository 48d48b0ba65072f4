//! Harvest progress reporting.
//!
//! Renders the scheduler's [`ProgressEvent`]s so operators can see how much
//! of the backlog is done during `harvest run`. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use survey_harvest_core::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Human-friendly progress on stderr: "harvest  1,234 / 5,000 items  landed  notifiable_weekly/2024-03".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Enumerated { total, resumed } => format!(
                "harvest  {} items {}\n",
                format_number(*total),
                if *resumed { "resumed from checkpoint" } else { "enumerated" }
            ),
            ProgressEvent::ItemResolved {
                item,
                outcome,
                done,
                total,
            } => format!(
                "harvest  {} / {} items  {}  {}\n",
                format_number(*done),
                format_number(*total),
                outcome,
                item
            ),
            ProgressEvent::Checkpointed { pending } => {
                format!("harvest  checkpoint saved, {} pending\n", format_number(*pending))
            }
            ProgressEvent::Stopped { phase, done, total } => format!(
                "harvest  {}  {} / {} items\n",
                phase,
                format_number(*done),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Enumerated { total, resumed } => serde_json::json!({
                "event": "progress",
                "phase": "enumerated",
                "total": total,
                "resumed": resumed
            }),
            ProgressEvent::ItemResolved {
                item,
                outcome,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "running",
                "item": item,
                "outcome": outcome,
                "n": done,
                "total": total
            }),
            ProgressEvent::Checkpointed { pending } => serde_json::json!({
                "event": "progress",
                "phase": "checkpointing",
                "pending": pending
            }),
            ProgressEvent::Stopped { phase, done, total } => serde_json::json!({
                "event": "progress",
                "phase": phase,
                "n": done,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
