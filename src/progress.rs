//! Fetch progress reporting.
//!
//! Reports observable progress during `dragnet run-chunk` so users see which
//! id is being probed, when progress is flushed to the manifest, and when a
//! partition's circuit breaker trips. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a chunk run.
#[derive(Clone, Debug)]
pub enum FetchProgressEvent {
    /// About to probe `id`; `n` of `total` ids in this chunk.
    Probing {
        partition: String,
        id: u64,
        n: u64,
        total: u64,
    },
    /// `count` outcomes were just flushed durably to the manifest.
    Flushed { partition: String, count: u64 },
    /// The consecutive-miss breaker aborted the chunk at `id`.
    Tripped { partition: String, id: u64 },
}

/// Reports fetch progress. Implementations write to stderr (human or JSON).
pub trait FetchProgressReporter: Send + Sync {
    fn report(&self, event: FetchProgressEvent);
}

/// Human-friendly progress: "run EPL  probing 2000183  (84 / 200)".
pub struct StderrProgress;

impl FetchProgressReporter for StderrProgress {
    fn report(&self, event: FetchProgressEvent) {
        let line = match &event {
            FetchProgressEvent::Probing {
                partition,
                id,
                n,
                total,
            } => {
                format!(
                    "run {}  probing {}  ({} / {})\n",
                    partition,
                    id,
                    format_number(*n),
                    format_number(*total)
                )
            }
            FetchProgressEvent::Flushed { partition, count } => {
                format!("run {}  flushed {} outcomes\n", partition, count)
            }
            FetchProgressEvent::Tripped { partition, id } => {
                format!(
                    "run {}  circuit breaker tripped at {} (likely past end of data)\n",
                    partition, id
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl FetchProgressReporter for JsonProgress {
    fn report(&self, event: FetchProgressEvent) {
        let obj = match &event {
            FetchProgressEvent::Probing {
                partition,
                id,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "partition": partition,
                "phase": "probing",
                "id": id,
                "n": n,
                "total": total
            }),
            FetchProgressEvent::Flushed { partition, count } => serde_json::json!({
                "event": "progress",
                "partition": partition,
                "phase": "flushed",
                "count": count
            }),
            FetchProgressEvent::Tripped { partition, id } => serde_json::json!({
                "event": "progress",
                "partition": partition,
                "phase": "tripped",
                "id": id
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl FetchProgressReporter for NoProgress {
    fn report(&self, _event: FetchProgressEvent) {}
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
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Box<dyn FetchProgressReporter> {
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
