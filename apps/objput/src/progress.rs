//! Console progress output.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use objput_transfer::{ProgressEvent, ProgressListener, SpeedCalculator, Transfer};

/// Prints transfer progress to a writer (stdout in the binary).
///
/// Data events are only printed when a transfer's whole percentage changes.
pub struct ConsoleReporter<W> {
    out: Mutex<W>,
    seen: Mutex<HashMap<Transfer, Seen>>,
}

struct Seen {
    consumed: u64,
    percent: Option<u64>,
    speed: SpeedCalculator,
}

impl Default for Seen {
    fn default() -> Self {
        Self {
            consumed: 0,
            percent: None,
            speed: SpeedCalculator::new(None, None),
        }
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes the reporter and returns its writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap()
    }

    fn render(&self, event: &ProgressEvent) -> Option<String> {
        let s = event.snapshot();
        let label = label(s.transfer);
        if event.is_terminal() {
            self.seen.lock().unwrap().remove(&s.transfer);
        }
        match event {
            ProgressEvent::Started(_) => {
                self.seen.lock().unwrap().insert(s.transfer, Seen::default());
                Some(format!("{label} started, total bytes: {}.\n", s.total_bytes))
            }
            ProgressEvent::DataTransferred(_) => {
                let percent = event.percent();
                let mut seen = self.seen.lock().unwrap();
                let entry = seen.entry(s.transfer).or_default();
                entry
                    .speed
                    .add_sample(s.consumed_bytes.saturating_sub(entry.consumed));
                entry.consumed = s.consumed_bytes;
                if entry.percent == Some(percent) {
                    return None;
                }
                entry.percent = Some(percent);
                let eta = entry
                    .speed
                    .eta(s.total_bytes.saturating_sub(s.consumed_bytes));
                Some(format!(
                    "\r{label} uploading, consumed bytes: {}, total bytes: {}, {percent}%, {}/s, eta {}.",
                    s.consumed_bytes,
                    s.total_bytes,
                    human_bytes(entry.speed.bytes_per_second() as u64),
                    human_eta(eta)
                ))
            }
            ProgressEvent::Completed(_) => Some(format!(
                "\n{label} completed, consumed bytes: {}, total bytes: {}.\n",
                s.consumed_bytes, s.total_bytes
            )),
            ProgressEvent::Failed(_) => Some(format!(
                "\n{label} failed, consumed bytes: {}, total bytes: {}.\n",
                s.consumed_bytes, s.total_bytes
            )),
        }
    }
}

impl<W: Write + Send> ProgressListener for ConsoleReporter<W> {
    fn on_event(&self, event: &ProgressEvent) {
        if let Some(line) = self.render(event) {
            let mut out = self.out.lock().unwrap();
            // Progress output is best effort.
            let _ = out.write_all(line.as_bytes());
            let _ = out.flush();
        }
    }
}

fn label(transfer: Transfer) -> String {
    match transfer {
        Transfer::Whole => "object".to_string(),
        Transfer::Part(n) => format!("part {n}"),
    }
}

/// Formats an estimated remaining time as `1h02m03s`, `4m05s` or `6s`.
fn human_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "--".to_string();
    };
    let secs = eta.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Formats a byte count with a binary unit, e.g. `1.5 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
