//! Per-chunk progress reporting.
//!
//! The copy loop rewrites a single stderr line after every successful chunk
//! so a supervisor (or a human) watching the run can see the cumulative byte
//! count and the offset to resume from if the process gives up.

use std::io::Write;

pub struct ProgressPrinter {
    last_bytes: u64,
    last_update: std::time::Instant,
    dirty: bool,
}

impl ProgressPrinter {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_update: std::time::Instant::now(),
            dirty: false,
        }
    }

    /// Format the progress line for a completed chunk. `copied` is the
    /// cumulative byte count for this run, `position` the new logical EOF.
    fn render(&mut self, copied: u64, position: u64) -> String {
        let time_now = std::time::Instant::now();
        let elapsed_secs = (time_now - self.last_update).as_secs_f64();
        let rate = if elapsed_secs > 0.0 {
            ((copied - self.last_bytes) as f64 / elapsed_secs) as u64
        } else {
            0
        };
        self.last_bytes = copied;
        self.last_update = time_now;
        format!(
            "copied {} bytes: new EOF is {} ({}/s)",
            copied,
            position,
            bytesize::ByteSize(rate)
        )
    }

    /// Overwrite the progress line on stderr.
    pub fn chunk_done(&mut self, copied: u64, position: u64) {
        let line = self.render(copied, position);
        eprint!("\r{line}");
        let _ = std::io::stderr().flush();
        self.dirty = true;
    }

    /// Terminate the progress line so later output starts on a fresh one.
    pub fn finish(&mut self) {
        if self.dirty {
            eprintln!();
            self.dirty = false;
        }
    }
}

impl Default for ProgressPrinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_shows_cumulative_bytes_and_eof() {
        let mut printer = ProgressPrinter::new();
        let line = printer.render(1_048_576, 1_048_576);
        assert!(line.starts_with("copied 1048576 bytes: new EOF is 1048576"));
        let line = printer.render(2_500_000, 2_500_000);
        assert!(line.starts_with("copied 2500000 bytes: new EOF is 2500000"));
    }

    #[test]
    fn render_includes_rate() {
        let mut printer = ProgressPrinter::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let line = printer.render(1000, 1000);
        assert!(line.contains("/s)"), "no rate in {line:?}");
    }
}
