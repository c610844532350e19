// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal single-line progress display for the build phase.

use std::io::{IsTerminal, Write};

#[derive(Debug, Default)]
pub struct StatusView {
    status: String,
    progress: Option<(u64, u64)>,
}

impl StatusView {
    pub fn new() -> Self {
        StatusView::default()
    }

    fn is_tty() -> bool {
        std::io::stderr().is_terminal()
    }

    pub fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
        self.progress = None;
        self.redraw();
    }

    pub fn set_progress(&mut self, current: u64, total: u64) {
        self.progress = Some((current, total));
        self.redraw();
    }

    fn redraw(&self) {
        if !Self::is_tty() {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        match self.progress {
            Some((current, total)) if total > 0 => {
                let percent = current * 100 / total;
                let _ = write!(stderr, "\r{:>4}% {}\x1b[K", percent, self.status);
            }
            _ => {
                let _ = write!(stderr, "\r      {}\x1b[K", self.status);
            }
        }
        let _ = stderr.flush();
    }

    /// Overwrites the progress line with the final message and restores
    /// normal line output.
    pub fn release_tty(&mut self, message: &str) {
        self.progress = None;
        self.status.clear();
        if Self::is_tty() {
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "\r\x1b[K");
            let _ = stderr.flush();
        }
        if !message.is_empty() {
            tracing::info!("{}", message.trim_end());
        }
    }
}

/// Renders a duration the way humans read build times.
pub fn prettify_seconds(seconds: u64) -> String {
    let (hours, rest) = (seconds / 3600, seconds % 3600);
    let (minutes, secs) = (rest / 60, rest % 60);
    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours} hour{}", if hours == 1 { "" } else { "s" }));
    }
    if minutes > 0 {
        parts.push(format!("{minutes} minute{}", if minutes == 1 { "" } else { "s" }));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs} second{}", if secs == 1 { "" } else { "s" }));
    }
    parts.join(" and ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prettifies_durations() {
        assert_eq!(prettify_seconds(0), "0 seconds");
        assert_eq!(prettify_seconds(1), "1 second");
        assert_eq!(prettify_seconds(61), "1 minute and 1 second");
        assert_eq!(prettify_seconds(3600), "1 hour");
        assert_eq!(prettify_seconds(3725), "1 hour and 2 minutes and 5 seconds");
    }
}
