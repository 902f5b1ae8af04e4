//! Screen-diff monitor.
//!
//! Used for bash windows and as the fallback when a log-based monitor cannot
//! start. Captures the cleaned pane on a timer and emits the lines that
//! changed since the previous snapshot.

use std::time::Duration;

use tokio::sync::watch;

use crate::monitor::{Monitor, OutputHandler, ParsedContent};
use crate::tmux::MuxHandle;
use crate::topic::TopicKey;

/// Polls a pane and diffs consecutive snapshots.
pub struct PaneMonitor {
    topic: TopicKey,
    window_id: String,
    mux: MuxHandle,
    poll_interval: Duration,
    handler: OutputHandler,
    stop_tx: Option<watch::Sender<bool>>,
}

impl PaneMonitor {
    #[must_use]
    pub fn new(
        topic: TopicKey,
        window_id: String,
        mux: MuxHandle,
        poll_interval: Duration,
        handler: OutputHandler,
    ) -> Self {
        Self {
            topic,
            window_id,
            mux,
            poll_interval,
            handler,
            stop_tx: None,
        }
    }
}

impl Monitor for PaneMonitor {
    fn start(&mut self) -> crate::error::Result<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let topic = self.topic.clone();
        let window_id = self.window_id.clone();
        let mux = std::sync::Arc::clone(&self.mux);
        let handler = self.handler.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut last_snapshot = mux
                .capture_pane_clean(&window_id)
                .await
                .unwrap_or_default();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {}
                }

                let Ok(current) = mux.capture_pane_clean(&window_id).await else {
                    continue;
                };
                if current == last_snapshot {
                    continue;
                }

                let changed = diff_snapshots(&last_snapshot, &current);
                last_snapshot = current;

                if !changed.is_empty() {
                    handler.as_ref()(&topic, ParsedContent::text(changed));
                }
            }
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// Extract the lines that changed between two pane snapshots.
///
/// When the line count did not grow, the screen likely redrew in place:
/// align on the matching suffix and report the changed prefix. When it grew,
/// new lines scrolled in: align on the common prefix and report the added
/// suffix. Whitespace-only lines are dropped either way.
#[must_use]
pub fn diff_snapshots(old: &str, current: &str) -> String {
    let old_lines: Vec<&str> = old.trim_end_matches('\n').split('\n').collect();
    let new_lines: Vec<&str> = current.trim_end_matches('\n').split('\n').collect();

    if new_lines.len() <= old_lines.len() {
        // Count matching trailing lines.
        let mut common = 0;
        while common < old_lines.len()
            && common < new_lines.len()
            && old_lines[old_lines.len() - 1 - common] == new_lines[new_lines.len() - 1 - common]
        {
            common += 1;
        }
        if common == new_lines.len() {
            return String::new();
        }
        let changed = &new_lines[..new_lines.len() - common];
        return join_non_empty(changed);
    }

    // More lines than before: find the common prefix with the old snapshot.
    let mut matched = 0;
    while matched < old_lines.len()
        && matched < new_lines.len()
        && old_lines[matched] == new_lines[matched]
    {
        matched += 1;
    }
    join_non_empty(&new_lines[matched..])
}

fn join_non_empty(lines: &[&str]) -> String {
    lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_snapshots_yield_nothing() {
        assert_eq!(diff_snapshots("a\nb\n", "a\nb\n"), "");
    }

    #[test]
    fn appended_lines_are_reported() {
        let old = "$ ls\nsrc\n";
        let new = "$ ls\nsrc\n$ cargo build\n   Compiling\n";
        assert_eq!(diff_snapshots(old, new), "$ cargo build\n   Compiling");
    }

    #[test]
    fn whitespace_only_lines_are_dropped() {
        let old = "a\n";
        let new = "a\n\n   \nb\n";
        assert_eq!(diff_snapshots(old, new), "b");
    }

    #[test]
    fn redraw_in_place_reports_changed_prefix() {
        // Same line count, top changed, bottom stable.
        let old = "progress 10%\nfooter\n";
        let new = "progress 90%\nfooter\n";
        assert_eq!(diff_snapshots(old, new), "progress 90%");
    }

    #[test]
    fn full_suffix_match_is_a_noop() {
        // Screen scrolled: the new snapshot is entirely a suffix of the old.
        let old = "one\ntwo\nthree\n";
        let new = "two\nthree\n";
        assert_eq!(diff_snapshots(old, new), "");
    }

    #[test]
    fn shrunk_screen_with_new_content() {
        let old = "one\ntwo\nthree\n";
        let new = "alpha\nthree\n";
        assert_eq!(diff_snapshots(old, new), "alpha");
    }

    #[test]
    fn empty_old_snapshot_reports_everything() {
        assert_eq!(diff_snapshots("", "hello\nworld\n"), "hello\nworld");
    }
}
