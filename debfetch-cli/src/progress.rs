//! Terminal progress for acquire runs.

use std::time::Duration;

use console::style;
use debfetch::{AcquireStatus, Item, ItemStatus, ProgressSnapshot};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Tick interval for the spinner.
const TICK_INTERVAL_MS: u64 = 120;

/// Prints `Get:`/`Hit:`/`Err:` lines above a byte progress bar.
pub struct TerminalStatus {
    bar: ProgressBar,
    line: usize,
}

impl TerminalStatus {
    pub fn new(visible: bool) -> Self {
        let bar = ProgressBar::new(0);
        if visible {
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.cyan} [{bar:30.cyan/dim}] {bytes}/{total_bytes} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("━╸━"),
            );
            bar.enable_steady_tick(Duration::from_millis(TICK_INTERVAL_MS));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self { bar, line: 0 }
    }

    fn print(&mut self, tag: String, item: &Item) {
        self.line += 1;
        self.bar
            .println(format!("{}:{} {}", tag, self.line, item.desc().description));
    }
}

impl AcquireStatus for TerminalStatus {
    fn fetch(&mut self, item: &Item) {
        self.bar.set_message(item.desc().short_desc.clone());
    }

    fn done(&mut self, item: &Item) {
        // still queued for a local pass
        if item.core.queue_counter > 0 {
            return;
        }
        if item.status() == ItemStatus::Done && item.is_complete() {
            self.print(style("Get").green().to_string(), item);
        }
    }

    fn fail(&mut self, item: &Item) {
        if item.status().is_failure() {
            self.print(style("Err").red().bold().to_string(), item);
            self.bar.println(format!("  {}", item.error_text()));
        } else if item.status() == ItemStatus::TransientNetworkError {
            self.print(style("Ign").yellow().to_string(), item);
        }
    }

    fn pulse(&mut self, progress: &ProgressSnapshot) {
        self.bar.set_length(progress.total_bytes.max(progress.current_bytes));
        self.bar.set_position(progress.current_bytes);
        self.bar.set_message(format!(
            "{}/{} items, {}/s",
            progress.done_items,
            progress.total_items,
            HumanBytes(progress.rate())
        ));
    }

    fn stop(&mut self, progress: &ProgressSnapshot) {
        self.bar.finish_and_clear();
        if progress.fetched_bytes > 0 {
            let secs = progress.elapsed.as_secs().max(1);
            eprintln!(
                "Fetched {} in {}s ({}/s)",
                HumanBytes(progress.fetched_bytes),
                secs,
                HumanBytes(progress.fetched_bytes / secs)
            );
        }
    }
}
