//! Output helpers for consistent CLI output.
//!
//! Status lines go to stderr so that manifests and JSON reports written to
//! stdout stay machine-readable:
//! - Status messages with colored prefixes
//! - Aligned key/value reports on stdout
//! - A progress bar that follows a running build
//!
//! # Example
//!
//! ```rust,ignore
//! use imgforge::output::Output;
//!
//! Output::success("Wrote manifest to disk.json");
//! Output::warning("swap is not supported by bootc-disk");
//! Output::info("Resolving 3 package sets...");
//! ```

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use std::borrow::Cow;
use std::time::Duration;
use tracing::debug;

use crate::osbuild::monitor::Status;

/// Standard output helper for consistent CLI formatting.
pub struct Output;

impl Output {
    /// Whether stderr is attached to a terminal.
    pub fn is_interactive() -> bool {
        std::io::stderr().is_terminal()
    }

    /// Print a success message with a green checkmark.
    ///
    /// Example: `✓ Wrote manifest to disk.json`
    pub fn success(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✓".green().bold(), msg.as_ref());
    }

    /// Print an error message with a red X.
    pub fn error(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), msg.as_ref().red());
    }

    /// Print a warning message with a yellow warning symbol.
    pub fn warning(msg: impl AsRef<str>) {
        eprintln!("{} {}", "⚠".yellow(), msg.as_ref());
    }

    /// Print an info/status message with a cyan arrow.
    pub fn info(msg: impl AsRef<str>) {
        eprintln!("{} {}", "→".cyan(), msg.as_ref().dimmed());
    }

    pub fn step(msg: impl AsRef<str>) {
        eprintln!("  {} {}", "•".cyan(), msg.as_ref());
    }

    pub fn hint(msg: impl AsRef<str>) {
        eprintln!("  {} {}", "→".cyan(), msg.as_ref());
    }

    /// Print a section title of a report.
    pub fn header(msg: impl AsRef<str>) {
        println!("\n{}\n", msg.as_ref().bold().cyan());
    }

    pub fn subheader(msg: impl AsRef<str>) {
        println!("{}", msg.as_ref().bold());
    }

    pub fn list_item(msg: impl AsRef<str>) {
        println!("  {}", msg.as_ref());
    }

    /// Print a key-value pair with alignment.
    ///
    /// Example: `  Pipelines:     build, os, image`
    pub fn kv(key: impl AsRef<str>, value: impl AsRef<str>) {
        println!("  {:<14} {}", format!("{}:", key.as_ref()).cyan(), value.as_ref());
    }

    /// Create a spinner for long-running operations.
    pub fn spinner(msg: impl Into<Cow<'static, str>>) -> Spinner {
        let pb = ProgressBar::new_spinner();
        if !Self::is_interactive() {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(msg);
        pb.enable_steady_tick(Duration::from_millis(80));
        Spinner(pb)
    }

    /// Create a progress bar that follows a build's monitor stream.
    pub fn build_progress() -> BuildProgress {
        let pb = ProgressBar::new(0);
        if !Self::is_interactive() {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n  {bar:40.cyan/blue} {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );
        BuildProgress {
            bar: pb,
            pipeline: String::new(),
        }
    }
}

/// A spinner for long-running operations.
pub struct Spinner(ProgressBar);

impl Spinner {
    pub fn set_message(&self, msg: impl Into<Cow<'static, str>>) {
        self.0.set_message(msg);
    }

    pub fn finish_success(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "✓".green().bold(), msg.as_ref()));
    }

    pub fn finish_error(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "✗".red().bold(), msg.as_ref()));
    }

    pub fn finish_clear(self) {
        self.0.finish_and_clear();
    }
}

/// Progress bar over the top level of the engine's progress tree, with the
/// innermost level's name as the message.
pub struct BuildProgress {
    bar: ProgressBar,
    pipeline: String,
}

impl BuildProgress {
    pub fn update(&mut self, status: &Status) {
        if let Some(progress) = &status.progress {
            self.bar.set_length(progress.total);
            self.bar.set_position(progress.done);
            let mut inner = progress;
            while let Some(sub) = inner.sub_progress.as_deref() {
                inner = sub;
            }
            let pipeline = status.pipeline();
            if !pipeline.is_empty() {
                self.pipeline = pipeline.to_string();
            }
            let label = match (self.pipeline.is_empty(), inner.message.is_empty()) {
                (true, _) => inner.message.clone(),
                (false, true) => self.pipeline.clone(),
                (false, false) => format!("{}: {}", self.pipeline, inner.message),
            };
            self.bar.set_message(label);
        }
        if !status.message.is_empty() {
            self.bar.println(format!("{} {}", "→".cyan(), status.message));
        }
        if !status.trace.is_empty() {
            debug!(pipeline = status.pipeline(), "{}", status.trace.trim_end());
        }
    }

    /// Current position and length, for callers that report a summary.
    pub fn position(&self) -> (u64, u64) {
        (self.bar.position(), self.bar.length().unwrap_or(0))
    }

    pub fn finish_success(self, msg: impl AsRef<str>) {
        self.bar
            .finish_with_message(format!("{} {}", "✓".green().bold(), msg.as_ref()));
    }

    pub fn finish_error(self, msg: impl AsRef<str>) {
        self.bar
            .finish_with_message(format!("{} {}", "✗".red().bold(), msg.as_ref()));
    }
}
