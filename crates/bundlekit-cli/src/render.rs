use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use bundlekit_core::{ArtifactClass, OutcomeKind, UpdateError};
use bundlekit_fetch::ProgressObserver;
use bundlekit_resolver::UpdateOutcome;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if !no_color && std::io::stderr().is_terminal() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        eprintln!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if self.style == OutputStyle::Rich {
            println!("{}", colorize(section_style(), &format!("== {title} ==")));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

pub(crate) fn describe_outcome(outcome: &UpdateOutcome) -> String {
    let artifact = outcome.artifact();
    match outcome {
        UpdateOutcome::AlreadyCurrent(_) => {
            format!("{} {} is up to date", artifact.class, artifact.version)
        }
        UpdateOutcome::UpdatedByFetch(_) => {
            format!("updated {} to {} (full download)", artifact.class, artifact.version)
        }
        UpdateOutcome::UpdatedByPatch(_) => {
            format!("updated {} to {} (patch)", artifact.class, artifact.version)
        }
    }
}

pub(crate) fn describe_failure(class: ArtifactClass, err: &UpdateError) -> String {
    if let UpdateError::UnknownVersion { version, .. } = err {
        return format!("{class} {version} is not available from the server: {err}");
    }
    let headline = match err.kind() {
        OutcomeKind::FetchFailed => format!("could not download {class}"),
        OutcomeKind::VerifyFailed => {
            format!("the downloaded {class} failed verification and was discarded")
        }
        OutcomeKind::LockTimeout => {
            format!("another instance is still updating {class}; try again later")
        }
        OutcomeKind::ManifestUnavailable => {
            format!("no usable {class} is installed and the artifact list is unavailable")
        }
        OutcomeKind::DiskFull => format!("not enough disk space to update {class}"),
        _ => format!("failed to install {class}"),
    };
    format!("{headline}: {err}")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) struct DownloadProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl DownloadProgress {
    pub(crate) fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl ProgressObserver for DownloadProgress {
    fn on_start(&self, label: &str, resumed_from: u64, total: Option<u64>) {
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<24} [{bar:24.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {eta}",
        ) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(progress_label(label).to_string());
        bar.set_position(resumed_from);
        bar.enable_steady_tick(Duration::from_millis(80));

        if let Ok(mut current) = self.bar.lock() {
            if let Some(previous) = current.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn on_progress(&self, bytes: u64) {
        if let Ok(current) = self.bar.lock() {
            if let Some(bar) = current.as_ref() {
                bar.inc(bytes);
            }
        }
    }

    fn on_finish(&self) {
        if let Ok(mut current) = self.bar.lock() {
            if let Some(bar) = current.take() {
                bar.finish_and_clear();
            }
        }
    }
}

pub(crate) fn progress_label(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => url,
    }
}
