use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn spinner(msg: &str) -> ProgressBar {
    let style = ProgressStyle::default_spinner()
        .tick_strings(TICKS)
        .template("{spinner:.blue} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let pb = ProgressBar::new_spinner().with_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn finish(pb: &ProgressBar, mark: &str, msg: &str, started: Instant) {
    pb.set_style(ProgressStyle::default_spinner());
    pb.finish_with_message(format!(
        "{} {} ({:.1}s)",
        mark,
        msg,
        started.elapsed().as_secs_f64()
    ));
}

/// Run `op` behind a spinner. Image builds and launches can take minutes, so
/// the final line carries the elapsed time.
pub fn with_spinner<T, E, F>(msg: &str, op: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    let started = Instant::now();
    let pb = spinner(msg);
    let result = op();
    let mark = if result.is_ok() { "✔" } else { "✘" };
    finish(&pb, mark, msg, started);
    result
}
