use colored::{ColoredString, Colorize};
use workflow::RunStatus;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Status text padded to `width`, colored by outcome.
pub fn status_label(status: RunStatus, width: usize) -> ColoredString {
    let text = format!("{:<width$}", status.as_str());
    match status {
        RunStatus::Succeeded => text.green(),
        RunStatus::SkippedIdempotent => text.cyan(),
        RunStatus::Failed => text.red().bold(),
        RunStatus::InProgress => text.yellow(),
        RunStatus::RolledBack => text.magenta(),
        RunStatus::Pending => text.dimmed(),
    }
}

/// Format milliseconds for tables: `850ms`, `12.3s`, `4m05s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// First line of `text`, cut to `max` characters.
pub fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= max {
        line.to_string()
    } else if max <= 3 {
        "...".to_string()
    } else {
        let kept: String = line.chars().take(max - 3).collect();
        format!("{kept}...")
    }
}

/// Display width of the widest item, at least `min`.
pub fn column_width<'a, I>(items: I, min: usize) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    items
        .into_iter()
        .map(|s| s.chars().count())
        .max()
        .unwrap_or(0)
        .max(min)
}

// ============================================================================
// Tests
// ============================================================================
