use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current epoch time in milliseconds.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub fn display_path(path: &Path, base: Option<&Path>) -> String {
    if let Some(base) = base {
        if let Ok(relative) = path.strip_prefix(base) {
            return relative.display().to_string();
        }
    }
    path.display().to_string()
}

/// Truncate at a char boundary without exceeding `max_bytes`.
pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Collapse runs of spaces and tabs, normalize line endings, and drop NUL bytes.
/// Line structure is kept so SQL comments stay intact.
pub fn clean_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n").replace('\0', "");
    let mut out = String::with_capacity(normalized.len());
    for (idx, line) in normalized.lines().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let mut last_space = false;
        for ch in line.trim_end().chars() {
            if ch == ' ' || ch == '\t' {
                if !last_space {
                    out.push(' ');
                }
                last_space = true;
            } else {
                out.push(ch);
                last_space = false;
            }
        }
    }
    out.trim().to_string()
}
