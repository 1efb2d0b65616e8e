//! Text shown on the device display.

use tracing::warn;

pub const MAX_OVERLAY_CHARS: usize = 32;
pub const MAX_LABEL_CHARS: usize = 8;

const OUTPUT_TOKEN: &str = "%output%";
const LAST_SEGMENT_TOKEN: &str = "%output%.%";

/// Substitutes command output into a `press_overlay` template.
///
/// `%output%.%` takes the last dot-separated segment of the output and wins
/// over `%output%`. The substituted value is shortened so that template and
/// value together stay within [`MAX_OVERLAY_CHARS`].
pub fn format_overlay(template: &str, output: &str) -> String {
    if output.is_empty() || !template.contains(OUTPUT_TOKEN) {
        return template.to_string();
    }

    let (token, value) = if template.contains(LAST_SEGMENT_TOKEN) {
        (
            LAST_SEGMENT_TOKEN,
            output.rsplit('.').next().unwrap_or(output),
        )
    } else {
        (OUTPUT_TOKEN, output)
    };

    let template_len = template.chars().count();
    let value_len = value.chars().count();
    let total = template_len + value_len;

    let value: String = if total > MAX_OVERLAY_CHARS {
        let keep = value_len.saturating_sub(total - MAX_OVERLAY_CHARS);
        value.chars().take(keep).collect()
    } else {
        value.to_string()
    };

    template.replacen(token, &value, 1)
}

/// Overlay for wheel actions: `"<text> <output>"`, or the text alone.
pub fn wheel_overlay(text: &str, output: &str) -> String {
    if output.is_empty() {
        text.to_string()
    } else {
        format!("{} {}", text, output)
    }
}

/// Hard-truncates a button label to what the key display can hold.
pub fn truncate_label(key: impl std::fmt::Display, text: &str) -> String {
    if text.chars().count() <= MAX_LABEL_CHARS {
        return text.to_string();
    }
    let short: String = text.chars().take(MAX_LABEL_CHARS).collect();
    warn!("Button {} text is too long, truncated to {}", key, short);
    short
}
