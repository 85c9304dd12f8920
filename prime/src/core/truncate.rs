//! Head + tail elision for prompt-bound copies of large text.

/// Result of [`truncate_middle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub text: String,
    pub truncated: bool,
}

/// Keep the first and last `limit / 2` characters of `text` with an elision
/// marker naming the original length in between.
///
/// Lengths are counted in chars so the cut never splits a UTF-8 sequence.
/// `noun` names what was cut (`output`, `content`).
pub fn truncate_middle(text: &str, limit: usize, noun: &str) -> Truncated {
    let total = text.chars().count();
    if total <= limit {
        return Truncated {
            text: text.to_string(),
            truncated: false,
        };
    }

    let half = limit / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(total - half).collect();
    Truncated {
        text: format!("{head}\n...[{noun} truncated, {total} characters total]...\n{tail}"),
        truncated: true,
    }
}
