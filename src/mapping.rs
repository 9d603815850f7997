#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Canonical-key transform applied to every caller string before it touches
/// the tree, so that many input strings may share one stored key.
///
/// Every mapping is idempotent: `m.apply(&m.apply(s)) == m.apply(s)`. The
/// tree relies on this to compare already-mapped keys without re-mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KeyMapping {
    /// Keys are stored exactly as given.
    Identity,
    /// Unicode-aware case fold to lowercase.
    Lowercase,
    /// Unicode-aware case fold to uppercase.
    Uppercase,
    /// Trims both ends and collapses any run of Unicode whitespace to a
    /// single U+0020.
    CollapseWhitespace,
    /// Replaces every maximal run of non-alphanumeric scalars with a single
    /// U+0020.
    NonLetterToSpace,
    /// Splits on Unicode whitespace, concatenates adjacent one-scalar
    /// alphanumeric tokens, rejoins with single U+0020. Trims both ends.
    JoinSingleLetters,
    /// [`CollapseWhitespace`](Self::CollapseWhitespace) followed by
    /// [`Lowercase`](Self::Lowercase).
    LowercaseCollapse,
}

impl Default for KeyMapping {
    fn default() -> Self {
        KeyMapping::Identity
    }
}

impl KeyMapping {
    pub fn apply(&self, input: &str) -> String {
        match self {
            KeyMapping::Identity => input.to_string(),
            KeyMapping::Lowercase => input.to_lowercase(),
            KeyMapping::Uppercase => input.to_uppercase(),
            KeyMapping::CollapseWhitespace => collapse_whitespace(input),
            KeyMapping::NonLetterToSpace => non_letter_to_space(input),
            KeyMapping::JoinSingleLetters => join_single_letters(input),
            KeyMapping::LowercaseCollapse => collapse_whitespace(input).to_lowercase(),
        }
    }

    /// Stable name used by the snapshot format to detect mapping mismatches.
    pub fn identifier(&self) -> &'static str {
        match self {
            KeyMapping::Identity => "identity",
            KeyMapping::Lowercase => "lowercase",
            KeyMapping::Uppercase => "uppercase",
            KeyMapping::CollapseWhitespace => "collapse-whitespace",
            KeyMapping::NonLetterToSpace => "non-letter-to-space",
            KeyMapping::JoinSingleLetters => "join-single-letters",
            KeyMapping::LowercaseCollapse => "lowercase-collapse",
        }
    }

    pub fn from_identifier(id: &str) -> Option<Self> {
        let mapping = match id {
            "identity" => KeyMapping::Identity,
            "lowercase" => KeyMapping::Lowercase,
            "uppercase" => KeyMapping::Uppercase,
            "collapse-whitespace" => KeyMapping::CollapseWhitespace,
            "non-letter-to-space" => KeyMapping::NonLetterToSpace,
            "join-single-letters" => KeyMapping::JoinSingleLetters,
            "lowercase-collapse" => KeyMapping::LowercaseCollapse,
            _ => return None,
        };
        Some(mapping)
    }
}

fn collapse_whitespace(input: &str) -> String {
    // split_whitespace trims and drops empty tokens, which is exactly the
    // trim-then-collapse contract
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_letter_to_space(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for c in input.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push(' ');
            in_run = true;
        }
    }
    out
}

fn join_single_letters(input: &str) -> String {
    fn is_single_alphanumeric(token: &str) -> bool {
        let mut chars = token.chars();
        matches!(
            (chars.next(), chars.next()),
            (Some(c), None) if c.is_alphanumeric()
        )
    }

    let mut out: Vec<String> = Vec::new();
    // adjacency is judged on the original tokens, not on merged output
    let mut prev_single = false;
    for token in input.split_whitespace() {
        let single = is_single_alphanumeric(token);
        match out.last_mut() {
            Some(last) if single && prev_single => last.push_str(token),
            _ => out.push(token.to_string()),
        }
        prev_single = single;
    }
    out.join(" ")
}
