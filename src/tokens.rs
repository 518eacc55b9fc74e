//! Byte-cheap token estimation.
//!
//! Context budgeting only needs a rough upper bound, not the model's real
//! tokenizer. Four characters per token is the usual English-text estimate;
//! it overcounts short words and undercounts CJK, which is acceptable slack
//! for deciding when to trim history.

/// Estimate the token count of `text` (~4 chars per token, minimum 1 for
/// non-empty input).
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    if chars == 0 {
        return 0;
    }
    (chars / 4).max(1)
}
