//! Prompt language guard.
//!
//! The GLM backend behind this router is tuned for English and Spanish;
//! Chinese prompts are rejected up front, before any process is spawned.

/// User-facing rejection notice for CJK prompts.
pub const CJK_REJECTION_NOTICE: &str = "Unsupported prompt language: prompts containing Chinese \
    text are not accepted by this router. Allowed languages: English, Spanish. Use the primary \
    Claude model for Chinese input.";

/// Returns true if `text` contains CJK ideographs.
///
/// Covered ranges: CJK Unified Ideographs (U+4E00..U+9FFF), Extension A
/// (U+3400..U+4DBF), Extension B (U+20000..U+2A6DF).
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(
            c as u32,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_ideographs() {
        assert!(contains_cjk("请解释递归"));
        assert!(contains_cjk("mixed 中文 text"));
    }

    #[test]
    fn detects_extension_b() {
        // U+20000 is in CJK Extension B.
        assert!(contains_cjk("\u{20000}"));
    }

    #[test]
    fn ignores_latin_and_kana_free_text() {
        assert!(!contains_cjk(""));
        assert!(!contains_cjk("explain recursion"));
        assert!(!contains_cjk("¿qué es la recursión?"));
        // Hiragana is outside the covered ranges.
        assert!(!contains_cjk("ひらがな"));
    }
}
