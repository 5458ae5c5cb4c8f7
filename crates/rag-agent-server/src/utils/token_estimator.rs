/// Token estimation for Indonesian/English mixed content.
/// Word-based heuristic: both languages average ~1.3 tokens per word,
/// which tracks real tokenizer counts far better than chars/4.
use unicode_segmentation::UnicodeSegmentation;

pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.unicode_words().count();

    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

/// Check if adding text would exceed limit
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation() {
        // 7 words * 1.3 + 5 = 14.1 ≈ 15
        let text = "Ini adalah dokumen test yang berisi informasi";
        let tokens = estimate_tokens(text);
        assert!(tokens >= 13 && tokens <= 16);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_would_exceed() {
        let current = 1000;
        // ~500 words ≈ 655 tokens
        let text = "pasal ".repeat(500);
        assert!(would_exceed_limit(current, &text, 1500));
        assert!(!would_exceed_limit(current, &text, 2000));
    }
}
