//! Language-detection hint for the translation capability.
//!
//! When translation is configured, items that already read as the target
//! language are marked `no_translate` so the downstream provider is never
//! called for them. This is a cost-saving hint, not a contract; a wrong
//! guess only means one unnecessary translation call.

/// Detection threshold: the statistical detector must be at least this
/// confident before we skip translation.
const MIN_CONFIDENCE: f64 = 0.6;

/// How much of the content to feed the detector alongside the title.
const SNIPPET_LEN: usize = 400;

/// True when the item's title + snippet already reads as `target_lang`.
///
/// `target_lang` accepts ISO 639-1 ("en") or 639-3 ("eng") codes.
pub fn no_translate_needed(title: &str, content: Option<&str>, target_lang: &str) -> bool {
    let target = target_lang.trim().to_lowercase();
    if target.is_empty() {
        return false;
    }

    let mut sample = title.to_string();
    if let Some(content) = content {
        sample.push(' ');
        // Cheap tag strip so markup does not skew the detector.
        let text: String = strip_tags(content);
        let end = text.len().min(SNIPPET_LEN);
        let end = (0..=end).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
        sample.push_str(&text[..end]);
    }

    let Some(info) = whatlang::detect(&sample) else {
        return false;
    };
    if info.confidence() < MIN_CONFIDENCE {
        return false;
    }

    let code = info.lang().code(); // ISO 639-3, e.g. "eng"
    code == target || (target.len() == 2 && code.starts_with(&target))
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_english_text_skips_english_translation() {
        assert!(no_translate_needed(
            "The quick brown fox jumps over the lazy dog",
            Some("A perfectly ordinary English sentence about nothing in particular."),
            "en",
        ));
    }

    #[test]
    fn test_german_text_does_not_skip_english_translation() {
        assert!(!no_translate_needed(
            "Die Bundesregierung hat heute beschlossen",
            Some("Der Ausschuss wird die Angelegenheit in der kommenden Woche beraten."),
            "en",
        ));
    }

    #[test]
    fn test_three_letter_target_code() {
        assert!(no_translate_needed(
            "The quick brown fox jumps over the lazy dog",
            None,
            "eng",
        ));
    }

    #[test]
    fn test_empty_target_never_skips() {
        assert!(!no_translate_needed("Whatever", None, ""));
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(strip_tags("<p>Hello <b>world</b></p>"), "Hello world");
    }
}
