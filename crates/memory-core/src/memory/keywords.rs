//! Keyword extraction for the keyword-overlap ranking signal.
//!
//! Latin/digit runs become lowercase words; CJK runs become overlapping
//! character bigrams (a lone CJK character is kept as-is). Terms are ranked by
//! frequency, then first occurrence, and the top `MAX_KEYWORDS` are kept.

use std::collections::{BTreeSet, HashMap};

pub const MAX_KEYWORDS: usize = 20;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "if", "in", "is", "it",
    "me", "my", "no", "not", "of", "on", "or", "so", "the", "to", "up", "we", "you", "i",
];

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x20000..=0x2A6DF
        | 0xF900..=0xFAFF
        | 0x3040..=0x30FF
        | 0xAC00..=0xD7AF)
}

/// Ordered list of raw terms, duplicates included
fn terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, out: &mut Vec<String>| {
        if word.chars().count() >= 2 && !STOP_WORDS.contains(&word.as_str()) {
            out.push(std::mem::take(word));
        } else {
            word.clear();
        }
    };
    let flush_cjk = |run: &mut Vec<char>, out: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => out.push(run[0].to_string()),
            _ => out.extend(run.windows(2).map(|w| w.iter().collect::<String>())),
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut out);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut out);
            word.extend(c.to_lowercase());
        } else {
            flush_word(&mut word, &mut out);
            flush_cjk(&mut cjk_run, &mut out);
        }
    }
    flush_word(&mut word, &mut out);
    flush_cjk(&mut cjk_run, &mut out);
    out
}

/// Extract up to `MAX_KEYWORDS` keywords from `text`
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    let mut stats: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, term) in terms(text).into_iter().enumerate() {
        stats.entry(term).or_insert((0, pos)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = stats.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(term, _)| term)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin_words() {
        let kw = extract_keywords("I like Rust and the Rust compiler!");
        assert!(kw.contains("rust"));
        assert!(kw.contains("like"));
        assert!(kw.contains("compiler"));
        assert!(!kw.contains("the"));
        assert!(!kw.contains("i"));
    }

    #[test]
    fn test_cjk_bigrams() {
        let kw = extract_keywords("我们结婚吧");
        assert!(kw.contains("结婚"));
        assert!(kw.contains("我们"));
        assert_eq!(kw.len(), 4);
    }

    #[test]
    fn test_mixed_text() {
        let kw = extract_keywords("alan说你好;爱莉说hello");
        assert!(kw.contains("alan"));
        assert!(kw.contains("hello"));
        assert!(kw.contains("你好"));
    }

    #[test]
    fn test_capped() {
        let text = (0..100).map(|i| format!("word{} ", i)).collect::<String>();
        assert_eq!(extract_keywords(&text).len(), MAX_KEYWORDS);
    }

    #[test]
    fn test_frequency_wins_the_cap() {
        let mut text = (0..30).map(|i| format!("filler{} ", i)).collect::<String>();
        text.push_str("repeat repeat repeat");
        assert!(extract_keywords(&text).contains("repeat"));
    }

    #[test]
    fn test_empty() {
        assert!(extract_keywords("").is_empty());
        assert!(extract_keywords("!!! ...").is_empty());
    }
}
