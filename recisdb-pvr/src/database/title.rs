//! Title normalization for duplicate detection.

/// Bracket characters stripped from titles.
const BRACKETS: &[char] = &[
    '(', ')', '[', ']', '{', '}', '<', '>', '【', '】', '「', '」', '『', '』', '〈', '〉', '《',
    '》', '〔', '〕', '（', '）', '［', '］', '｛', '｝', '＜', '＞',
];

/// Compact a program title for history comparison.
///
/// Full-width ASCII is folded to half-width, whitespace and brackets are
/// removed and the result is lower-cased, so `【新】 ニュース７` and
/// `[新]ニュース7` compare equal.
pub fn compact_title(title: &str) -> String {
    title
        .chars()
        .map(fold_width)
        .filter(|c| !c.is_whitespace() && !BRACKETS.contains(c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn fold_width(c: char) -> char {
    match c {
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        '\u{3000}' => ' ',
        _ => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_title() {
        assert_eq!(compact_title("【新】 ニュース７"), compact_title("[新]ニュース7"));
        assert_eq!(compact_title("ＡＢＣ　Ｄ"), "abcd");
        assert_eq!(compact_title("Drama (1)"), "drama1");
    }
}
