//! "Did you mean?" suggestions for misspelled function and variable names.
//!
//! Levenshtein distance with a threshold that grows with the length of the
//! misspelled name, so short names only match near-identical candidates.

/// Minimum number of single-character insertions, deletions or
/// substitutions turning `a` into `b`.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Edits allowed for a name of `len` characters.
pub fn threshold(len: usize) -> usize {
    match len {
        0 => 0,
        1..=2 => 1,
        3..=5 => 2,
        6..=10 => 3,
        n => (n / 2).min(5),
    }
}

/// Up to `max` candidates within [`threshold`] of `name`, closest first,
/// ties broken alphabetically.  Comparison ignores ASCII case.
pub fn suggest_similar<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    max: usize,
) -> Vec<&'a str> {
    if name.is_empty() || max == 0 {
        return Vec::new();
    }
    let needle = name.to_ascii_lowercase();
    let limit = threshold(needle.chars().count());

    let mut matches: Vec<(&str, usize)> = candidates
        .into_iter()
        .filter_map(|c| {
            if needle.len().abs_diff(c.len()) > limit {
                return None;
            }
            let d = edit_distance(&needle, &c.to_ascii_lowercase());
            (d <= limit).then_some((c, d))
        })
        .collect();

    matches.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    matches.dedup_by(|a, b| a.0 == b.0);
    matches.into_iter().take(max).map(|(c, _)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("", "ab"), 2);
    }

    #[test]
    fn thresholds_grow_with_length() {
        assert_eq!(threshold(2), 1);
        assert_eq!(threshold(4), 2);
        assert_eq!(threshold(8), 3);
        assert_eq!(threshold(30), 5);
    }

    #[test]
    fn suggests_closest_first() {
        let names = ["string-length", "string-concat", "substring", "abs"];
        let found = suggest_similar("string-lenght", names.iter().copied(), 3);
        assert_eq!(found.first(), Some(&"string-length"));
    }

    #[test]
    fn ignores_case() {
        let found = suggest_similar("ABS", ["abs", "max"], 5);
        assert_eq!(found, vec!["abs"]);
    }

    #[test]
    fn nothing_for_unrelated_names() {
        assert!(suggest_similar("xyzzy", ["+", "max", "string-concat"], 5).is_empty());
        assert!(suggest_similar("", ["a"], 5).is_empty());
    }
}
