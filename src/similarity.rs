// 📏 Similarity Scorer - token overlap + edit distance, both in [0, 1]

use crate::normalize::normalize_name;
use std::collections::HashSet;

/// Jaccard similarity of two token lists (treated as sets).
///
/// Two empty sets are identical (1.0).
pub fn jaccard_similarity<S: AsRef<str>>(a: &[S], b: &[S]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let set_a: HashSet<&str> = a.iter().map(AsRef::as_ref).collect();
    let set_b: HashSet<&str> = b.iter().map(AsRef::as_ref).collect();

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Levenshtein edit distance in characters (unit cost insert/delete/substitute).
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    // Keep the shorter string on the inner loop: O(min(n, m)) space
    let (long, short) = if a_chars.len() >= b_chars.len() {
        (&a_chars, &b_chars)
    } else {
        (&b_chars, &a_chars)
    };

    if short.is_empty() {
        return long.len();
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr = vec![0; short.len() + 1];

    for i in 1..=long.len() {
        curr[0] = i;
        for j in 1..=short.len() {
            let cost = if long[i - 1] == short[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[short.len()]
}

/// Edit similarity of two names, computed on their normalized forms.
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let s = normalize_name(a);
    let t = normalize_name(b);

    let n = s.chars().count();
    let m = t.chars().count();

    if n == 0 && m == 0 {
        return 1.0;
    }
    if n == 0 || m == 0 {
        return 0.0;
    }

    let distance = levenshtein_distance(&s, &t);
    1.0 - distance as f64 / n.max(m) as f64
}
