//! Similarity measures used to rank recorded requests
//!
//! Text requests are compared by edit distance; binary requests by the
//! Jaccard similarity of their k-shingle sets, with `k` scaled to the
//! request length.

use std::collections::HashSet;

/// Levenshtein distance between two byte strings
pub fn levenshtein(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two rolling rows instead of the full matrix
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1) // deletion
                .min(curr[j] + 1) // insertion
                .min(prev[j] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Shingle size for a buffer of `length` bytes: `length / n` clamped to
/// `[k_min, k_max]`
pub fn adaptive_k(length: usize, k_min: usize, k_max: usize, n: usize) -> usize {
    let k = if n == 0 { k_max } else { length / n };
    k.clamp(k_min, k_max.max(k_min))
}

/// Set of all contiguous `k`-byte windows of `data`
///
/// Empty when `data` is shorter than `k`.
pub fn create_shingles(data: &[u8], k: usize) -> HashSet<&[u8]> {
    if k == 0 {
        return HashSet::new();
    }
    data.windows(k).collect()
}

/// `|A ∩ B| / |A ∪ B|`, or 0.0 when both sets are empty
pub fn jaccard_similarity<'a>(a: &HashSet<&'a [u8]>, b: &HashSet<&'a [u8]>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;

    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Whether every byte is a printable ASCII character (space through `~`)
pub fn is_ascii_printable(data: &[u8]) -> bool {
    data.iter().all(|&b| (0x20..=0x7e).contains(&b))
}
