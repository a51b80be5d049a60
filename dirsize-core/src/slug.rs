//! Deterministic slug generation for `ScanDescriptor.slug`.

use std::collections::HashSet;

/// Lowercases, folds whitespace/underscores to hyphens, strips anything
/// that isn't alphanumeric or a hyphen, collapses runs of hyphens, and
/// trims leading/trailing hyphens. Falls back to `"scan"` if the result
/// would be empty (e.g. a name made entirely of punctuation).
pub fn generate_slug(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let mut folded = String::with_capacity(lower.len());
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            folded.push(c);
        } else if c.is_whitespace() || c == '_' || c == '-' {
            folded.push('-');
        }
        // anything else (accents, punctuation, emoji) is dropped; callers
        // wanting full unicode transliteration should pre-fold the name.
    }

    let mut collapsed = String::with_capacity(folded.len());
    let mut last_was_hyphen = false;
    for c in folded.chars() {
        if c == '-' {
            if !last_was_hyphen {
                collapsed.push('-');
            }
            last_was_hyphen = true;
        } else {
            collapsed.push(c);
            last_was_hyphen = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        "scan".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Deterministic 8-hex-char identifier derived from the same normalized
/// input `generate_slug` uses, independent of creation time.
pub fn generate_short_uid(name: &str) -> String {
    use sha2::{Digest, Sha256};
    let normalized = name.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Suffixes colliding slugs with `-2`, `-3`, ... in input order, leaving
/// the first occurrence of each slug untouched. Keeps incrementing the
/// suffix past any candidate that collides with an already-used slug,
/// including a literal input that happens to look like a generated one.
pub fn ensure_unique_slugs(slugs: &[String]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(slugs.len());
    for slug in slugs {
        if used.insert(slug.clone()) {
            out.push(slug.clone());
            continue;
        }
        let mut n = 2u64;
        loop {
            let candidate = format!("{slug}-{n}");
            if used.insert(candidate.clone()) {
                out.push(candidate);
                break;
            }
            n += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_slug_basic() {
        assert_eq!(generate_slug("Home Documents"), "home-documents");
        assert_eq!(generate_slug("  spaced  out  "), "spaced-out");
        assert_eq!(generate_slug("under_score_name"), "under-score-name");
    }

    #[test]
    fn generate_slug_strips_punctuation_and_collapses() {
        assert_eq!(generate_slug("Docs!! & Media??"), "docs-media");
        assert_eq!(generate_slug("a---b"), "a-b");
    }

    #[test]
    fn generate_slug_empty_falls_back() {
        assert_eq!(generate_slug("***"), "scan");
        assert_eq!(generate_slug(""), "scan");
    }

    #[test]
    fn generate_slug_is_deterministic() {
        assert_eq!(generate_slug("Media Share"), generate_slug("Media Share"));
    }

    #[test]
    fn generate_short_uid_is_deterministic_and_8_chars() {
        let a = generate_short_uid("Media Share");
        let b = generate_short_uid("Media Share");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn ensure_unique_slugs_suffixes_in_order() {
        let input = vec![
            "docs".to_string(),
            "media".to_string(),
            "docs".to_string(),
            "docs".to_string(),
        ];
        let out = ensure_unique_slugs(&input);
        assert_eq!(out, vec!["docs", "media", "docs-2", "docs-3"]);
    }

    #[test]
    fn ensure_unique_slugs_avoids_colliding_with_a_literal_suffix_slug() {
        let input = vec![
            "docs".to_string(),
            "docs".to_string(),
            "docs-2".to_string(),
        ];
        let out = ensure_unique_slugs(&input);
        let unique: std::collections::HashSet<_> = out.iter().collect();
        assert_eq!(unique.len(), out.len(), "output must be a set: {out:?}");
        assert_eq!(out, vec!["docs", "docs-2", "docs-2-2"]);
    }
}
