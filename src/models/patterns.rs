// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Shell-style (`fnmatch`) pattern matching for model names and repo files.

use regex::Regex;

/// Compile an fnmatch pattern into an anchored regex.
///
/// Supports `*`, `?`, `[seq]` and `[!seq]`. A `]` directly after the opening
/// `[` (or `[!`) is part of the set, and an unterminated `[` matches
/// literally.
pub fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if chars.get(j) == Some(&'!') {
                    j += 1;
                }
                if chars.get(j) == Some(&']') {
                    j += 1;
                }
                match chars[j..].iter().position(|c| *c == ']') {
                    Some(rel) => {
                        let end = j + rel;
                        out.push_str(&translate_set(&chars[i + 1..end]));
                        i = end;
                    }
                    None => out.push_str("\\["),
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    Regex::new(&out)
}

/// Regex class for the body of an fnmatch `[...]` set.
fn translate_set(body: &[char]) -> String {
    let (negate, body) = match body.split_first() {
        Some((&'!', rest)) => (true, rest),
        _ => (false, body),
    };

    // Split on range hyphens. A hyphen in first position, or one that ends a
    // range, is literal.
    let mut chunks: Vec<Vec<char>> = Vec::new();
    let mut start = 0;
    let mut k = 1;
    while let Some(rel) = body.get(k..).and_then(|rest| rest.iter().position(|c| *c == '-')) {
        let hyphen = k + rel;
        chunks.push(body[start..hyphen].to_vec());
        start = hyphen + 1;
        k = hyphen + 3;
    }
    let tail = body.get(start..).unwrap_or_default();
    match chunks.last_mut() {
        Some(last) if tail.is_empty() => last.push('-'),
        _ => chunks.push(tail.to_vec()),
    }

    // Reversed ranges are empty; fold them away.
    for k in (1..chunks.len()).rev() {
        let reversed = match (chunks[k - 1].last(), chunks[k].first()) {
            (Some(lo), Some(hi)) => lo > hi,
            _ => false,
        };
        if reversed {
            let next = chunks.remove(k);
            chunks[k - 1].pop();
            chunks[k - 1].extend_from_slice(&next[1..]);
        }
    }

    let set = chunks
        .iter()
        .map(|chunk| {
            let mut escaped = String::new();
            for &c in chunk {
                if matches!(c, '\\' | '-' | '[' | ']' | '^' | '&' | '~') {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            escaped
        })
        .collect::<Vec<_>>()
        .join("-");

    match (negate, set.is_empty()) {
        (true, true) => ".".to_string(),
        // Matches nothing.
        (false, true) => "[^\\x00-\\x{10FFFF}]".to_string(),
        (true, false) => format!("[^{set}]"),
        (false, false) => format!("[{set}]"),
    }
}

/// True when `name` matches `pattern`. Malformed patterns match nothing.
pub fn fnmatch(name: &str, pattern: &str) -> bool {
    compile_logged(pattern).is_some_and(|r| r.is_match(name))
}

pub fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| fnmatch(name, p))
}

/// Keep files that match an allow pattern (all files when `allow` is empty)
/// and no ignore pattern.
pub fn filter_repo_objects<'a, I>(files: I, allow: &[String], ignore: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let allow: Vec<Regex> = allow.iter().filter_map(|p| compile_logged(p)).collect();
    let ignore: Vec<Regex> = ignore.iter().filter_map(|p| compile_logged(p)).collect();

    files
        .into_iter()
        .filter(|f| allow.is_empty() || allow.iter().any(|r| r.is_match(f)))
        .filter(|f| !ignore.iter().any(|r| r.is_match(f)))
        .cloned()
        .collect()
}

fn compile_logged(pattern: &str) -> Option<Regex> {
    match compile(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Ignoring malformed file pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        assert!(fnmatch("stabilityai/sd-2", "stabilityai/*"));
        assert!(fnmatch("unet/model.bin", "*.bin"));
        assert!(fnmatch("a1", "a?"));
        assert!(!fnmatch("a12", "a?"));
        assert!(!fnmatch("other/sd", "stabilityai/*"));
    }

    #[test]
    fn test_character_classes() {
        assert!(fnmatch("v1", "v[0-9]"));
        assert!(!fnmatch("vx", "v[0-9]"));
        assert!(fnmatch("vx", "v[!0-9]"));
        assert!(fnmatch("a[b", "a[b"));
    }

    #[test]
    fn test_leading_bracket_is_literal_in_sets() {
        assert!(fnmatch("]", "[]abc]"));
        assert!(fnmatch("b", "[]abc]"));
        assert!(!fnmatch("d", "[]abc]"));
        assert!(fnmatch("d", "[!]abc]"));
        assert!(!fnmatch("]", "[!]abc]"));

        assert!(fnmatch("[", "[[]"));
        assert!(fnmatch("x[1]", "x[[]1]"));
        assert!(fnmatch("a\\b", "a[\\]b"));
    }

    #[test]
    fn test_set_operators_are_literal_in_sets() {
        for pattern in ["[a&&b]", "[a~~b]", "[a^]", "[^a]"] {
            assert!(compile(pattern).is_ok(), "{pattern}");
        }
        assert!(fnmatch("&", "[a&&b]"));
        assert!(fnmatch("b", "[a&&b]"));
        assert!(!fnmatch("c", "[a&&b]"));
        assert!(fnmatch("~", "[a~~b]"));
        assert!(fnmatch("^", "[^a]"));
        assert!(fnmatch("a", "[^a]"));
        assert!(!fnmatch("b", "[^a]"));
    }

    #[test]
    fn test_hyphens_in_sets() {
        assert!(fnmatch("-", "[-a]"));
        assert!(fnmatch("-", "[a-]"));
        assert!(fnmatch("m", "[a-z]"));
        // `a--` is the range a..'-', which is empty, so only `z` is left
        assert!(fnmatch("z", "[a--z]"));
        assert!(!fnmatch("b", "[a--z]"));
        assert!(!fnmatch("m", "[z-a]"));
        assert!(fnmatch("m", "[!z-a]"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(fnmatch("model.safetensors", "model.safetensors"));
        assert!(!fnmatch("modelXsafetensors", "model.safetensors"));
        assert!(fnmatch("a+b(c)", "a+b(c)"));
    }

    #[test]
    fn test_filter_repo_objects() {
        let files: Vec<String> = ["unet/a.bin", "unet/a.safetensors", "vae/b.bin", "README.md"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let kept = filter_repo_objects(&files, &["unet/*".into()], &["*.safetensors".into()]);
        assert_eq!(kept, vec!["unet/a.bin"]);

        let all = filter_repo_objects(&files, &[], &[]);
        assert_eq!(all.len(), 4);

        let bracketed = filter_repo_objects(&files, &["[]uv]*".into()], &["[[]*".into()]);
        assert_eq!(bracketed, vec!["unet/a.bin", "unet/a.safetensors", "vae/b.bin"]);
    }
}
