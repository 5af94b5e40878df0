//! Pure, deterministic filtering of a discovered repository set.
//!
//! [`apply`] never reorders its input and never mutates a [`Repository`]; it
//! only decides, in a fixed order, which ones survive.

use sync_types::{Filter, Repository, Visibility};

/// Reduce `repos` to those surviving `filter`, honoring `skip_archived` and
/// `skip_forked` from the owning platform config. Order of `repos` is
/// preserved; each step short-circuits rejection before the next runs.
pub fn apply(
    repos: &[Repository],
    filter: &Filter,
    skip_archived: bool,
    skip_forked: bool,
) -> Vec<Repository> {
    repos
        .iter()
        .filter(|r| passes_visibility(r, filter))
        .filter(|r| !(skip_archived && r.archived))
        .filter(|r| !(skip_forked && r.fork))
        .filter(|r| passes_include_patterns(r, filter))
        .filter(|r| passes_exclude_patterns(r, filter))
        .filter(|r| passes_language(r, filter))
        .filter(|r| r.stars >= filter.min_stars)
        .filter(|r| passes_max_size(r, filter))
        .filter(|r| passes_updated_after(r, filter))
        .cloned()
        .collect()
}

fn passes_visibility(repo: &Repository, filter: &Filter) -> bool {
    filter.visibility.is_empty() || filter.visibility.contains(&repo.visibility)
}

fn passes_include_patterns(repo: &Repository, filter: &Filter) -> bool {
    filter.include_patterns.is_empty()
        || filter
            .include_patterns
            .iter()
            .any(|p| glob_match(p, &repo.full_name()))
}

fn passes_exclude_patterns(repo: &Repository, filter: &Filter) -> bool {
    !filter
        .exclude_patterns
        .iter()
        .any(|p| glob_match(p, &repo.full_name()))
}

fn passes_language(repo: &Repository, filter: &Filter) -> bool {
    if filter.languages.is_empty() {
        return true;
    }
    match &repo.language {
        Some(lang) => filter
            .languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(lang)),
        None => false,
    }
}

fn passes_max_size(repo: &Repository, filter: &Filter) -> bool {
    match filter.max_size_mb {
        Some(max_mb) => repo.size_kb <= max_mb.saturating_mul(1024),
        None => true,
    }
}

fn passes_updated_after(repo: &Repository, filter: &Filter) -> bool {
    match filter.updated_after {
        Some(threshold) => repo.updated_at >= threshold,
        None => true,
    }
}

/// Shell glob matching (`*` matches any run of characters, `?` matches
/// exactly one) over the whole string, case-sensitive. No character classes
/// or brace expansion — `full_name` patterns never need them.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_chars(&p, &t)
}

fn glob_match_chars(pattern: &[char], text: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    let (mut star_idx, mut match_idx) = (None, 0);

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star_idx = Some(pi);
            match_idx = ti;
            pi += 1;
        } else if let Some(si) = star_idx {
            pi = si + 1;
            match_idx += 1;
            ti = match_idx;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }

    pi == pattern.len()
}
