//! Pure string transforms for matching release titles against library
//! entries: normalization, season/part/year extraction, and search
//! query building.
//!
//! Normalization lowercases, folds macrons, strips possessives and
//! quotes, converts separators to spaces, and removes season/part
//! markers. Roman numerals stay in the normalized form so sequels like
//! "Overlord II" remain distinguishable; they are stripped from the
//! clean base title along with format words and trailing numbers.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Words weighted less during comparison and dropped from denoised
/// titles.
static NOISE_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "the", "a", "an", "of", "to", "in", "for", "on", "with", "at", "by", "from", "as", "is",
        "it", "that", "this", "be", "are", "was", "were",
        // Japanese particles
        "no", "wa", "wo", "ga", "ni", "de", "ka", "mo", "ya", "e", "he",
        // common release words
        "anime", "ova", "ona", "oad", "tv", "movie", "nc", "nced", "ncop", "extras", "ending",
        "opening", "preview", "special", "specials", "sp", "finale", "season", "uncensored",
        "censored", "bluray",
    ]
    .into_iter()
    .collect()
});

/// Tokens stripped when building the clean base title.
static FORMAT_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "ova", "ona", "oad", "oav", "sp", "special", "specials", "movie", "film", "tv", "nc",
        "nced", "ncop", "extras", "opening", "ending", "preview", "finale",
    ]
    .into_iter()
    .collect()
});

// I and X are skipped as standalone numerals, they are too ambiguous.
fn roman_numeral(word: &str) -> Option<u32> {
    match word {
        "ii" => Some(2),
        "iii" => Some(3),
        "iv" => Some(4),
        "v" => Some(5),
        "vi" => Some(6),
        "vii" => Some(7),
        "viii" => Some(8),
        "ix" => Some(9),
        "xi" => Some(11),
        "xii" => Some(12),
        "xiii" => Some(13),
        _ => None,
    }
}

fn word_ordinal(word: &str) -> Option<u32> {
    match word {
        "first" => Some(1),
        "second" => Some(2),
        "third" => Some(3),
        "fourth" => Some(4),
        "fifth" => Some(5),
        "sixth" => Some(6),
        "seventh" => Some(7),
        "eighth" => Some(8),
        "ninth" => Some(9),
        "tenth" => Some(10),
        _ => None,
    }
}

#[allow(clippy::expect_used)]
static SEASON_EXPLICIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:season|s|series)\s*0*(\d+)\b").expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static SEASON_ORDINAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)(?:st|nd|rd|th)\s*(?:season|series)\b").expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static SEASON_WORD_ORDINAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(first|second|third|fourth|fifth|sixth|seventh|eighth|ninth|tenth)\s+season\b")
        .expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static SEASON_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s*(?:期|シーズン)").expect("valid regex literal"));
#[allow(clippy::expect_used)]
static PART_EXPLICIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:part|cour)\s*0*(\d+)\b").expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static PART_ORDINAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)(?:st|nd|rd|th)\s*(?:part|cour)\b").expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static PART_ROMAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:part|cour)\s+(i{1,3}|iv|vi?i?i?|ix|x)\b").expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static YEAR_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d{4})\)").expect("valid regex literal"));
#[allow(clippy::expect_used)]
static YEAR_STANDALONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("valid regex literal"));
#[allow(clippy::expect_used)]
static TRAILING_ROMAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(ii|iii|iv|v|vi|vii|viii|ix|xi|xii|xiii)\s*$").expect("valid regex literal")
});
#[allow(clippy::expect_used)]
static TRAILING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\s*$").expect("valid regex literal"));
#[allow(clippy::expect_used)]
static STANDALONE_NUMBER_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+\b$").expect("valid regex literal"));
#[allow(clippy::expect_used)]
static SEARCH_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[()\[\]{}|"'~*?\\^!]"#).expect("valid regex literal"));
#[allow(clippy::expect_used)]
static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex literal"));

/// A title normalized for matching, with extracted metadata.
///
/// `season`, `part`, and `year` use `-1` when absent so the serialized
/// form keeps a stable shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTitle {
    pub original: String,
    pub normalized: String,
    /// Normalized title with format words, roman numerals, and a
    /// trailing standalone number stripped.
    pub clean_base_title: String,
    /// Clean base title with noise words removed as well.
    pub denoised_title: String,
    pub tokens: Vec<String>,
    pub season: i32,
    pub part: i32,
    pub year: i32,
}

/// Normalize a title and extract its season, part, and year markers.
pub fn normalize_title(title: &str) -> NormalizedTitle {
    if title.is_empty() {
        return NormalizedTitle::default();
    }

    let normalized = normalize_string(title);
    let (clean_base_title, denoised_title) = compute_clean_base(&normalized);
    let tokens = normalized.split_whitespace().map(str::to_owned).collect();

    NormalizedTitle {
        original: title.to_owned(),
        season: extract_season_number(title).map_or(-1, |n| n as i32),
        part: extract_part_number(title).map_or(-1, |n| n as i32),
        year: extract_year(title).map_or(-1, |n| n as i32),
        normalized,
        clean_base_title,
        denoised_title,
        tokens,
    }
}

fn normalize_string(title: &str) -> String {
    let mut s = title.to_lowercase();

    // Macrons to double vowels, plus a few lookalike characters.
    s = s.replace('ō', "ou");
    s = s.replace('ū', "uu");
    s = s.replace('@', "a");
    s = s.replace('×', " x ");
    s = s.replace('꞉', ":");
    s = s.replace('＊', " * ");

    s = replace_word(&s, "the animation", "");
    s = replace_word(&s, "the", "");
    s = replace_word(&s, "episode", "");
    s = replace_word(&s, "oad", "ova");
    s = replace_word(&s, "oav", "ova");
    s = replace_word(&s, "specials", "sp");
    s = replace_word(&s, "special", "sp");
    s = s.replace("(tv)", "");
    s = replace_word(&s, "&", "and");

    // Possessives would otherwise glue an "s" onto the next word.
    s = s.replace("'s", " ");
    s = s.replace("’s", " ");
    s = s.replace("`s", " ");

    for quote in ['\'', '’', '`', '"', '“', '”'] {
        s = s.replace(quote, "");
    }

    // Separators and anything non-alphanumeric become single spaces.
    let mut cleaned = String::with_capacity(s.len());
    let mut prev_space = false;
    for c in s.chars() {
        if is_separator(c) || !is_alphanumeric_or_space(c) {
            if !prev_space {
                cleaned.push(' ');
                prev_space = true;
            }
        } else {
            cleaned.push(c);
            prev_space = c == ' ';
        }
    }

    // Season and part markers are extracted separately for scoring, so
    // drop them here. "Title S2" should not match "Other Title 2" on
    // the bare "2". Roman numerals are intentionally kept.
    let mut s = cleaned;
    for pattern in [
        &*SEASON_EXPLICIT,
        &*SEASON_ORDINAL,
        &*SEASON_WORD_ORDINAL,
        &*PART_EXPLICIT,
        &*PART_ORDINAL,
        &*PART_ROMAN,
    ] {
        s = pattern.replace_all(&s, " ").into_owned();
    }

    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_separator(c: char) -> bool {
    matches!(c, '_' | '.' | '-' | ':' | ';' | ',' | '|')
}

fn is_alphanumeric_or_space(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == ' '
}

/// Replace whole-word occurrences of `needle`, where word boundaries
/// are non-alphanumeric neighbors. Both inputs are expected lowercase.
fn replace_word(s: &str, needle: &str, replacement: &str) -> String {
    if s.is_empty() || needle.is_empty() {
        return s.to_owned();
    }

    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut start = 0;

    while let Some(idx) = s[start..].find(needle) {
        let abs = start + idx;
        let end = abs + needle.len();
        let start_ok = abs == 0 || !bytes[abs - 1].is_ascii_alphanumeric();
        let end_ok = end == s.len() || !bytes[end].is_ascii_alphanumeric();
        if start_ok && end_ok {
            out.push_str(&s[start..abs]);
            out.push_str(replacement);
            start = end;
        } else {
            // Needles are ASCII, so one byte past the match start is a
            // valid char boundary.
            out.push_str(&s[start..=abs]);
            start = abs + 1;
        }
    }
    out.push_str(&s[start..]);
    out
}

fn compute_clean_base(normalized: &str) -> (String, String) {
    let stripped = STANDALONE_NUMBER_END.replace(normalized, " ");
    let mut clean = Vec::new();
    let mut denoised = Vec::new();
    for token in stripped.split_whitespace() {
        if FORMAT_WORDS.contains(token) || roman_numeral(token).is_some() {
            continue;
        }
        if !NOISE_WORDS.contains(token) {
            denoised.push(token);
        }
        clean.push(token);
    }
    (clean.join(" "), denoised.join(" "))
}

fn captured_number(pattern: &Regex, text: &str) -> Option<u32> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract a season number from markers like "Season 2", "S02", "2nd
/// Season", "Second Season", "2期", a trailing roman numeral, or a bare
/// trailing number ("Konosuba 2").
pub fn extract_season_number(title: &str) -> Option<u32> {
    let lowered = title.to_lowercase();

    if let Some(n) = captured_number(&SEASON_EXPLICIT, &lowered) {
        return Some(n);
    }
    if let Some(n) = captured_number(&SEASON_ORDINAL, &lowered) {
        return Some(n);
    }
    if let Some(n) = SEASON_WORD_ORDINAL
        .captures(&lowered)
        .and_then(|captures| captures.get(1))
        .and_then(|m| word_ordinal(m.as_str()))
    {
        return Some(n);
    }
    if let Some(n) = captured_number(&SEASON_SUFFIX, &lowered) {
        return Some(n);
    }

    // A trailing numeral belongs to an explicit part marker when one is
    // present, "Re:Zero Part 2" is part 2, not season 2.
    if extract_part_number(&lowered).is_some() {
        return None;
    }
    if let Some(n) = TRAILING_ROMAN
        .captures(&lowered)
        .and_then(|captures| captures.get(1))
        .and_then(|m| roman_numeral(m.as_str()))
    {
        return Some(n);
    }
    captured_number(&TRAILING_NUMBER, &lowered)
}

/// Extract a part number from markers like "Part 2", "Cour 2", "2nd
/// Part", or "Part II". Standalone I and X are too ambiguous and are
/// never treated as parts.
pub fn extract_part_number(title: &str) -> Option<u32> {
    let lowered = title.to_lowercase();

    if let Some(n) = captured_number(&PART_EXPLICIT, &lowered) {
        return Some(n);
    }
    if let Some(n) = captured_number(&PART_ORDINAL, &lowered) {
        return Some(n);
    }
    PART_ROMAN
        .captures(&lowered)
        .and_then(|captures| captures.get(1))
        .and_then(|m| roman_numeral(m.as_str()))
}

/// Extract a release year, preferring a parenthesized "(2024)" over a
/// standalone 19xx/20xx number.
pub fn extract_year(title: &str) -> Option<u32> {
    if let Some(year) = captured_number(&YEAR_PAREN, title) {
        if (1900..=2100).contains(&year) {
            return Some(year);
        }
    }
    captured_number(&YEAR_STANDALONE, title)
}

/// Normalized tokens of `title` that are neither noise words nor
/// single characters.
pub fn get_significant_tokens(title: &str) -> Vec<String> {
    normalize_title(title)
        .tokens
        .into_iter()
        .filter(|token| !NOISE_WORDS.contains(token.as_str()) && token.len() > 1)
        .collect()
}

fn is_year_token(token: &str) -> bool {
    token.len() == 4
        && (token.starts_with("19") || token.starts_with("20"))
        && token[2..].chars().all(|c| c.is_ascii_digit())
}

fn weighted_token_match_ratio(tokens_a: &[String], tokens_b: &[String]) -> f64 {
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let set_b: HashSet<&str> = tokens_b.iter().map(String::as_str).collect();
    let mut total = 0.0;
    let mut matched = 0.0;
    for token in tokens_a {
        let weight = if NOISE_WORDS.contains(token.as_str()) {
            0.3
        } else if is_year_token(token) {
            0.5
        } else {
            1.0
        };
        total += weight;
        if set_b.contains(token.as_str()) {
            matched += weight;
        }
    }

    if total == 0.0 { 0.0 } else { matched / total }
}

/// Similarity of two titles in `[0, 1]`, with noise words weighted at
/// 0.3 and year tokens at 0.5.
pub fn compare_titles(a: &str, b: &str) -> f64 {
    let norm_a = normalize_title(a);
    let norm_b = normalize_title(b);
    weighted_token_match_ratio(&norm_a.tokens, &norm_b.tokens)
}

/// The candidate scoring highest against `target`, ties going to the
/// earliest candidate. `None` when `candidates` is empty.
pub fn find_best_match(target: &str, candidates: &[String]) -> Option<String> {
    let norm_target = normalize_title(target);
    let mut best: Option<(&String, f64)> = None;
    for candidate in candidates {
        let norm_candidate = normalize_title(candidate);
        let score = weighted_token_match_ratio(&norm_target.tokens, &norm_candidate.tokens);
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }
    best.map(|(candidate, _)| candidate.clone())
}

/// Strip characters that carry meaning in search engine syntax and
/// collapse the leftover whitespace.
pub fn sanitize_query(query: &str) -> String {
    let stripped = SEARCH_SYNTAX.replace_all(query, " ");
    let collapsed = MULTI_SPACE.replace_all(&stripped, " ");
    collapsed.trim().to_owned()
}

/// The most compact usable form of a normalized title: denoised, then
/// clean base, then the full normalized string.
fn search_base(title: &str) -> String {
    let norm = normalize_title(title);
    let base = if !norm.denoised_title.is_empty() {
        norm.denoised_title
    } else if !norm.clean_base_title.is_empty() {
        norm.clean_base_title
    } else {
        norm.normalized
    };
    sanitize_query(&base)
}

/// A compact search query for a single title.
pub fn build_search_query(title: &str) -> String {
    search_base(title)
}

/// A boolean query grouping alternative titles: `(a | b | c)`, with
/// duplicates removed.
pub fn build_advanced_query(titles: &[String]) -> String {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for title in titles {
        if title.is_empty() {
            continue;
        }
        let query = search_base(title);
        if query.is_empty() || !seen.insert(query.clone()) {
            continue;
        }
        parts.push(query);
    }

    match parts.len() {
        0 => String::new(),
        1 => parts.remove(0),
        _ => format!("({})", parts.join(" | ")),
    }
}

fn integer_to_ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, hundreds) if hundreds != 11 => "st",
        (2, hundreds) if hundreds != 12 => "nd",
        (3, hundreds) if hundreds != 13 => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// A query covering the common season identifier formats, or just the
/// base title for season 1 or below.
///
/// `build_season_query("Overlord", 2)` produces
/// `(overlord S02 | overlord S2 | overlord Season 2 | overlord 2nd Season)`.
pub fn build_season_query(title: &str, season: u32) -> String {
    let base = search_base(title);
    if season <= 1 {
        return base;
    }

    let variants = [
        format!("{base} S{season:02}"),
        format!("{base} S{season}"),
        format!("{base} Season {season}"),
        format!("{base} {} Season", integer_to_ordinal(season)),
    ];
    format!("({})", variants.join(" | "))
}

/// A query covering the common part identifier formats, or just the
/// base title for part 1 or below.
pub fn build_part_query(title: &str, part: u32) -> String {
    let base = search_base(title);
    if part <= 1 {
        return base;
    }

    let mut variants = vec![format!("{base} Part {part}")];
    if let Some(roman) = match part {
        2 => Some("II"),
        3 => Some("III"),
        4 => Some("IV"),
        5 => Some("V"),
        6 => Some("VI"),
        7 => Some("VII"),
        8 => Some("VIII"),
        9 => Some("IX"),
        _ => None,
    } {
        variants.push(format!("{base} Part {roman}"));
    }
    variants.push(format!("{base} {} Cour", integer_to_ordinal(part)));
    format!("({})", variants.join(" | "))
}

/// Search-ready title variants derived from a set of alternative
/// titles, plus the season and part detected across them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartSearchTitles {
    pub titles: Vec<String>,
    pub season: i32,
    pub part: i32,
}

/// Process every alternative title (romaji, english, synonyms) into
/// deduplicated search variants, including clean base forms and
/// shortened prefixes split at `:` or ` - `.
pub fn build_smart_search_titles(titles: &[String]) -> SmartSearchTitles {
    let mut season = -1;
    let mut part = -1;
    let mut seen = HashSet::new();
    let mut variants: Vec<String> = Vec::new();

    let add = |variant: String, seen: &mut HashSet<String>, out: &mut Vec<String>| {
        let trimmed = variant.trim();
        if trimmed.is_empty() {
            return;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_owned());
        }
    };

    for title in titles {
        if title.is_empty() {
            continue;
        }

        if season <= 0 {
            if let Some(found) = extract_season_number(title) {
                season = found as i32;
            }
        }
        if part <= 0 {
            if let Some(found) = extract_part_number(title) {
                part = found as i32;
            }
        }

        let norm = normalize_title(title);
        add(search_base(title), &mut seen, &mut variants);
        if !norm.clean_base_title.is_empty() {
            add(sanitize_query(&norm.clean_base_title), &mut seen, &mut variants);
        }

        // Long titles often lead with the series name, try the prefix
        // before a colon or a spaced dash as its own variant.
        for split in [title.find(':'), title.find(" - ")] {
            if let Some(idx) = split {
                let prefix = title[..idx].trim();
                if prefix.len() >= 5 {
                    add(search_base(prefix), &mut seen, &mut variants);
                }
            }
        }
    }

    SmartSearchTitles {
        titles: variants,
        season,
        part,
    }
}
