use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use unicode_segmentation::UnicodeSegmentation;

/// Function words and listing markers that never count as terms or names.
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "are", "as", "ask", "at", "be", "been", "before",
    "but", "by", "for", "from", "he", "hn", "how", "i", "if", "in", "into", "is", "it", "its",
    "launch", "more", "most", "my", "no", "not", "of", "on", "one", "or", "our", "over", "she",
    "show", "so", "tell", "than", "that", "the", "their", "then", "these", "they", "this", "those",
    "to", "under", "via", "vs", "was", "we", "were", "what", "when", "where", "which", "who", "why",
    "with", "you", "your",
];

/// Trailing words that mark a capitalized run as an organisation, not a person.
const ORG_SUFFIXES: &[&str] = &[
    "corp", "foundation", "inc", "institute", "labs", "project", "university",
];

/// Term statistics over a set of distinct titles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleAnalytics {
    /// The distinct titles analysed, sorted.
    pub titles: Vec<String>,
    /// Lowercased content terms, most frequent first.
    pub nouns: Vec<String>,
    /// Capitalized name runs ("Grace Hopper"), most frequent first.
    pub people: Vec<String>,
    /// Numeric tokens, most frequent first.
    pub numbers: Vec<String>,
    /// Titles containing each numeric token.
    pub numbers_occurrence: BTreeMap<String, usize>,
}

pub fn analyze_titles(titles: &[String]) -> TitleAnalytics {
    let titles: Vec<String> = titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut nouns: HashMap<String, usize> = HashMap::new();
    let mut people: HashMap<String, usize> = HashMap::new();
    let mut numbers: BTreeMap<String, usize> = BTreeMap::new();

    for title in &titles {
        let words: Vec<&str> = title.unicode_words().collect();

        let spans = if is_title_case(&words) {
            Vec::new()
        } else {
            name_spans(&words)
        };
        let in_name: HashSet<usize> = spans.iter().flat_map(|(start, end)| *start..*end).collect();
        for (start, end) in &spans {
            let name = words[*start..*end]
                .iter()
                .map(|w| strip_possessive(w))
                .collect::<Vec<_>>()
                .join(" ");
            *people.entry(name).or_default() += 1;
        }

        let mut seen_numbers = HashSet::new();
        for (index, word) in words.iter().enumerate() {
            if is_number(word) {
                if seen_numbers.insert(*word) {
                    *numbers.entry(word.to_string()).or_default() += 1;
                }
                continue;
            }
            if in_name.contains(&index) {
                continue;
            }
            if let Some(term) = content_term(word) {
                *nouns.entry(term).or_default() += 1;
            }
        }
    }

    TitleAnalytics {
        titles,
        nouns: ranked(nouns),
        people: ranked(people),
        numbers: ranked(numbers.clone()),
        numbers_occurrence: numbers,
    }
}

fn ranked(counts: impl IntoIterator<Item = (String, usize)>) -> Vec<String> {
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.into_iter().map(|(term, _)| term).collect()
}

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix("\u{2019}s"))
        .unwrap_or(word)
}

fn is_possessive(word: &str) -> bool {
    strip_possessive(word).len() != word.len()
}

/// `Hopper`, `Hopper's`; not `HN`, `SQLite` or `I`.
fn is_name_like(word: &str) -> bool {
    let word = strip_possessive(word);
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let rest: Vec<char> = chars.collect();
    first.is_uppercase()
        && !rest.is_empty()
        && rest.iter().all(|c| c.is_alphabetic() && c.is_lowercase())
        && !is_stopword(word)
}

/// Capitalization carries no signal when every content word is capitalized.
fn is_title_case(words: &[&str]) -> bool {
    let content: Vec<&&str> = words
        .iter()
        .filter(|w| w.chars().all(char::is_alphabetic) && !is_stopword(w))
        .collect();
    content.len() >= 3
        && content
            .iter()
            .all(|w| w.chars().next().is_some_and(char::is_uppercase))
}

/// Runs of two or more name-like words. A possessive closes its run.
fn name_spans(words: &[&str]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;

    for (index, word) in words.iter().enumerate() {
        if is_name_like(word) {
            let run_start = *start.get_or_insert(index);
            if is_possessive(word) {
                push_span(&mut spans, words, run_start, index + 1);
                start = None;
            }
        } else if let Some(run_start) = start.take() {
            push_span(&mut spans, words, run_start, index);
        }
    }
    if let Some(run_start) = start {
        push_span(&mut spans, words, run_start, words.len());
    }
    spans
}

fn push_span(spans: &mut Vec<(usize, usize)>, words: &[&str], start: usize, end: usize) {
    if end - start < 2 {
        return;
    }
    let last = strip_possessive(words[end - 1]).to_lowercase();
    if ORG_SUFFIXES.contains(&last.as_str()) {
        return;
    }
    spans.push((start, end));
}

/// `3`, `1.90`, `1,000`; not `3D`.
fn is_number(word: &str) -> bool {
    let bytes = word.as_bytes();
    matches!((bytes.first(), bytes.last()), (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit())
        && bytes.iter().all(|b| b.is_ascii_digit() || *b == b'.' || *b == b',')
}

fn content_term(word: &str) -> Option<String> {
    let word = strip_possessive(word);
    if word.chars().count() < 3 || !word.chars().all(char::is_alphabetic) || is_stopword(word) {
        return None;
    }
    Some(word.to_lowercase())
}
