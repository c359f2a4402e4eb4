use chrono::{DateTime, Utc};
use lol_html::{element, text, HtmlRewriter, Selector, Settings};
use std::cell::RefCell;

use crate::record::Record;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("no listing rows found")]
    NoRows,
    #[error("row {row}: missing {field}")]
    MissingField { row: usize, field: &'static str },
    #[error("row {row}: invalid {field} {value:?}")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("{0} subtext row(s) without a preceding listing row")]
    Misaligned(usize),
    #[error("invalid selector {0:?}")]
    Selector(String),
    #[error("HTML rewriting failed: {0}")]
    Html(String),
}

/// Positionally aligned fields of every listing row, in document order.
/// Index `i` of each vector describes the same row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPage {
    pub ids: Vec<String>,
    pub titles: Vec<String>,
    pub links: Vec<String>,
    pub scores: Vec<Option<u32>>,
    pub ages: Vec<String>,
    pub ranks: Vec<u32>,
    pub comment_counts: Vec<u32>,
}

impl ExtractedPage {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn into_records(self, page: u32, updated_at: DateTime<Utc>) -> Vec<Record> {
        let ExtractedPage {
            ids,
            titles,
            links,
            scores,
            ages,
            ranks,
            comment_counts,
        } = self;

        ids.into_iter()
            .zip(titles)
            .zip(links)
            .zip(scores)
            .zip(ages)
            .zip(ranks)
            .zip(comment_counts)
            .map(|((((((id, title), link), score), age), rank), comment_count)| Record {
                id,
                title,
                page,
                rank,
                link,
                score,
                age,
                comment_count,
                updated_at,
            })
            .collect()
    }

    fn push(&mut self, row: usize, raw: RawRow) -> Result<(), ExtractError> {
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ExtractError::MissingField { row, field: "id" })?;

        let title = clean_text(&raw.title);
        if title.is_empty() {
            return Err(ExtractError::MissingField { row, field: "title" });
        }

        let link = raw
            .link
            .map(|href| decode_entities(&href))
            .ok_or(ExtractError::MissingField { row, field: "link" })?;

        let rank_text = clean_text(&raw.rank);
        let rank = leading_number(&rank_text)
            .ok_or_else(|| invalid(row, "rank", rank_text.clone()))?;

        if !raw.subtext_seen {
            return Err(ExtractError::MissingField { row, field: "subtext" });
        }

        let score_text = clean_text(&raw.score);
        let score = if score_text.is_empty() {
            None
        } else {
            Some(leading_number(&score_text).ok_or_else(|| invalid(row, "score", score_text.clone()))?)
        };

        let age = clean_text(&raw.age);
        if age.is_empty() {
            return Err(ExtractError::MissingField { row, field: "age" });
        }

        let comment_count = raw
            .subtext_links
            .iter()
            .map(|text| clean_text(text))
            .find_map(|text| comment_count(&text))
            .unwrap_or(0);

        self.ids.push(id);
        self.titles.push(title);
        self.links.push(link);
        self.scores.push(score);
        self.ages.push(age);
        self.ranks.push(rank);
        self.comment_counts.push(comment_count);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RawRow {
    id: Option<String>,
    rank: String,
    title: String,
    title_anchors: usize,
    link: Option<String>,
    subtext_seen: bool,
    score: String,
    age: String,
    subtext_links: Vec<String>,
}

/// Extracts every listing row from rendered listing HTML.
///
/// A story occupies two table rows: `tr.athing` (rank, title, link) followed by
/// a row holding `td.subtext` (score, age, comment link). Both are folded into
/// one row before any field is emitted, so the output vectors cannot drift out
/// of alignment; a row that cannot be completed fails the whole page.
pub fn extract_listing(content: &str) -> Result<ExtractedPage, ExtractError> {
    let rows: RefCell<Vec<RawRow>> = RefCell::new(Vec::new());
    let orphan_subtexts = RefCell::new(0usize);

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("tr.athing", |el| {
                    rows.borrow_mut().push(RawRow {
                        id: el.get_attribute("id"),
                        ..RawRow::default()
                    });
                    Ok(())
                }),
                text!("tr.athing span.rank", |t| {
                    if let Some(row) = rows.borrow_mut().last_mut() {
                        row.rank.push_str(t.as_str());
                    }
                    Ok(())
                }),
                element!("tr.athing span.titleline > a", |el| {
                    if let Some(row) = rows.borrow_mut().last_mut() {
                        row.title_anchors += 1;
                        if row.link.is_none() {
                            row.link = el.get_attribute("href");
                        }
                    }
                    Ok(())
                }),
                text!("tr.athing span.titleline > a", |t| {
                    if let Some(row) = rows.borrow_mut().last_mut()
                        && row.title_anchors == 1
                    {
                        row.title.push_str(t.as_str());
                    }
                    Ok(())
                }),
                element!("td.subtext", |_| {
                    match rows.borrow_mut().last_mut() {
                        Some(row) if !row.subtext_seen => row.subtext_seen = true,
                        _ => *orphan_subtexts.borrow_mut() += 1,
                    }
                    Ok(())
                }),
                text!("td.subtext span.score", |t| {
                    if let Some(row) = rows.borrow_mut().last_mut() {
                        row.score.push_str(t.as_str());
                    }
                    Ok(())
                }),
                text!("td.subtext span.age > a", |t| {
                    if let Some(row) = rows.borrow_mut().last_mut() {
                        row.age.push_str(t.as_str());
                    }
                    Ok(())
                }),
                element!("td.subtext a", |_| {
                    if let Some(row) = rows.borrow_mut().last_mut() {
                        row.subtext_links.push(String::new());
                    }
                    Ok(())
                }),
                text!("td.subtext a", |t| {
                    if let Some(row) = rows.borrow_mut().last_mut()
                        && let Some(link) = row.subtext_links.last_mut()
                    {
                        link.push_str(t.as_str());
                    }
                    Ok(())
                }),
            ],
            ..Settings::new()
        },
        |_: &[u8]| {},
    );

    rewriter
        .write(content.as_bytes())
        .map_err(|e| ExtractError::Html(e.to_string()))?;
    rewriter.end().map_err(|e| ExtractError::Html(e.to_string()))?;

    let orphans = orphan_subtexts.into_inner();
    if orphans > 0 {
        return Err(ExtractError::Misaligned(orphans));
    }

    let rows = rows.into_inner();
    if rows.is_empty() {
        return Err(ExtractError::NoRows);
    }

    let mut page = ExtractedPage::default();
    for (index, row) in rows.into_iter().enumerate() {
        page.push(index, row)?;
    }
    Ok(page)
}

/// Returns true if any element in `content` matches `selector`.
pub fn contains_selector(content: &str, selector: &str) -> Result<bool, ExtractError> {
    selector
        .parse::<Selector>()
        .map_err(|_| ExtractError::Selector(selector.to_string()))?;

    let mut found = false;
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![element!(selector, |_| {
                found = true;
                Ok(())
            })],
            ..Settings::new()
        },
        |_: &[u8]| {},
    );

    rewriter
        .write(content.as_bytes())
        .map_err(|e| ExtractError::Html(e.to_string()))?;
    rewriter.end().map_err(|e| ExtractError::Html(e.to_string()))?;

    Ok(found)
}

fn invalid(row: usize, field: &'static str, value: String) -> ExtractError {
    ExtractError::InvalidField { row, field, value }
}

fn clean_text(raw: &str) -> String {
    decode_entities(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn leading_number(text: &str) -> Option<u32> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn comment_count(link_text: &str) -> Option<u32> {
    let lower = link_text.to_ascii_lowercase();
    if lower == "discuss" {
        return Some(0);
    }
    if lower.ends_with("comment") || lower.ends_with("comments") {
        return leading_number(&lower);
    }
    None
}

/// lol_html hands text chunks over undecoded.
fn decode_entities(raw: &str) -> String {
    html_escape::decode_html_entities(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../tests/fixtures/news_page.html");

    #[test]
    fn fixture_rows_are_aligned() {
        let page = extract_listing(FIXTURE).unwrap();

        assert_eq!(page.len(), 4);
        for len in [
            page.titles.len(),
            page.links.len(),
            page.scores.len(),
            page.ages.len(),
            page.ranks.len(),
            page.comment_counts.len(),
        ] {
            assert_eq!(len, page.ids.len());
        }

        assert_eq!(page.ids, vec!["41900001", "41900002", "41900003", "41900004"]);
        assert_eq!(page.ranks, vec![1, 2, 3, 4]);
        assert_eq!(
            page.titles,
            vec![
                "Rust 1.90 released",
                "Ask HN: What's your favorite B-tree paper?",
                "Acme (YC S21) is hiring backend engineers",
                "Tokio & friends: a tour",
            ]
        );
        assert_eq!(page.links[0], "https://blog.rust-lang.org/2025/09/18/Rust-1.90.0/");
        assert_eq!(page.links[1], "item?id=41900002");
        assert_eq!(page.scores, vec![Some(812), Some(97), None, Some(1)]);
        assert_eq!(page.ages[0], "3 hours ago");
        assert_eq!(page.ages[2], "1 day ago");
        assert_eq!(page.comment_counts, vec![301, 1, 0, 0]);
    }

    #[test]
    fn records_take_page_from_caller() {
        let now = Utc::now();
        let records = extract_listing(FIXTURE).unwrap().into_records(7, now);

        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.page == 7 && r.updated_at == now));
        assert_eq!(records[1].id, "41900002");
        assert_eq!(records[1].rank, 2);
        assert_eq!(records[1].comment_count, 1);
    }

    #[test]
    fn page_without_rows_fails() {
        let html = "<html><body><table><tr><td>nothing</td></tr></table></body></html>";
        assert!(matches!(extract_listing(html), Err(ExtractError::NoRows)));
    }

    #[test]
    fn row_missing_subtext_fails_instead_of_shifting() {
        let html = r#"<table>
            <tr class="athing" id="1"><td><span class="rank">1.</span></td>
              <td class="title"><span class="titleline"><a href="https://a.example">A</a></span></td></tr>
            <tr class="athing" id="2"><td><span class="rank">2.</span></td>
              <td class="title"><span class="titleline"><a href="https://b.example">B</a></span></td></tr>
            <tr><td class="subtext"><span class="score">5 points</span>
              <span class="age"><a href="item?id=2">1 hour ago</a></span></td></tr>
        </table>"#;

        match extract_listing(html) {
            Err(ExtractError::MissingField { row: 0, field: "subtext" }) => {}
            other => panic!("expected missing subtext on row 0, got {other:?}"),
        }
    }

    #[test]
    fn subtext_before_any_row_is_misaligned() {
        let html = r#"<table>
            <tr><td class="subtext"><span class="age"><a href="item?id=9">1 hour ago</a></span></td></tr>
            <tr class="athing" id="1"><td><span class="rank">1.</span></td>
              <td class="title"><span class="titleline"><a href="https://a.example">A</a></span></td></tr>
        </table>"#;

        assert!(matches!(extract_listing(html), Err(ExtractError::Misaligned(1))));
    }

    #[test]
    fn selector_presence() {
        assert!(contains_selector(FIXTURE, "table").unwrap());
        assert!(contains_selector(FIXTURE, "tr.athing").unwrap());
        assert!(!contains_selector("<html><body><p>loading</p></body></html>", "table").unwrap());
        assert!(matches!(
            contains_selector(FIXTURE, "tr[["),
            Err(ExtractError::Selector(_))
        ));
    }

    #[test]
    fn named_entities_in_titles_are_decoded() {
        let html = r#"<table>
            <tr class="athing" id="7"><td><span class="rank">1.</span></td>
              <td class="title"><span class="titleline"><a href="https://a.example/?a=1&amp;b=2">Caf&eacute; notes&hellip; part&nbsp;2</a></span></td></tr>
            <tr><td class="subtext"><span class="score">3 points</span>
              <span class="age"><a href="item?id=7">2 hours ago</a></span></td></tr>
        </table>"#;

        let page = extract_listing(html).unwrap();
        assert_eq!(page.titles, vec!["Caf\u{e9} notes\u{2026} part 2"]);
        assert_eq!(page.links, vec!["https://a.example/?a=1&b=2"]);
    }

    #[test]
    fn entity_decoding() {
        assert_eq!(decode_entities("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(decode_entities("it&#x27;s &#39;ok&#39;"), "it's 'ok'");
        assert_eq!(decode_entities("AT&T"), "AT&T");
        assert_eq!(decode_entities("Wait for it&hellip; &mdash; done"), "Wait for it\u{2026} \u{2014} done");
        assert_eq!(clean_text("45&nbsp;comments"), "45 comments");
    }
}
