use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of one scheduled crawl: fetch and process a single listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub url: String,
}

impl CrawlJob {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn page_number(&self) -> Option<u32> {
        page_number_from_url(&self.url)
    }
}

/// Page number of a listing URL: every non-digit character is stripped and the
/// remaining digits are parsed, so `.../news?p=7` yields `7`.
pub fn page_number_from_url(url: &str) -> Option<u32> {
    let digits: String = url.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// One listing row as persisted. `page` comes from the job URL, never from the
/// page content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub title: String,
    pub page: u32,
    pub rank: u32,
    pub link: String,
    pub score: Option<u32>,
    pub age: String,
    pub comment_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn unique_key(&self) -> UniqueKey<'_> {
        UniqueKey {
            id: &self.id,
            title: &self.title,
            page: self.page,
            rank: self.rank,
            link: &self.link,
            score: self.score,
            age: &self.age,
            comment_count: self.comment_count,
        }
    }
}

/// Content fingerprint of a record: every field except `updated_at`.
/// The store enforces uniqueness over its encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueKey<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub page: u32,
    pub rank: u32,
    pub link: &'a str,
    pub score: Option<u32>,
    pub age: &'a str,
    pub comment_count: u32,
}

impl UniqueKey<'_> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(updated_at: DateTime<Utc>) -> Record {
        Record {
            id: "41234567".to_string(),
            title: "Show HN: A tiny crawler".to_string(),
            page: 1,
            rank: 3,
            link: "https://example.com/crawler".to_string(),
            score: Some(120),
            age: "2 hours ago".to_string(),
            comment_count: 45,
            updated_at,
        }
    }

    #[test]
    fn page_number_from_listing_urls() {
        assert_eq!(page_number_from_url("https://news.ycombinator.com/news?p=7"), Some(7));
        assert_eq!(page_number_from_url("https://news.ycombinator.com/news?p=10"), Some(10));
        assert_eq!(CrawlJob::new("https://news.ycombinator.com/news?p=3").page_number(), Some(3));
    }

    #[test]
    fn page_number_requires_digits() {
        assert_eq!(page_number_from_url("https://news.ycombinator.com/news"), None);
    }

    #[test]
    fn unique_key_ignores_update_time() {
        let earlier = sample(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap());
        let later = sample(DateTime::<Utc>::from_timestamp(1_700_000_120, 0).unwrap());
        assert_eq!(
            earlier.unique_key().to_bytes().unwrap(),
            later.unique_key().to_bytes().unwrap()
        );

        let mut rescored = later.clone();
        rescored.score = Some(121);
        assert_ne!(
            earlier.unique_key().to_bytes().unwrap(),
            rescored.unique_key().to_bytes().unwrap()
        );
    }

    #[test]
    fn serializes_camel_case_fields() {
        let value = serde_json::to_value(sample(Utc::now())).unwrap();
        assert!(value.get("commentCount").is_some());
        assert!(value.get("updatedAt").is_some());
    }
}
