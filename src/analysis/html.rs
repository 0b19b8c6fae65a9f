//! Lightweight structural metrics over fetched HTML.
//!
//! This is not a DOM parser. It counts tags with regular expressions, which
//! is enough for the coarse statistics stored with history snapshots.

use anyhow::{Context, Result};
use regex::Regex;

use crate::persistence::records::TEXT_SAMPLE_LIMIT;
use crate::persistence::PageContext;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetrics {
    pub title: String,
    pub heading_count: u64,
    pub paragraph_count: u64,
    pub image_count: u64,
    pub character_count: u64,
    /// Mean character length of non-empty paragraphs.
    pub average_paragraph_length: u64,
    pub text_sample: String,
}

impl PageMetrics {
    pub fn context(&self) -> PageContext {
        PageContext {
            character_count: self.character_count,
            paragraph_count: self.paragraph_count,
            heading_count: self.heading_count,
            image_count: self.image_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageParser {
    hidden_blocks: Regex,
    comments: Regex,
    title: Regex,
    heading: Regex,
    paragraph: Regex,
    image: Regex,
    body: Regex,
    tag: Regex,
    whitespace: Regex,
}

impl PageParser {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("invalid html pattern {pattern}"))
        };

        Ok(Self {
            hidden_blocks: compile(
                r"(?is)<(?:script|style|noscript|template)\b[^>]*>.*?</(?:script|style|noscript|template)\s*>",
            )?,
            comments: compile(r"(?s)<!--.*?-->")?,
            title: compile(r"(?is)<title\b[^>]*>(.*?)</title\s*>")?,
            heading: compile(r"(?i)<h[1-6](?:\s[^>]*)?>")?,
            paragraph: compile(r"(?is)<p(?:\s[^>]*)?>(.*?)</p\s*>")?,
            image: compile(r"(?i)<img\b")?,
            body: compile(r"(?is)<body\b[^>]*>(.*?)(?:</body\s*>|$)")?,
            tag: compile(r"(?s)<[^>]*>")?,
            whitespace: compile(r"\s+")?,
        })
    }

    pub fn parse(&self, html: &str) -> PageMetrics {
        let cleaned = self.comments.replace_all(html, " ");
        let cleaned = self.hidden_blocks.replace_all(&cleaned, " ");

        let title = self
            .title
            .captures(&cleaned)
            .and_then(|captures| captures.get(1))
            .map(|inner| self.plain_text(inner.as_str()))
            .unwrap_or_default();

        let paragraph_lengths: Vec<usize> = self
            .paragraph
            .captures_iter(&cleaned)
            .filter_map(|captures| captures.get(1))
            .map(|inner| self.plain_text(inner.as_str()).chars().count())
            .filter(|length| *length > 0)
            .collect();

        let average_paragraph_length = if paragraph_lengths.is_empty() {
            0
        } else {
            let total: usize = paragraph_lengths.iter().sum();
            (total as f64 / paragraph_lengths.len() as f64).round() as u64
        };

        let body = self
            .body
            .captures(&cleaned)
            .and_then(|captures| captures.get(1))
            .map(|inner| inner.as_str())
            .unwrap_or(&*cleaned);
        let text = self.plain_text(body);
        let character_count = text.chars().count() as u64;
        let text_sample: String = text.chars().take(TEXT_SAMPLE_LIMIT).collect();

        PageMetrics {
            title,
            heading_count: self.heading.find_iter(&cleaned).count() as u64,
            paragraph_count: paragraph_lengths.len() as u64,
            image_count: self.image.find_iter(&cleaned).count() as u64,
            character_count,
            average_paragraph_length,
            text_sample,
        }
    }

    fn plain_text(&self, fragment: &str) -> String {
        let stripped = self.tag.replace_all(fragment, " ");
        let decoded = decode_entities(&stripped);
        self.whitespace.replace_all(&decoded, " ").trim().to_string()
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
