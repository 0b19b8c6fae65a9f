//! Keyword-based page category classification.

use std::collections::HashMap;

pub const FALLBACK_CATEGORY: &str = "other";

/// Declaration order breaks ties.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "shopping",
        &[
            "buy", "cart", "checkout", "price", "sale", "shop", "shipping", "order", "discount",
            "deal",
        ],
    ),
    (
        "news",
        &[
            "news", "breaking", "headline", "report", "politics", "editorial", "journalist",
            "latest",
        ],
    ),
    (
        "technology",
        &[
            "software", "developer", "programming", "code", "api", "cloud", "hardware", "release",
            "open-source",
        ],
    ),
    (
        "entertainment",
        &[
            "movie", "music", "video", "game", "episode", "stream", "trailer", "album", "celebrity",
        ],
    ),
    (
        "education",
        &[
            "course", "tutorial", "lesson", "learn", "university", "student", "lecture", "study",
        ],
    ),
    (
        "finance",
        &[
            "bank", "invest", "stock", "market", "loan", "crypto", "mortgage", "savings",
        ],
    ),
    (
        "travel",
        &[
            "hotel", "flight", "travel", "booking", "destination", "trip", "airport", "vacation",
        ],
    ),
    (
        "social",
        &[
            "profile", "follow", "friends", "comment", "share", "post", "community", "like",
        ],
    ),
];

/// Returns the category with the most whole-word keyword hits in `text`,
/// or [`FALLBACK_CATEGORY`] when nothing matches.
pub fn classify(text: &str) -> &'static str {
    let mut frequencies: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        *frequencies.entry(token).or_default() += 1;
    }

    if frequencies.is_empty() {
        return FALLBACK_CATEGORY;
    }

    let mut best = FALLBACK_CATEGORY;
    let mut best_hits = 0;
    for (category, keywords) in CATEGORY_KEYWORDS {
        let hits: usize = keywords
            .iter()
            .map(|keyword| frequencies.get(*keyword).copied().unwrap_or(0))
            .sum();
        if hits > best_hits {
            best = category;
            best_hits = hits;
        }
    }
    best
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|token| token.trim_matches('-'))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}
