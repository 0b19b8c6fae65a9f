//! Local page analysis: category classification, HTML metrics and the
//! heuristic summaries used when enrichment is unavailable.

pub mod classifier;
pub mod html;

pub use classifier::{classify, FALLBACK_CATEGORY};
pub use html::{PageMetrics, PageParser};

use crate::persistence::PageContext;

const IMAGE_HEAVY_RATIO: f64 = 0.5;
const LONG_FORM_PARAGRAPH_CHARS: u64 = 400;
const DENSE_TEXT_CHARS: u64 = 5_000;

/// One-line description of the page's visual balance derived from its
/// counters.
pub fn heuristic_visual_trend(context: &PageContext, average_paragraph_length: u64) -> String {
    if context.paragraph_count == 0 && context.image_count == 0 && context.heading_count == 0 {
        return "minimal layout with little structured content".to_string();
    }

    let blocks = (context.paragraph_count + context.image_count).max(1) as f64;
    let image_ratio = context.image_count as f64 / blocks;

    let balance = if image_ratio >= IMAGE_HEAVY_RATIO {
        "image-heavy layout"
    } else if context.character_count >= DENSE_TEXT_CHARS
        || average_paragraph_length >= LONG_FORM_PARAGRAPH_CHARS
    {
        "text-dense long-form layout"
    } else {
        "balanced text and media layout"
    };

    let sections = if context.heading_count >= 6 {
        "many sections"
    } else if context.heading_count >= 2 {
        "a few sections"
    } else {
        "a single section"
    };

    format!("{balance} with {sections}")
}

pub fn heuristic_layout_highlights(context: &PageContext, average_paragraph_length: u64) -> String {
    let mut parts = vec![
        format!("{} headings", context.heading_count),
        format!("{} paragraphs", context.paragraph_count),
        format!("{} images", context.image_count),
    ];
    if average_paragraph_length > 0 {
        parts.push(format!("~{average_paragraph_length} chars per paragraph"));
    }
    parts.join(", ")
}
