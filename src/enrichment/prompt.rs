use crate::persistence::truncate_text;
use crate::persistence::PageContext;

pub const PROMPT_SAMPLE_LIMIT: usize = 1_500;

pub struct PagePromptInput<'a> {
    pub url: &'a str,
    pub title: &'a str,
    pub category: &'a str,
    pub text_sample: &'a str,
    pub layout_highlights: &'a str,
    pub context: &'a PageContext,
}

/// Asks for a single sentence describing the page's visual style.
pub fn visual_summary_prompt(input: &PagePromptInput<'_>) -> String {
    let sample = truncate_text(input.text_sample.trim(), PROMPT_SAMPLE_LIMIT);
    let mut prompt = String::from(
        "Describe the visual style and layout of this web page in one short sentence. \
         Reply with the sentence only.\n",
    );

    prompt.push_str(&format!("URL: {}\n", input.url));
    if !input.title.is_empty() {
        prompt.push_str(&format!("Title: {}\n", input.title));
    }
    if !input.category.is_empty() {
        prompt.push_str(&format!("Category: {}\n", input.category));
    }
    prompt.push_str(&format!(
        "Structure: {} headings, {} paragraphs, {} images, {} characters\n",
        input.context.heading_count,
        input.context.paragraph_count,
        input.context.image_count,
        input.context.character_count
    ));
    if !input.layout_highlights.is_empty() {
        prompt.push_str(&format!("Layout notes: {}\n", input.layout_highlights));
    }
    if !sample.is_empty() {
        prompt.push_str("Text sample:\n");
        prompt.push_str(&sample);
        prompt.push('\n');
    }
    prompt
}
