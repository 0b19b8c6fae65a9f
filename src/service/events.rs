//! Events pushed to the page observer outside the request/response flow.

use serde::Serialize;

use crate::handlers::state::PagePreferences;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEvent {
    /// Preferences for `origin` changed; open pages should re-apply them.
    ApplyPersonalizationNow { origin: String },
    ApplyPagePersonalization {
        origin: String,
        css: String,
        rationale: String,
    },
}

impl ServiceEvent {
    pub fn apply_now<S: Into<String>>(origin: S) -> Self {
        ServiceEvent::ApplyPersonalizationNow {
            origin: origin.into(),
        }
    }

    /// Builds the stylesheet and explanation for an origin's stored
    /// preference. `category` is the latest classified page category.
    pub fn page_personalization<S: Into<String>>(
        origin: S,
        preferences: &PagePreferences,
        category: Option<&str>,
    ) -> Self {
        let color = sanitize_color(&preferences.highlight_color);
        let css = format!(
            "::selection {{ background-color: {color}; }}\n\
             mark, .pagelens-highlight {{ background-color: {color}; }}\n\
             a:hover, a:focus {{ outline: 2px solid {color}; outline-offset: 2px; }}"
        );

        let rationale = match category.filter(|category| !category.is_empty()) {
            Some(category) => format!(
                "Highlighting with {color} because you return to this {category} site often."
            ),
            None => format!("Highlighting with {color} because you return to this site often."),
        };

        ServiceEvent::ApplyPagePersonalization {
            origin: origin.into(),
            css,
            rationale,
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            ServiceEvent::ApplyPersonalizationNow { origin }
            | ServiceEvent::ApplyPagePersonalization { origin, .. } => origin,
        }
    }
}

/// Keeps the first declaration-free segment of a stored colour, limited to
/// characters valid in a CSS colour value.
fn sanitize_color(raw: &str) -> String {
    let first = raw.split([';', '{', '}']).next().unwrap_or_default();
    let cleaned: String = first
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '#' | '(' | ')' | ',' | '.' | '%' | ' '))
        .collect();
    if cleaned.trim().is_empty() {
        crate::config::DEFAULT_HIGHLIGHT_COLOR.to_string()
    } else {
        cleaned.trim().to_string()
    }
}
