//! Prompt sanitation, augmentation and dimension clamping.
//!
//! Everything here is a pure function of its inputs; nothing touches the
//! network or shared state.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::DimensionBounds,
    error::{GenerationError, Result},
    models::NormalizedRequest,
};

pub const MIN_PROMPT_CHARS: usize = 3;

/// Separator placed between the caller's text and each appended token.
pub const TOKEN_SEPARATOR: &str = ", ";

pub const QUALITY_BOOSTERS: [&str; 4] = [
    "highly detailed",
    "sharp focus",
    "professional quality",
    "8k",
];

pub const DEFECT_SUPPRESSORS: [&str; 6] = [
    "blurry",
    "low quality",
    "distorted",
    "deformed",
    "watermark",
    "text",
];

#[derive(Debug, Clone, Default)]
pub struct InputNormalizer {
    bounds: DimensionBounds,
}

impl InputNormalizer {
    pub fn new(bounds: DimensionBounds) -> Self {
        Self { bounds }
    }

    pub fn normalize(
        &self,
        prompt: &str,
        negative_prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<NormalizedRequest> {
        let prompt = strip_markup(prompt);
        if prompt.chars().count() < MIN_PROMPT_CHARS {
            return Err(GenerationError::Validation(format!(
                "Prompt must be at least {} characters after removing unsupported characters",
                MIN_PROMPT_CHARS
            )));
        }
        let negative_prompt = strip_markup(negative_prompt);

        Ok(NormalizedRequest {
            prompt: augment(&prompt, &QUALITY_BOOSTERS),
            negative_prompt: augment(&negative_prompt, &DEFECT_SUPPRESSORS),
            width: self.bounds.clamp(width),
            height: self.bounds.clamp(height),
            seed: None,
        })
    }
}

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static DISALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s,.!?-]").expect("valid regex"));

/// Removes `<...>` tags and every character outside word characters,
/// whitespace and `,.!?-`, then collapses runs of whitespace.
pub fn strip_markup(input: &str) -> String {
    let without_tags = TAG.replace_all(input, " ");
    let filtered = DISALLOWED.replace_all(&without_tags, "");
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Appends each token not already present as a comma-separated segment.
pub fn augment(base: &str, tokens: &[&str]) -> String {
    let existing: Vec<String> = base
        .split(',')
        .map(|segment| segment.trim().to_lowercase())
        .filter(|segment| !segment.is_empty())
        .collect();

    let mut out = base.trim().to_string();
    for token in tokens {
        if existing.iter().any(|segment| segment == token) {
            continue;
        }
        if !out.is_empty() {
            out.push_str(TOKEN_SEPARATOR);
        }
        out.push_str(token);
    }
    out
}
