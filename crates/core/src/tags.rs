//! Bracketed-tag handling for assistant text.
//!
//! The model embeds two kinds of bracketed tags in its replies: image
//! directives (`[IMAGE: ...]`, `[GENERATE_IMAGE: ...]`) that trigger
//! generation after the response completes, and paralinguistic tags such as
//! `[laugh]` that some synthesis engines interpret. The transcript shown to
//! the user keeps paralinguistic tags but hides image directives; the text
//! handed to synthesis must carry no brackets at all.

use regex::Regex;
use std::sync::LazyLock;

static IMAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(?:IMAGE|GENERATE_IMAGE):\s*([^\]]+)\]").expect("valid image tag pattern")
});

static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\]").expect("valid tag pattern"));

/// An image-generation request embedded in assistant text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub raw_prompt: String,
}

/// Extracts image directives in the order they appear in `text`.
pub fn scan(text: &str) -> Vec<Directive> {
    IMAGE_TAG
        .captures_iter(text)
        .map(|cap| Directive {
            raw_prompt: cap[1].trim().to_string(),
        })
        .collect()
}

/// Removes every bracketed tag. Used before synthesis so tag text is never
/// spoken aloud.
pub fn strip_tags(text: &str) -> String {
    ANY_TAG.replace_all(text, "").into_owned()
}

/// Removes only image directives, leaving other bracketed tags for the client
/// to display or the engine to interpret.
pub fn strip_image_tags(text: &str) -> String {
    IMAGE_TAG.replace_all(text, "").into_owned()
}
