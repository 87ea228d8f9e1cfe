//! Post validation
//!
//! Shape rules decide whether a post can be published at all:
//!
//! | type                        | media references                  |
//! |-----------------------------|-----------------------------------|
//! | static, story, video, reel  | exactly 1                         |
//! | carousel                    | `carousel_min..=carousel_max`     |
//!
//! They run at enqueue time and again in the publisher before any network
//! I/O. Caption checks only run at enqueue time.

use crate::config::PublishConfig;
use crate::error::{PostlineError, Result};
use crate::types::PostType;

/// Hashtags beyond this are dropped by the platform
const HASHTAG_WARN_LIMIT: usize = 30;

/// Check the media count for a post type
pub fn check_shape(rules: &PublishConfig, post_type: PostType, media: &[String]) -> Result<()> {
    if let Some(empty) = media.iter().position(|m| m.trim().is_empty()) {
        return Err(PostlineError::InvalidPostShape(format!(
            "media reference #{} is empty",
            empty + 1
        )));
    }

    match post_type {
        PostType::Carousel => {
            if media.len() < rules.carousel_min || media.len() > rules.carousel_max {
                return Err(PostlineError::InvalidPostShape(format!(
                    "carousel needs {} to {} media references, got {}",
                    rules.carousel_min,
                    rules.carousel_max,
                    media.len()
                )));
            }
        }
        PostType::Static | PostType::Story | PostType::Video | PostType::Reel => {
            if media.len() != 1 {
                return Err(PostlineError::InvalidPostShape(format!(
                    "{} needs exactly 1 media reference, got {}",
                    post_type,
                    media.len()
                )));
            }
        }
    }

    Ok(())
}

/// Everything checked before a post is accepted
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub post_type: PostType,
    pub media: Vec<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Default)]
pub struct ValidationResponse {
    pub valid: bool,
    /// The first error is returned by [`ValidationService::check`]
    pub errors: Vec<PostlineError>,
    /// Non-blocking findings
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationService {
    rules: PublishConfig,
}

impl ValidationService {
    pub fn new(rules: PublishConfig) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PublishConfig {
        &self.rules
    }

    pub fn validate(&self, request: &ValidationRequest) -> ValidationResponse {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = check_shape(&self.rules, request.post_type, &request.media) {
            errors.push(e);
        }

        if let Some(caption) = &request.caption {
            let chars = caption.chars().count();
            if chars > self.rules.max_caption_chars {
                errors.push(PostlineError::InvalidInput(format!(
                    "caption is {} characters, limit is {}",
                    chars, self.rules.max_caption_chars
                )));
            }

            let hashtags = caption.split_whitespace().filter(|w| w.starts_with('#')).count();
            if hashtags > HASHTAG_WARN_LIMIT {
                warnings.push(format!(
                    "caption has {} hashtags; only the first {} are indexed",
                    hashtags, HASHTAG_WARN_LIMIT
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        if request.media.iter().any(|m| !seen.insert(m)) {
            warnings.push("the same media reference appears more than once".to_string());
        }

        ValidationResponse {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Validate and return the first error, logging warnings
    pub fn check(&self, request: &ValidationRequest) -> Result<()> {
        let response = self.validate(request);
        for warning in &response.warnings {
            tracing::warn!(post_type = %request.post_type, "{}", warning);
        }
        match response.errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
