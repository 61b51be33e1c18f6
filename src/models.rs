use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSecondsWithFrac};
use thiserror::Error;

pub const API_VERSION: &str = "1.0.0";
pub const MIN_GUIDANCE_SCALE: f32 = 1.0;
pub const MAX_GUIDANCE_SCALE: f32 = 20.0;

fn default_show_steps() -> usize { 50 }
fn default_total_iterations() -> usize { 1000 }
fn default_guidance_scale() -> f32 { 7.5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub include: Vec<String>, // extra elements to feature
    #[serde(default)]
    pub exclude: String,
    #[serde(default)]
    pub extras: String, // style/medium, e.g. "watercolor painting"
    #[serde(rename = "num_steps", alias = "show_steps", default = "default_show_steps")]
    pub show_steps: usize,
    #[serde(rename = "num_iterations", alias = "total_iterations", default = "default_total_iterations")]
    pub total_iterations: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            include: Vec::new(),
            exclude: String::new(),
            extras: String::new(),
            show_steps: default_show_steps(),
            total_iterations: default_total_iterations(),
            guidance_scale: default_guidance_scale(),
            seed: None,
        }
    }

    /// Checks every field and freezes the request for a run.
    pub fn validate(self, max_iterations: usize) -> Result<AcceptedRequest, ValidationError> {
        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        let show_steps = NonZeroUsize::new(self.show_steps).ok_or_else(|| ValidationError::OutOfRange {
            field: "num_steps",
            value: self.show_steps.to_string(),
            reason: "must be at least 1".into(),
        })?;
        if self.total_iterations == 0 || self.total_iterations > max_iterations {
            return Err(ValidationError::OutOfRange {
                field: "num_iterations",
                value: self.total_iterations.to_string(),
                reason: format!("must be between 1 and {max_iterations}"),
            });
        }
        if !(MIN_GUIDANCE_SCALE..=MAX_GUIDANCE_SCALE).contains(&self.guidance_scale) {
            return Err(ValidationError::OutOfRange {
                field: "guidance_scale",
                value: self.guidance_scale.to_string(),
                reason: format!("must be between {MIN_GUIDANCE_SCALE} and {MAX_GUIDANCE_SCALE}"),
            });
        }
        let seed = self.seed.unwrap_or_else(rand::random);
        Ok(AcceptedRequest {
            request: self,
            show_steps,
            seed,
        })
    }
}

/// A validated request; immutable from here on.
#[derive(Debug, Clone)]
pub struct AcceptedRequest {
    request: GenerationRequest,
    show_steps: NonZeroUsize,
    seed: u64,
}

impl AcceptedRequest {
    pub fn prompt(&self) -> &str {
        &self.request.prompt
    }

    pub fn include(&self) -> Vec<&str> {
        if self.request.include.is_empty() {
            vec![self.request.prompt.as_str()]
        } else {
            self.request.include.iter().map(String::as_str).collect()
        }
    }

    pub fn exclude_present(&self) -> bool {
        !self.request.exclude.is_empty()
    }

    pub fn extras_present(&self) -> bool {
        !self.request.extras.is_empty()
    }

    pub fn show_steps(&self) -> NonZeroUsize {
        self.show_steps
    }

    pub fn total_iterations(&self) -> usize {
        self.request.total_iterations
    }

    pub fn guidance_scale(&self) -> f32 {
        self.request.guidance_scale
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Prompt cannot be empty or just whitespace")]
    EmptyPrompt,
    #[error("{field}={value} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".into(),
            model_loaded: true,
            timestamp: Utc::now(),
            version: API_VERSION.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_wire_field_names_with_defaults() {
        let req: GenerationRequest = serde_json::from_str(r#"{"prompt":"a red fox","num_steps":2,"num_iterations":5}"#).unwrap();
        assert_eq!(req.show_steps, 2);
        assert_eq!(req.total_iterations, 5);
        assert_eq!(req.guidance_scale, 7.5);
        assert!(req.include.is_empty() && req.exclude.is_empty() && req.extras.is_empty());

        let aliased: GenerationRequest = serde_json::from_str(r#"{"prompt":"x","show_steps":3,"total_iterations":9}"#).unwrap();
        assert_eq!((aliased.show_steps, aliased.total_iterations), (3, 9));
    }

    #[test]
    fn blank_prompt_is_rejected() {
        for prompt in ["", "   ", "\n\t"] {
            let err = GenerationRequest::new(prompt).validate(100).unwrap_err();
            assert_eq!(err, ValidationError::EmptyPrompt);
        }
    }

    #[test]
    fn numeric_fields_are_range_checked() {
        let mut req = GenerationRequest::new("fox");
        req.show_steps = 0;
        assert!(matches!(req.validate(100), Err(ValidationError::OutOfRange { field: "num_steps", .. })));

        let mut req = GenerationRequest::new("fox");
        req.total_iterations = 101;
        assert!(matches!(req.validate(100), Err(ValidationError::OutOfRange { field: "num_iterations", .. })));

        let mut req = GenerationRequest::new("fox");
        req.total_iterations = 10;
        req.guidance_scale = 20.5;
        assert!(matches!(req.validate(100), Err(ValidationError::OutOfRange { field: "guidance_scale", .. })));

        let mut req = GenerationRequest::new("fox");
        req.total_iterations = 10;
        req.guidance_scale = f32::NAN;
        assert!(req.validate(100).is_err());
    }

    #[test]
    fn accepted_request_exposes_hints() {
        let mut req = GenerationRequest::new("a red fox");
        req.total_iterations = 5;
        req.exclude = "sky".into();
        req.seed = Some(9);
        let accepted = req.validate(100).unwrap();
        assert_eq!(accepted.include(), vec!["a red fox"]);
        assert!(accepted.exclude_present());
        assert!(!accepted.extras_present());
        assert_eq!(accepted.seed(), 9);
        assert_eq!(accepted.show_steps().get(), 50);
    }
}
