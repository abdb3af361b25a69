// src/utils/config.rs
use crate::server::parser::TagConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_AUDIT_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] serde_json::Error),
    #[error("unknown model profile: {0}")]
    UnknownModel(String),
    #[error("no model profiles configured")]
    NoModels,
    #[error("duplicate model profile: {0}")]
    DuplicateModel(String),
    #[error("invalid tool call markers: {0}")]
    InvalidTags(String),
    #[error("audit capacity must be at least 1")]
    ZeroAuditCapacity,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub top_p: Option<f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: Some(4096),
            top_p: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Qwen3,
    Qwen3MoE,
    LLaMa,
    Gemma,
    Gemma3,
    Phi,
    Phi4,
    Mistral,
    GLM4,
    Yi,
    StableLM,
    DeepSeek,
}

impl ModelType {
    /// Best-effort model family detection from a model id such as
    /// `Qwen/Qwen3-30B-A3B` or `meta-llama/Llama-3.1-8B-Instruct`.
    pub fn from_model_id(model_id: &str) -> Self {
        let lower = model_id.to_ascii_lowercase();
        if lower.contains("llama") {
            ModelType::LLaMa
        } else if lower.contains("gemma-3") || lower.contains("gemma3") {
            ModelType::Gemma3
        } else if lower.contains("gemma") {
            ModelType::Gemma
        } else if lower.contains("phi-4") || lower.contains("phi4") {
            ModelType::Phi4
        } else if lower.contains("phi") {
            ModelType::Phi
        } else if lower.contains("mistral") {
            ModelType::Mistral
        } else if lower.contains("glm") {
            ModelType::GLM4
        } else if lower.contains("deepseek") {
            ModelType::DeepSeek
        } else if lower.contains("stablelm") {
            ModelType::StableLM
        } else if lower.contains("yi-") {
            ModelType::Yi
        } else if lower.contains("qwen") && (lower.contains("moe") || lower.contains("-a3b")) {
            ModelType::Qwen3MoE
        } else {
            ModelType::Qwen3
        }
    }
}

/// A named model configuration a request can select.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelProfile {
    pub name: String,
    pub model_id: String,
    /// Inferred from `model_id` when absent
    #[serde(default)]
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Overrides the family default markers
    #[serde(default)]
    pub tags: Option<TagConfig>,
}

impl ModelProfile {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            model_type: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            tags: None,
        }
    }

    pub fn resolved_type(&self) -> ModelType {
        self.model_type
            .unwrap_or_else(|| ModelType::from_model_id(&self.model_id))
    }
}

/// Per-request choices layered over a profile.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ModelSelection {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub top_p: Option<f32>,
}

/// Everything the pipeline needs to know about the model for one request.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub name: String,
    pub model_id: String,
    pub model_type: ModelType,
    pub params: SamplingParams,
    pub tags: TagConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_models")]
    pub models: Vec<ModelProfile>,
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

fn default_models() -> Vec<ModelProfile> {
    vec![ModelProfile::new("default", "Qwen/Qwen3-8B")]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            projects_root: default_projects_root(),
            audit_capacity: default_audit_capacity(),
            default_model: None,
            models: default_models(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if self.audit_capacity == 0 {
            return Err(ConfigError::ZeroAuditCapacity);
        }
        let mut seen = std::collections::HashSet::new();
        for profile in &self.models {
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateModel(profile.name.clone()));
            }
            if let Some(tags) = &profile.tags {
                tags.validate()?;
            }
        }
        if let Some(name) = &self.default_model {
            self.profile(name)?;
        }
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<&ModelProfile, ConfigError> {
        self.models
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownModel(name.to_string()))
    }

    fn default_profile(&self) -> Result<&ModelProfile, ConfigError> {
        match &self.default_model {
            Some(name) => self.profile(name),
            None => self.models.first().ok_or(ConfigError::NoModels),
        }
    }

    /// Resolve the model, sampling parameters and tool markers for a request.
    pub fn resolve(&self, selection: &ModelSelection) -> Result<ResolvedModel, ConfigError> {
        let profile = match &selection.model {
            Some(name) => self.profile(name)?,
            None => self.default_profile()?,
        };
        let model_type = profile.resolved_type();
        let tags = profile
            .tags
            .clone()
            .unwrap_or_else(|| TagConfig::for_model_type(&model_type));

        let mut params = SamplingParams::default();
        params.temperature = selection.temperature.or(profile.temperature);
        params.top_p = selection.top_p.or(profile.top_p);
        if let Some(max_tokens) = selection.max_tokens.or(profile.max_tokens) {
            params.max_tokens = Some(max_tokens);
        }

        Ok(ResolvedModel {
            name: profile.name.clone(),
            model_id: profile.model_id.clone(),
            model_type,
            params,
            tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_detection() {
        assert_eq!(
            ModelType::from_model_id("meta-llama/Llama-3.1-8B-Instruct"),
            ModelType::LLaMa
        );
        assert_eq!(ModelType::from_model_id("google/gemma-3-4b-it"), ModelType::Gemma3);
        assert_eq!(ModelType::from_model_id("Qwen/Qwen3-30B-A3B"), ModelType::Qwen3MoE);
        assert_eq!(ModelType::from_model_id("something-else"), ModelType::Qwen3);
    }

    #[test]
    fn test_default_config_resolves() {
        let config = AppConfig::default();
        let resolved = config.resolve(&ModelSelection::default()).unwrap();
        assert_eq!(resolved.name, "default");
        assert_eq!(resolved.tags, TagConfig::default());
        assert_eq!(resolved.params.max_tokens, Some(4096));
    }

    #[test]
    fn test_selection_overrides_profile() {
        let config = AppConfig::from_json_str(
            r#"{
                "default_model": "writer",
                "models": [
                    {"name": "writer", "model_id": "google/gemma-3-12b-it", "temperature": 0.9, "max_tokens": 2048},
                    {"name": "planner", "model_id": "Qwen/Qwen3-8B"}
                ]
            }"#,
        )
        .unwrap();

        let resolved = config
            .resolve(&ModelSelection {
                temperature: Some(0.2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.name, "writer");
        assert_eq!(resolved.model_type, ModelType::Gemma3);
        assert_eq!(resolved.tags.open, "<start_function_call>");
        assert_eq!(resolved.params.temperature, Some(0.2));
        assert_eq!(resolved.params.max_tokens, Some(2048));
        assert_eq!(config.audit_capacity, DEFAULT_AUDIT_CAPACITY);
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let config = AppConfig::default();
        let err = config
            .resolve(&ModelSelection {
                model: Some("missing".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel(name) if name == "missing"));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            AppConfig::from_json_str(r#"{"models": []}"#),
            Err(ConfigError::NoModels)
        ));
        assert!(matches!(
            AppConfig::from_json_str(
                r#"{"models": [{"name": "a", "model_id": "x"}, {"name": "a", "model_id": "y"}]}"#
            ),
            Err(ConfigError::DuplicateModel(_))
        ));
        assert!(matches!(
            AppConfig::from_json_str(
                r#"{"models": [{"name": "a", "model_id": "x", "tags": {"open": "<t>", "close": "<t>"}}]}"#
            ),
            Err(ConfigError::InvalidTags(_))
        ));
        assert!(matches!(
            AppConfig::from_json_str(r#"{"default_model": "nope"}"#),
            Err(ConfigError::UnknownModel(_))
        ));
    }
}
