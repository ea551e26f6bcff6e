//! Catalog of the hosted models selectable in the picker
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub guidance: String,
    pub provider: String,
}

impl ModelInfo {
    fn new(id: &str, name: &str, description: &str, guidance: &str, provider: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            guidance: guidance.to_string(),
            provider: provider.to_string(),
        }
    }
}

static AVAILABLE_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        ModelInfo::new(
            "deepseek/deepseek-chat-v3-0324:free",
            "DeepSeek V3",
            "685B MoE model with state-of-the-art chat performance",
            "Best for general conversation, coding, and logical tasks",
            "DeepSeek",
        ),
        ModelInfo::new(
            "meta-llama/llama-4-maverick:free",
            "Llama 4 Maverick",
            "A high-capacity multimodal language model from Meta, built on a mixture-of-experts (MoE) architecture",
            "Best for fast responses and multimodal or API tool-based tasks",
            "Meta",
        ),
        ModelInfo::new(
            "qwen/qwen3-235b-a22b:free",
            "Qwen3-235B A22B",
            "Ultra-large model with cutting-edge reasoning and instruction-following capabilities",
            "Best for complex reasoning, long-form, and assistant-like usage",
            "Qwen",
        ),
        ModelInfo::new(
            "mistralai/mistral-small-3.1-24b-instruct:free",
            "Mistral Small 3.1 24B",
            "Highly capable multilingual and multimodal model with long context support",
            "Use for vision tasks, long-document reasoning, or creative writing",
            "Mistral",
        ),
        ModelInfo::new(
            "qwen/qwen-2.5-coder-32b-instruct:free",
            "Qwen 2.5 Coder 32B",
            "Code-focused model with strong capabilities in software engineering tasks",
            "Best suited for code generation, debugging, and technical documentation",
            "Qwen",
        ),
        ModelInfo::new(
            "deepseek/deepseek-r1-0528:free",
            "DeepSeek R1 0528",
            "Latest flagship model with strong reasoning, long-context, and programming skills",
            "Ideal for general-purpose assistant behavior and problem solving",
            "DeepSeek",
        ),
    ]
});

/// All models selectable in the picker
pub fn available_models() -> &'static [ModelInfo] {
    &AVAILABLE_MODELS
}

/// Model used when no preference is stored
pub fn default_model() -> &'static ModelInfo {
    &AVAILABLE_MODELS[1]
}

pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    AVAILABLE_MODELS.iter().find(|m| m.id == id)
}

/// Display name for a model id, falling back to a generic label
pub fn display_name(id: &str) -> &'static str {
    find_model(id).map(|m| m.name.as_str()).unwrap_or("AI Assistant")
}

/// System-role message prepended to every outbound request. Derived from the
/// selected model's display name; never persisted in the transcript.
pub fn system_prompt(model_name: &str) -> String {
    format!(
        "You are a hosted AI assistant, currently running the \"{model_name}\" model \
         via OpenRouter. You operate within OpenMind, an open-source platform that \
         unifies powerful AI models into one simple interface. You are not the \
         creator of the platform or the model itself. Always state your identity \
         accurately as the \"{model_name}\" model when relevant, and never refer to \
         yourself as \"OpenMind\" - you are hosted on OpenMind. Use a warm, \
         respectful, intelligent tone. Be curious, encouraging, and clear, and match \
         emotional depth to the user's intent. Assist with safety, learning, \
         exploration, and critical thinking."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_nonempty_with_unique_ids() {
        let models = available_models();
        assert!(!models.is_empty());

        let mut ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), models.len());
    }

    #[test]
    fn test_default_model_is_in_catalog() {
        let default = default_model();
        assert!(find_model(&default.id).is_some());
    }

    #[test]
    fn test_find_model_unknown_id() {
        assert!(find_model("vendor/nonexistent-model").is_none());
        assert_eq!(display_name("vendor/nonexistent-model"), "AI Assistant");
    }

    #[test]
    fn test_system_prompt_names_the_model() {
        let prompt = system_prompt("Llama 4 Maverick");
        assert!(prompt.contains("Llama 4 Maverick"));
        assert!(prompt.contains("OpenRouter"));
    }
}
