use super::registry::{ModelRegistry, ModelSpec};

/// Outcome of resolving a requested model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    /// Why `model` is not what was requested; `None` on an exact match.
    pub fallback_reason: Option<String>,
}

impl ModelSelection {
    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Exact match when `requested` names a model with `capability`,
    /// otherwise the registry's first model with it. Blank requests count as
    /// no request.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if let Some(model) = requested
            .as_deref()
            .and_then(|name| self.registry.ensure(name, capability))
        {
            return Ok(ModelSelection {
                model,
                requested,
                fallback_reason: None,
            });
        }

        let fallback_reason = match requested.as_deref() {
            Some(name) => {
                format!("Requested model '{name}' unavailable for capability '{capability}'.")
            }
            None => "No model specified; using default.".to_string(),
        };
        let model = self
            .registry
            .by_capability(capability)
            .into_iter()
            .next()
            .ok_or_else(|| format!("No models available for capability '{capability}'."))?;
        Ok(ModelSelection {
            model,
            requested,
            fallback_reason: Some(fallback_reason),
        })
    }
}
