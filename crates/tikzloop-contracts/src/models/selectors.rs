use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
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

    /// Picks a model for `capability`, optionally pinned to one provider.
    ///
    /// An unregistered model requested for an explicit provider is passed
    /// through untouched so newer model names keep working.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
        provider: Option<&str>,
    ) -> Result<ModelSelection, String> {
        let provider_matches =
            |model: &ModelSpec| provider.map(|name| model.provider == name).unwrap_or(true);

        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self
                .registry
                .ensure(requested_value, capability)
                .filter(|model| provider_matches(model))
            {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            if let (Some(provider), None) = (provider, self.registry.get(requested_value)) {
                return Ok(ModelSelection {
                    model: ModelSpec {
                        name: requested_value.to_string(),
                        provider: provider.to_string(),
                        capabilities: vec![capability.to_string()],
                    },
                    requested: Some(requested_value.to_string()),
                    fallback_reason: Some(format!(
                        "Model '{requested_value}' not in registry; passing through to provider '{provider}'."
                    )),
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self
            .registry
            .by_capability(capability)
            .into_iter()
            .filter(|model| provider_matches(model))
            .collect::<Vec<ModelSpec>>();
        let Some(model) = candidates.first().cloned() else {
            return Err(match provider {
                Some(provider) => format!(
                    "No models available for capability '{capability}' on provider '{provider}'."
                ),
                None => format!("No models available for capability '{capability}'."),
            });
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}
