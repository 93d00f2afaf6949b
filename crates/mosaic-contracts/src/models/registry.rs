use indexmap::IndexMap;

pub const STITCH_CAPABILITY: &str = "stitch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    /// Model name as the provider's API expects it.
    pub api_model: String,
    pub capabilities: Vec<String>,
    pub pricing_key: Option<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, api_model: &str, pricing_key: Option<&str>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                api_model: api_model.to_string(),
                capabilities: vec![STITCH_CAPABILITY.to_string()],
                pricing_key: pricing_key.map(str::to_string),
            },
        );
    };

    // First entry is the default.
    insert(
        "gemini-2.5-flash-image",
        "gemini",
        "gemini-2.5-flash-image",
        Some("google-gemini-2.5-flash-image"),
    );
    insert(
        "relay-gemini-2.5-flash-image",
        "relay",
        "gemini-2.5-flash-image",
        Some("google-gemini-2.5-flash-image"),
    );
    insert(
        "dryrun-stitch-1",
        "dryrun",
        "dryrun-stitch-1",
        Some("dryrun-stitch"),
    );

    map
}
