use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Ordered registry of model identifiers the dispatcher knows how to
/// drive. Identifiers are externally versioned strings with inconsistent
/// suffix conventions, so membership here is the source of truth for the
/// text path; image families are matched by prefix in the resolver.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn supports(&self, name: &str, capability: &str) -> bool {
        self.get(name)
            .map(|model| model.supports(capability))
            .unwrap_or(false)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("amazon.titan-text-premier-v1:0", "amazon", &["text"]);
    insert("amazon.titan-text-express-v1", "amazon", &["text"]);
    insert("amazon.titan-text-lite-v1", "amazon", &["text"]);
    insert("ai21.j2-ultra-v1", "ai21", &["text"]);
    insert("ai21.j2-mid-v1", "ai21", &["text"]);
    insert(
        "anthropic.claude-3-sonnet-20240229-v1:0",
        "anthropic",
        &["text", "vision"],
    );
    insert(
        "anthropic.claude-3-haiku-20240307-v1:0",
        "anthropic",
        &["text", "vision"],
    );
    insert("cohere.command-r-plus-v1:0", "cohere", &["text"]);
    insert("cohere.command-r-v1:0", "cohere", &["text"]);
    insert("meta.llama3-70b-instruct-v1:0", "meta", &["text"]);
    insert("meta.llama3-8b-instruct-v1:0", "meta", &["text"]);
    insert("mistral.mistral-large-2402-v1:0", "mistral", &["text"]);
    insert("mistral.mixtral-8x7b-instruct-v0:1", "mistral", &["text"]);
    insert("mistral.mistral-7b-instruct-v0:2", "mistral", &["text"]);
    insert("mistral.mistral-small-2402-v1:0", "mistral", &["text"]);
    insert("amazon.titan-image-generator-v1", "amazon", &["image", "edit"]);
    insert(
        "amazon.titan-image-generator-v2:0",
        "amazon",
        &["image", "reference"],
    );
    insert("stability.stable-diffusion-xl-v1", "stability", &["image"]);

    map
}
