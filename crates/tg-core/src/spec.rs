use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::GenerationModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Source image for image-to-image generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceImage {
    /// PNG encoded bytes
    pub png: Vec<u8>,
    /// 0 reproduces the reference, 1 ignores it
    pub strength: f32,
}

/// Immutable description of one texture to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSpec {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Extra form fields passed through to the endpoint
    pub params: BTreeMap<String, String>,
    /// Asset name; the last destination segment when absent
    pub asset_name: Option<String>,
    /// Relative destination path, e.g. `Textures/Red`
    pub destination: String,
    pub dimensions: Option<Dimensions>,
    pub model: GenerationModel,
    /// Positive seeds are fixed, anything else lets the endpoint pick
    pub seed: Option<u32>,
    pub reference: Option<ReferenceImage>,
    /// Explicit slot key; defaults to the resolved asset path
    pub slot: Option<String>,
}

impl GenerationSpec {
    pub fn new(prompt: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            params: BTreeMap::new(),
            asset_name: None,
            destination: destination.into(),
            dimensions: None,
            model: GenerationModel::default(),
            seed: None,
            reference: None,
            slot: None,
        }
    }

    pub fn with_asset_name(mut self, name: impl Into<String>) -> Self {
        self.asset_name = Some(name.into());
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some(Dimensions { width, height });
        self
    }

    pub fn with_model(mut self, model: GenerationModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_reference(mut self, png: Vec<u8>, strength: f32) -> Self {
        self.reference = Some(ReferenceImage { png, strength });
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    /// Folder and asset name the spec resolves to.
    pub fn target(&self) -> (String, String) {
        let destination = self.destination.trim_end_matches('/');
        match self.asset_name.as_deref() {
            Some(name) => (destination.to_string(), name.to_string()),
            None => match destination.rsplit_once('/') {
                Some((folder, name)) => (folder.to_string(), name.to_string()),
                None => (String::new(), destination.to_string()),
            },
        }
    }

    pub fn slot_key(&self) -> String {
        if let Some(slot) = &self.slot {
            return slot.clone();
        }
        match self.target() {
            (folder, name) if folder.is_empty() => name,
            (folder, name) => format!("{folder}/{name}"),
        }
    }

    /// Hex SHA-256 over every field that shapes the generated image. The slot is excluded.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |tag: &str, bytes: &[u8]| {
            hasher.update(tag.as_bytes());
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };

        field("prompt", self.prompt.as_bytes());
        if let Some(negative) = &self.negative_prompt {
            field("negative_prompt", negative.as_bytes());
        }
        for (key, value) in &self.params {
            field("param.key", key.as_bytes());
            field("param.value", value.as_bytes());
        }
        let (folder, name) = self.target();
        field("folder", folder.as_bytes());
        field("name", name.as_bytes());
        if let Some(dims) = self.dimensions {
            field("width", &dims.width.to_le_bytes());
            field("height", &dims.height.to_le_bytes());
        }
        field("model", self.model.id().as_bytes());
        if let Some(seed) = self.seed {
            field("seed", &seed.to_le_bytes());
        }
        if let Some(reference) = &self.reference {
            field("reference", &reference.png);
            field("strength", &reference.strength.to_le_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_destination() {
        let spec = GenerationSpec::new("red square", "Textures/Red");
        assert_eq!(spec.target(), ("Textures".to_string(), "Red".to_string()));
        assert_eq!(spec.slot_key(), "Textures/Red");
    }

    #[test]
    fn test_target_with_explicit_name() {
        let spec = GenerationSpec::new("moss", "Textures/Nature/").with_asset_name("Moss");
        assert_eq!(spec.target(), ("Textures/Nature".to_string(), "Moss".to_string()));
        assert_eq!(spec.with_slot("nature").slot_key(), "nature");
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = GenerationSpec::new("red square", "Textures/Red");
        let b = GenerationSpec::new("red square", "Textures/Red");
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);

        assert_ne!(a.hash(), b.clone().with_seed(7).hash());
        assert_ne!(a.hash(), b.clone().with_param("style", "pixel").hash());
        assert_eq!(a.hash(), b.with_slot("other").hash());
    }
}
