//! Data categories and their payload schemas
//!
//! Each record belongs to a named category (appliances, vehicles, pets, ...)
//! with its own encryption policy. Payloads are a closed set of tagged
//! variants with an explicit schema, so a malformed or wrong-shape decrypted
//! blob is caught at decode time as a malformed record instead of propagating
//! an ill-typed value.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{StashError, StashResult};
use crate::event::KIND_ADDRESSABLE_MIN;

/// A named class of application data with its own encryption policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Appliances,
    Vehicles,
    Pets,
    Properties,
    Notes,
}

impl Category {
    /// All known categories
    pub const ALL: [Category; 5] = [
        Category::Appliances,
        Category::Vehicles,
        Category::Pets,
        Category::Properties,
        Category::Notes,
    ];

    /// The addressable event kind carrying this category's records.
    ///
    /// One kind per category, starting at the addressable range floor.
    pub fn kind(&self) -> u32 {
        match self {
            Category::Appliances => KIND_ADDRESSABLE_MIN + 1,
            Category::Vehicles => KIND_ADDRESSABLE_MIN + 2,
            Category::Pets => KIND_ADDRESSABLE_MIN + 3,
            Category::Properties => KIND_ADDRESSABLE_MIN + 4,
            Category::Notes => KIND_ADDRESSABLE_MIN + 5,
        }
    }

    /// Reverse lookup from an event kind
    pub fn from_kind(kind: u32) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.kind() == kind)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Category::Appliances => "appliances",
            Category::Vehicles => "vehicles",
            Category::Pets => "pets",
            Category::Properties => "properties",
            Category::Notes => "notes",
        };
        write!(f, "{}", name)
    }
}

/// Structured record payload, tagged by category.
///
/// The embedding UI supplies richer per-entity forms; this closed set is the
/// shape that crosses the encryption gateway and the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum CategoryPayload {
    Appliances {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brand: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        purchased_at: Option<u64>,
    },
    Vehicles {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        make: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        year: Option<u32>,
    },
    Pets {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        species: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        breed: Option<String>,
    },
    Properties {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Notes {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

impl CategoryPayload {
    /// The category this payload belongs to
    pub fn category(&self) -> Category {
        match self {
            CategoryPayload::Appliances { .. } => Category::Appliances,
            CategoryPayload::Vehicles { .. } => Category::Vehicles,
            CategoryPayload::Pets { .. } => Category::Pets,
            CategoryPayload::Properties { .. } => Category::Properties,
            CategoryPayload::Notes { .. } => Category::Notes,
        }
    }

    /// Serialize to the plaintext JSON wire form
    pub fn to_json(&self) -> StashResult<String> {
        serde_json::to_string(self).map_err(|e| StashError::Serialization(e.to_string()))
    }

    /// Decode and validate a plaintext JSON wire form.
    ///
    /// Unknown categories and wrong-shape payloads fail as
    /// [`StashError::MalformedRecord`].
    pub fn from_json(json: &str) -> StashResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| StashError::MalformedRecord(format!("bad category payload: {}", e)))
    }
}

/// Mapping from category to "should encrypt", supplied by the embedding
/// application.
#[derive(Debug, Clone, Default)]
pub struct EncryptionPolicy {
    encrypted: HashSet<Category>,
}

impl EncryptionPolicy {
    /// Policy with no encrypted categories
    pub fn plaintext_only() -> Self {
        Self::default()
    }

    /// Policy encrypting every known category
    pub fn encrypt_all() -> Self {
        Self {
            encrypted: Category::ALL.into_iter().collect(),
        }
    }

    /// Policy encrypting the given categories
    pub fn encrypting(categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            encrypted: categories.into_iter().collect(),
        }
    }

    /// Whether records of this category must be stored encrypted on
    /// untrusted relays
    pub fn should_encrypt(&self, category: Category) -> bool {
        self.encrypted.contains(&category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_round_trip() {
        let payload = CategoryPayload::Pets {
            name: "Fido".to_string(),
            species: Some("dog".to_string()),
            breed: None,
        };
        let json = payload.to_json().unwrap();
        let back = CategoryPayload::from_json(&json).unwrap();
        assert_eq!(payload, back);
        assert_eq!(back.category(), Category::Pets);
    }

    #[test]
    fn test_unknown_category_is_malformed() {
        let err = CategoryPayload::from_json(r#"{"category":"starships","name":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, StashError::MalformedRecord(_)));
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        // `name` is required on every variant.
        let err = CategoryPayload::from_json(r#"{"category":"pets","species":"dog"}"#)
            .unwrap_err();
        assert!(matches!(err, StashError::MalformedRecord(_)));
    }

    #[test]
    fn test_category_kind_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_kind(category.kind()), Some(category));
            assert!(category.kind() >= KIND_ADDRESSABLE_MIN);
        }
        assert_eq!(Category::from_kind(1), None);
    }

    #[test]
    fn test_policy_lookup() {
        let policy = EncryptionPolicy::encrypting([Category::Pets]);
        assert!(policy.should_encrypt(Category::Pets));
        assert!(!policy.should_encrypt(Category::Notes));
        assert!(EncryptionPolicy::encrypt_all().should_encrypt(Category::Notes));
        assert!(!EncryptionPolicy::plaintext_only().should_encrypt(Category::Pets));
    }
}
