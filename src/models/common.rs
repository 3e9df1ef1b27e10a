use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Primary,
    Fallback,
}

/// One remote model the router may try, in configured order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCandidate {
    pub identifier: String,
    pub role: ModelRole,
}

impl ModelCandidate {
    pub fn primary(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            role: ModelRole::Primary,
        }
    }

    pub fn fallback(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            role: ModelRole::Fallback,
        }
    }
}
