use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Schema-registry collaborator: given an algorithm's `gid`/`cid`, decides
/// whether a submission's arguments match the declared input schema.
///
/// The real registry lives outside this subsystem; submissions are
/// validated through this seam before anything is enqueued.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn validate(&self, gid: &str, cid: &str, arguments: &Value) -> Result<()>;
}

/// Registry that accepts everything. Useful when validation is handled
/// upstream or in tests that are not about validation.
#[derive(Debug, Default)]
pub struct PermissiveSchemaRegistry;

#[async_trait]
impl SchemaRegistry for PermissiveSchemaRegistry {
    async fn validate(&self, _gid: &str, _cid: &str, _arguments: &Value) -> Result<()> {
        Ok(())
    }
}

/// Minimal bundled registry: each known (gid, cid) pair declares the
/// argument keys that must be present as a JSON object. Unknown algorithms
/// are rejected.
#[derive(Debug, Default)]
pub struct StaticSchemaRegistry {
    required: HashMap<(String, String), Vec<String>>,
}

impl StaticSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(
        mut self,
        gid: impl Into<String>,
        cid: impl Into<String>,
        required_keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.required.insert(
            (gid.into(), cid.into()),
            required_keys.into_iter().map(Into::into).collect(),
        );
        self
    }
}

#[async_trait]
impl SchemaRegistry for StaticSchemaRegistry {
    async fn validate(&self, gid: &str, cid: &str, arguments: &Value) -> Result<()> {
        let required = self
            .required
            .get(&(gid.to_string(), cid.to_string()))
            .ok_or_else(|| Error::Validation {
                gid: gid.to_string(),
                cid: cid.to_string(),
                message: "unknown algorithm".to_string(),
            })?;

        let obj = arguments.as_object().ok_or_else(|| Error::Validation {
            gid: gid.to_string(),
            cid: cid.to_string(),
            message: "arguments must be a JSON object".to_string(),
        })?;

        for key in required {
            if !obj.contains_key(key) {
                return Err(Error::Validation {
                    gid: gid.to_string(),
                    cid: cid.to_string(),
                    message: format!("missing required argument '{key}'"),
                });
            }
        }
        Ok(())
    }
}
