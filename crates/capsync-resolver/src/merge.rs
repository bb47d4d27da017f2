use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSide {
    Local,
    Server,
}

impl MergeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeSide::Local => "local",
            MergeSide::Server => "server",
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{} payload is not a JSON object", side.as_str())]
    NotAnObject { side: MergeSide },
    #[error("merge rejected: {0}")]
    Rejected(String),
}

/// Combines the local and server payloads of a conflict into the payload that
/// is written locally and pushed again.
pub trait PayloadMerger {
    fn merge(&self, local: &Value, server: &Value) -> Result<Value, MergeError>;
}

impl<F> PayloadMerger for F
where
    F: Fn(&Value, &Value) -> Result<Value, MergeError>,
{
    fn merge(&self, local: &Value, server: &Value) -> Result<Value, MergeError> {
        self(local, server)
    }
}

/// Field-by-field merge of two JSON objects. A key present on one side only
/// is kept; a key on both sides takes the value from its override side, else
/// from the default side. A `null` server payload (deleted remotely) keeps the
/// local payload whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMerge {
    default_side: MergeSide,
    overrides: BTreeMap<String, MergeSide>,
}

impl FieldMerge {
    pub fn prefer(side: MergeSide) -> Self {
        Self {
            default_side: side,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: &str, side: MergeSide) -> Self {
        self.overrides.insert(field.to_string(), side);
        self
    }

    fn side_for(&self, field: &str) -> MergeSide {
        self.overrides
            .get(field)
            .copied()
            .unwrap_or(self.default_side)
    }
}

impl PayloadMerger for FieldMerge {
    fn merge(&self, local: &Value, server: &Value) -> Result<Value, MergeError> {
        if server.is_null() {
            return Ok(local.clone());
        }
        let local_fields = local.as_object().ok_or(MergeError::NotAnObject {
            side: MergeSide::Local,
        })?;
        let server_fields = server.as_object().ok_or(MergeError::NotAnObject {
            side: MergeSide::Server,
        })?;

        let mut merged = Map::new();
        for (key, value) in local_fields {
            let chosen = match (server_fields.get(key), self.side_for(key)) {
                (Some(server_value), MergeSide::Server) => server_value,
                _ => value,
            };
            merged.insert(key.clone(), chosen.clone());
        }
        for (key, value) in server_fields {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::Object(merged))
    }
}
