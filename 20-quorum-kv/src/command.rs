use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Mutations recorded in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    SetValue { key: String, value: String },
}

impl Command {
    pub fn set_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::SetValue {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
