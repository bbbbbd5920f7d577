//! Encoding of change events for the bus.

use crate::error::Result;
use crate::events::MutationEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    MessagePack,
    Json,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec {
    format: WireFormat,
}

impl WireCodec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn encode(&self, event: &MutationEvent) -> Result<Vec<u8>> {
        Ok(match self.format {
            // Named fields keep the short tags on the wire.
            WireFormat::MessagePack => rmp_serde::to_vec_named(event)?,
            WireFormat::Json => serde_json::to_vec(event)?,
        })
    }

    pub fn decode(&self, payload: &[u8]) -> Result<MutationEvent> {
        Ok(match self.format {
            WireFormat::MessagePack => rmp_serde::from_slice(payload)?,
            WireFormat::Json => serde_json::from_slice(payload)
                .map_err(|e| crate::error::SyncError::Deserialization(e.to_string()))?,
        })
    }
}
