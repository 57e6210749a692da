use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::StreamId;
use crate::error::{OverlayError, OverlayResult};

/// Provisioning state of a stream. Anything other than `Ready` found at
/// open time is the residue of an interrupted create or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Creating,
    Ready,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub stream_id: StreamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Size the stream was provisioned with; drives its shared-log quota.
    pub nominal_size: u64,
    pub state: StreamState,
}

/// Persisted table of the streams in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub format: u32,
    pub streams: Vec<CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            format: Self::FORMAT,
            streams: Vec::new(),
        }
    }
}

impl Catalog {
    pub const FORMAT: u32 = 1;

    /// An empty blob is a fresh container.
    pub fn decode(blob: &[u8]) -> OverlayResult<Self> {
        if blob.is_empty() {
            return Ok(Self::default());
        }
        let catalog: Catalog = serde_json::from_slice(blob).map_err(|err| {
            OverlayError::ContainerCorrupted(format!("unreadable stream catalog: {err}"))
        })?;
        if catalog.format != Self::FORMAT {
            return Err(OverlayError::ContainerCorrupted(format!(
                "unsupported catalog format {}",
                catalog.format
            )));
        }
        Ok(catalog)
    }

    pub fn encode(&self) -> OverlayResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| OverlayError::invalid_state(format!("catalog encode failed: {err}")))
    }

    pub fn entry(&self, stream_id: StreamId) -> Option<&CatalogEntry> {
        self.streams.iter().find(|entry| entry.stream_id == stream_id)
    }

    pub fn entry_mut(&mut self, stream_id: StreamId) -> Option<&mut CatalogEntry> {
        self.streams
            .iter_mut()
            .find(|entry| entry.stream_id == stream_id)
    }

    pub fn upsert(&mut self, entry: CatalogEntry) {
        match self.entry_mut(entry.stream_id) {
            Some(existing) => *existing = entry,
            None => {
                self.streams.push(entry);
                self.streams.sort_by_key(|entry| entry.stream_id);
            }
        }
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<CatalogEntry> {
        let index = self
            .streams
            .iter()
            .position(|entry| entry.stream_id == stream_id)?;
        Some(self.streams.remove(index))
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<StreamId> {
        self.streams
            .iter()
            .find(|entry| entry.alias.as_deref() == Some(alias))
            .map(|entry| entry.stream_id)
    }

    /// Entries left behind by an interrupted create or delete.
    pub fn partial_entries(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|entry| entry.state != StreamState::Ready)
            .map(|entry| entry.stream_id)
            .collect()
    }

    pub fn nominal_sizes(&self) -> impl Iterator<Item = (StreamId, u64)> + '_ {
        self.streams
            .iter()
            .filter(|entry| entry.state == StreamState::Ready)
            .map(|entry| (entry.stream_id, entry.nominal_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, alias: Option<&str>, state: StreamState) -> CatalogEntry {
        CatalogEntry {
            stream_id: StreamId::new(id),
            alias: alias.map(str::to_string),
            nominal_size: id * 100,
            state,
        }
    }

    #[test]
    fn catalog_survives_encoding() {
        let mut catalog = Catalog::default();
        catalog.upsert(entry(2, Some("logs"), StreamState::Ready));
        catalog.upsert(entry(1, None, StreamState::Creating));
        let decoded = Catalog::decode(&catalog.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, catalog);
        assert_eq!(decoded.streams[0].stream_id, StreamId::new(1));
        assert_eq!(decoded.resolve_alias("logs"), Some(StreamId::new(2)));
        assert_eq!(decoded.partial_entries(), vec![StreamId::new(1)]);
        let sizes: Vec<_> = decoded.nominal_sizes().collect();
        assert_eq!(sizes, vec![(StreamId::new(2), 200)]);
    }

    #[test]
    fn garbage_is_a_corrupted_container() {
        assert!(matches!(
            Catalog::decode(b"{not json"),
            Err(OverlayError::ContainerCorrupted(_))
        ));
        assert!(matches!(
            Catalog::decode(br#"{"format":9,"streams":[]}"#),
            Err(OverlayError::ContainerCorrupted(_))
        ));
        assert_eq!(Catalog::decode(b"").expect("fresh"), Catalog::default());
    }
}
