use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Items of one kind, keyed by item id.
///
/// Ordered so that serializing the same content always yields the same bytes,
/// which keeps content-derived version tags stable.
pub type ItemMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Session,
    Speaker,
    Video,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Session, ItemKind::Speaker, ItemKind::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Session => "sessions",
            ItemKind::Speaker => "speakers",
            ItemKind::Video => "videos",
        }
    }
}

/// Dataset payload: one mapping per item kind.
///
/// Used both for full snapshots and for change-log deltas. In a delta an
/// absent item means "unchanged"; deltas never carry deletions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(default)]
    pub sessions: ItemMap,
    #[serde(default)]
    pub speakers: ItemMap,
    #[serde(default)]
    pub videos: ItemMap,
}

impl DataPayload {
    pub fn items(&self, kind: ItemKind) -> &ItemMap {
        match kind {
            ItemKind::Session => &self.sessions,
            ItemKind::Speaker => &self.speakers,
            ItemKind::Video => &self.videos,
        }
    }

    pub fn items_mut(&mut self, kind: ItemKind) -> &mut ItemMap {
        match kind {
            ItemKind::Session => &mut self.sessions,
            ItemKind::Speaker => &mut self.speakers,
            ItemKind::Video => &mut self.videos,
        }
    }

    /// Total number of items across all kinds.
    pub fn len(&self) -> usize {
        self.sessions.len() + self.speakers.len() + self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds a newer payload into this one. For an id present in both, the
    /// value from `newer` wins.
    pub fn merge_from(&mut self, newer: DataPayload) {
        let DataPayload {
            sessions,
            speakers,
            videos,
        } = newer;
        self.sessions.extend(sessions);
        self.speakers.extend(speakers);
        self.videos.extend(videos);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Hex SHA-256 of serialized content, used as an opaque version tag.
pub fn content_tag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
