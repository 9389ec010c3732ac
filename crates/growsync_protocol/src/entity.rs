//! The entity registry.
//!
//! Every synced table is a variant of [`EntityKind`]. Names arriving from
//! clients are parsed once through [`EntityKind::from_name`]; everything
//! downstream dispatches on the enum.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Longest entity name accepted from the wire.
const MAX_NAME_LEN: usize = 63;

/// A synced entity (one server table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    /// User profiles.
    Profiles,
    /// Tracked plants.
    Plants,
    /// Grow journals.
    GrowJournals,
    /// Entries inside a grow journal.
    JournalEntries,
    /// Grow locations (tents, rooms, outdoor plots).
    GrowLocations,
    /// Per-plant diary entries.
    DiaryEntries,
    /// Scheduled plant care tasks.
    PlantTasks,
    /// Social feed posts.
    Posts,
    /// Comments on posts.
    PostComments,
    /// Likes on posts.
    PostLikes,
}

/// Static description of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySpec {
    /// The entity.
    pub kind: EntityKind,
    /// Table name used on the wire.
    pub table: &'static str,
    /// Tombstone shadow table, if the entity supports deletion.
    pub tombstone_table: Option<&'static str>,
    /// Columns cleared when a pull excludes media.
    pub media_columns: &'static [&'static str],
}

/// All synced entities in registry order.
pub const ENTITY_REGISTRY: [EntitySpec; 10] = [
    EntitySpec {
        kind: EntityKind::Profiles,
        table: "profiles",
        tombstone_table: None,
        media_columns: &["avatar_url"],
    },
    EntitySpec {
        kind: EntityKind::Plants,
        table: "plants",
        tombstone_table: Some("plants_deleted"),
        media_columns: &["image_url"],
    },
    EntitySpec {
        kind: EntityKind::GrowJournals,
        table: "grow_journals",
        tombstone_table: Some("grow_journals_deleted"),
        media_columns: &["cover_image_url"],
    },
    EntitySpec {
        kind: EntityKind::JournalEntries,
        table: "journal_entries",
        tombstone_table: Some("journal_entries_deleted"),
        media_columns: &["media_urls"],
    },
    EntitySpec {
        kind: EntityKind::GrowLocations,
        table: "grow_locations",
        tombstone_table: Some("grow_locations_deleted"),
        media_columns: &[],
    },
    EntitySpec {
        kind: EntityKind::DiaryEntries,
        table: "diary_entries",
        tombstone_table: Some("diary_entries_deleted"),
        media_columns: &["image_urls"],
    },
    EntitySpec {
        kind: EntityKind::PlantTasks,
        table: "plant_tasks",
        tombstone_table: Some("plant_tasks_deleted"),
        media_columns: &[],
    },
    EntitySpec {
        kind: EntityKind::Posts,
        table: "posts",
        tombstone_table: Some("posts_deleted"),
        media_columns: &["image_url"],
    },
    EntitySpec {
        kind: EntityKind::PostComments,
        table: "post_comments",
        tombstone_table: Some("post_comments_deleted"),
        media_columns: &[],
    },
    EntitySpec {
        kind: EntityKind::PostLikes,
        table: "post_likes",
        tombstone_table: Some("post_likes_deleted"),
        media_columns: &[],
    },
];

impl EntityKind {
    /// Every entity, in registry order.
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Profiles,
        EntityKind::Plants,
        EntityKind::GrowJournals,
        EntityKind::JournalEntries,
        EntityKind::GrowLocations,
        EntityKind::DiaryEntries,
        EntityKind::PlantTasks,
        EntityKind::Posts,
        EntityKind::PostComments,
        EntityKind::PostLikes,
    ];

    /// Parses an untrusted entity name.
    ///
    /// The name is checked against `[a-zA-Z0-9_]{1,63}` before the registry
    /// lookup, so a rejected name never reaches anything but this function.
    pub fn from_name(name: &str) -> ProtocolResult<Self> {
        let well_formed = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if !well_formed {
            return Err(ProtocolError::InvalidEntityName(name.to_string()));
        }

        ENTITY_REGISTRY
            .iter()
            .find(|spec| spec.table == name)
            .map(|spec| spec.kind)
            .ok_or_else(|| ProtocolError::UnknownEntity(name.to_string()))
    }

    /// Returns the registry entry.
    pub fn spec(self) -> &'static EntitySpec {
        // Registry order matches declaration order.
        &ENTITY_REGISTRY[self as usize]
    }

    /// Returns the wire/table name.
    pub fn table_name(self) -> &'static str {
        self.spec().table
    }

    /// Returns the tombstone table name, if deletions are synced.
    pub fn tombstone_table(self) -> Option<&'static str> {
        self.spec().tombstone_table
    }

    /// Returns true if the entity has a tombstone shadow table.
    pub fn has_tombstones(self) -> bool {
        self.spec().tombstone_table.is_some()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.table_name())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        EntityKind::from_name(&name).map_err(serde::de::Error::custom)
    }
}
