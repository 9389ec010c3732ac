//! Typed rows for every synced entity.
//!
//! Each struct carries the columns the sync protocol reasons about (`id`,
//! `user_id`, `created_at`, `updated_at`) plus the entity's business fields.
//! Unknown fields in incoming payloads are ignored; absent optional fields
//! take their defaults.

use crate::entity::EntityKind;
use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Public handle.
    pub username: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Short biography.
    #[serde(default)]
    pub bio: Option<String>,
    /// Avatar image location.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl ProfileRow {
    /// Creates a profile row.
    pub fn new(id: Uuid, user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            username: username.into(),
            display_name: None,
            bio: None,
            avatar_url: None,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }
}

/// A tracked plant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlantRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Plant name.
    pub name: String,
    /// Strain name.
    #[serde(default)]
    pub strain: Option<String>,
    /// Growth stage (seedling, vegetative, flowering, ...).
    #[serde(default)]
    pub growth_stage: Option<String>,
    /// Where the plant lives.
    #[serde(default)]
    pub location_id: Option<Uuid>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Photo location.
    #[serde(default)]
    pub image_url: Option<String>,
    /// When the plant was started.
    #[serde(default)]
    pub planted_at: Option<Timestamp>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl PlantRow {
    /// Creates a plant row.
    pub fn new(id: Uuid, user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            name: name.into(),
            strain: None,
            growth_stage: None,
            location_id: None,
            notes: None,
            image_url: None,
            planted_at: None,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }
}

/// A grow journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowJournalRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Plant the journal follows.
    #[serde(default)]
    pub plant_id: Option<Uuid>,
    /// Journal title.
    pub title: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether other users can read the journal.
    #[serde(default)]
    pub is_public: bool,
    /// Cover image location.
    #[serde(default)]
    pub cover_image_url: Option<String>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// An entry in a grow journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Parent journal.
    pub journal_id: Uuid,
    /// Entry type (note, watering, feeding, ...).
    pub entry_type: String,
    /// Entry body.
    #[serde(default)]
    pub content: Option<String>,
    /// Attached media locations.
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// A grow location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowLocationRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Location name.
    pub name: String,
    /// Indoor, outdoor or greenhouse.
    #[serde(default)]
    pub environment: Option<String>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// A per-plant diary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiaryEntryRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Plant the entry belongs to.
    pub plant_id: Uuid,
    /// Entry type.
    pub entry_type: String,
    /// Entry body.
    #[serde(default)]
    pub content: Option<String>,
    /// Attached photo locations.
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// A scheduled plant care task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlantTaskRow {
    /// Row id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Plant the task is for.
    pub plant_id: Uuid,
    /// Task title.
    pub title: String,
    /// Task type (water, feed, train, ...).
    #[serde(default)]
    pub task_type: Option<String>,
    /// Due date.
    #[serde(default)]
    pub due_at: Option<Timestamp>,
    /// Whether the task is done.
    #[serde(default)]
    pub is_completed: bool,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// A social feed post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRow {
    /// Row id.
    pub id: Uuid,
    /// Author.
    pub user_id: Uuid,
    /// Post body.
    pub content: String,
    /// Attached image location.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Plant the post is about.
    #[serde(default)]
    pub plant_id: Option<Uuid>,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl PostRow {
    /// Creates a post row.
    pub fn new(id: Uuid, user_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            content: content.into(),
            image_url: None,
            plant_id: None,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }
}

/// A comment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCommentRow {
    /// Row id.
    pub id: Uuid,
    /// Author.
    pub user_id: Uuid,
    /// Commented post.
    pub post_id: Uuid,
    /// Comment body.
    pub content: String,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

/// A like on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostLikeRow {
    /// Row id.
    pub id: Uuid,
    /// User who liked.
    pub user_id: Uuid,
    /// Liked post.
    pub post_id: Uuid,
    /// Creation stamp.
    #[serde(default)]
    pub created_at: Timestamp,
    /// Last modification stamp.
    #[serde(default)]
    pub updated_at: Timestamp,
}

macro_rules! define_records {
    ($($variant:ident($row:ident) [$($media:ident),*]),* $(,)?) => {
        /// A row of any synced entity.
        ///
        /// Serializes as the bare row; decoding needs the [`EntityKind`]
        /// of the bucket the row came from (see [`Record::from_value`]).
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        #[serde(untagged)]
        pub enum Record {
            $(
                #[doc = concat!("A `", stringify!($row), "`.")]
                $variant($row),
            )*
        }

        impl Record {
            /// Returns the entity this row belongs to.
            pub fn kind(&self) -> EntityKind {
                match self {
                    $(Record::$variant(_) => EntityKind::$variant,)*
                }
            }

            /// Returns the row id.
            pub fn id(&self) -> Uuid {
                match self {
                    $(Record::$variant(row) => row.id,)*
                }
            }

            /// Returns the owner.
            pub fn user_id(&self) -> Uuid {
                match self {
                    $(Record::$variant(row) => row.user_id,)*
                }
            }

            /// Returns the creation stamp.
            pub fn created_at(&self) -> Timestamp {
                match self {
                    $(Record::$variant(row) => row.created_at,)*
                }
            }

            /// Returns the last modification stamp.
            pub fn updated_at(&self) -> Timestamp {
                match self {
                    $(Record::$variant(row) => row.updated_at,)*
                }
            }

            /// Overwrites both stamps.
            pub fn stamp(&mut self, created_at: Timestamp, updated_at: Timestamp) {
                match self {
                    $(Record::$variant(row) => {
                        row.created_at = created_at;
                        row.updated_at = updated_at;
                    })*
                }
            }

            /// Clears the entity's media columns. Identity and stamps are untouched.
            #[allow(unused_variables)]
            pub fn strip_media(&mut self) {
                match self {
                    $(Record::$variant(row) => {
                        $(row.$media = Default::default();)*
                    })*
                }
            }

            /// Copies the media columns of `other` when both rows are the same entity.
            #[allow(unused_variables)]
            pub fn copy_media_from(&mut self, other: &Record) {
                match (self, other) {
                    $((Record::$variant(row), Record::$variant(from)) => {
                        $(row.$media = from.$media.clone();)*
                    })*
                    _ => {}
                }
            }

            /// Decodes a raw CBOR row into the schema of `kind`.
            pub fn from_value(kind: EntityKind, value: &ciborium::Value) -> ProtocolResult<Self> {
                let decoded = match kind {
                    $(EntityKind::$variant => value.deserialized::<$row>().map(Record::$variant),)*
                };
                decoded.map_err(|e| ProtocolError::MalformedRow {
                    entity: kind.table_name(),
                    reason: e.to_string(),
                })
            }

            /// Encodes the row as a raw CBOR value.
            pub fn to_value(&self) -> ProtocolResult<ciborium::Value> {
                ciborium::Value::serialized(self).map_err(|e| ProtocolError::Codec(e.to_string()))
            }

            #[cfg(test)]
            fn media_fields(kind: EntityKind) -> &'static [&'static str] {
                match kind {
                    $(EntityKind::$variant => &[$(stringify!($media)),*],)*
                }
            }
        }

        $(
            impl From<$row> for Record {
                fn from(row: $row) -> Self {
                    Record::$variant(row)
                }
            }
        )*
    };
}

define_records! {
    Profiles(ProfileRow) [avatar_url],
    Plants(PlantRow) [image_url],
    GrowJournals(GrowJournalRow) [cover_image_url],
    JournalEntries(JournalEntryRow) [media_urls],
    GrowLocations(GrowLocationRow) [],
    DiaryEntries(DiaryEntryRow) [image_urls],
    PlantTasks(PlantTaskRow) [],
    Posts(PostRow) [image_url],
    PostComments(PostCommentRow) [],
    PostLikes(PostLikeRow) [],
}
