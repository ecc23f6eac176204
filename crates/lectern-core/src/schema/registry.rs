//! Static per-collection schema registry.

use crate::{Error, Result};

/// How a field travels between the local store and the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Replicated in both directions
    Synced,
    /// Kept on the device only; never pushed, stripped if pulled
    LocalOnly,
    /// Set by the server; pulled but never sent on update
    ServerManaged,
}

/// Type coercion applied when crossing the local/remote boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    None,
    /// Remote boolean stored locally as `0`/`1`
    BoolAsInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub rule: FieldRule,
    pub coercion: Coercion,
    /// Keep explicit nulls instead of dropping the field
    pub nullable: bool,
}

impl FieldSpec {
    pub const fn synced(name: &'static str) -> Self {
        Self {
            name,
            rule: FieldRule::Synced,
            coercion: Coercion::None,
            nullable: false,
        }
    }

    pub const fn local_only(name: &'static str) -> Self {
        Self {
            rule: FieldRule::LocalOnly,
            ..Self::synced(name)
        }
    }

    pub const fn server_managed(name: &'static str) -> Self {
        Self {
            rule: FieldRule::ServerManaged,
            ..Self::synced(name)
        }
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub const fn bool_as_int(mut self) -> Self {
        self.coercion = Coercion::BoolAsInt;
        self
    }
}

/// Which rows of a collection the principal may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Rows owned by the principal, matched on this field
    Owner { field: &'static str },
    /// Readable by every authenticated principal
    Broadcast,
}

/// Which subset of a collection is mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Mirror every visible row
    Unbounded,
    /// `YYYY-MM-DD` field within a band around today
    Date { field: &'static str },
    /// Integer field within a band around the user's position
    Position { field: &'static str },
}

/// How updates are applied remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Update only if the remote `updated_at` still matches the assumed one
    Conditional,
    /// Last writer wins
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: &'static str,
    pub scope: Scope,
    pub window: WindowSpec,
    pub read_only: bool,
    pub write_policy: WritePolicy,
    /// Overrides the configured pull page size
    pub page_size: Option<usize>,
    /// Fields with non-default handling; unlisted fields are synced as-is
    pub fields: &'static [FieldSpec],
    /// Payload field whose absence marks a content gap
    pub gap_field: Option<&'static str>,
}

impl CollectionSchema {
    pub const ID_FIELD: &'static str = "id";
    pub const MODIFIED_FIELD: &'static str = "updated_at";
    pub const CREATED_FIELD: &'static str = "created_at";

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Rule for a field, treating the timestamps as server-managed.
    pub fn rule(&self, name: &str) -> FieldRule {
        match self.field(name) {
            Some(field) => field.rule,
            None if name == Self::MODIFIED_FIELD || name == Self::CREATED_FIELD => {
                FieldRule::ServerManaged
            }
            None => FieldRule::Synced,
        }
    }

    pub fn is_nullable(&self, name: &str) -> bool {
        self.field(name).is_some_and(|field| field.nullable)
    }

    pub fn coercion(&self, name: &str) -> Coercion {
        self.field(name).map_or(Coercion::None, |field| field.coercion)
    }

    pub const fn is_windowed(&self) -> bool {
        !matches!(self.window, WindowSpec::Unbounded)
    }

    pub fn page_size(&self, default: usize) -> usize {
        self.page_size.unwrap_or(default).max(1)
    }
}

pub const USER_PREFERENCES: &str = "user_preferences";
pub const LEARNING_PATH: &str = "learning_path";
pub const USER_STUDY_LOG: &str = "user_study_log";
pub const CONTENT_CACHE: &str = "content_cache";
pub const QUIZ_QUESTIONS: &str = "quiz_questions";
pub const TRACKS: &str = "tracks";

const OWNER: Scope = Scope::Owner { field: "user_id" };

/// Every replicated collection.
pub static COLLECTIONS: &[CollectionSchema] = &[
    CollectionSchema {
        name: USER_PREFERENCES,
        scope: OWNER,
        window: WindowSpec::Unbounded,
        read_only: false,
        write_policy: WritePolicy::Conditional,
        page_size: None,
        fields: &[
            FieldSpec::local_only("yom_tov_dates"),
            FieldSpec::local_only("yom_tov_dates_until"),
            FieldSpec::synced("content_ref").nullable(),
        ],
        gap_field: None,
    },
    CollectionSchema {
        name: LEARNING_PATH,
        scope: OWNER,
        window: WindowSpec::Position { field: "node_index" },
        read_only: false,
        write_policy: WritePolicy::Conditional,
        page_size: Some(200),
        fields: &[
            FieldSpec::synced("is_divider").bool_as_int(),
            FieldSpec::synced("completed_at").nullable(),
            FieldSpec::synced("content_ref").nullable(),
            FieldSpec::synced("review_of_node_id").nullable(),
        ],
        gap_field: None,
    },
    CollectionSchema {
        name: USER_STUDY_LOG,
        scope: OWNER,
        window: WindowSpec::Date {
            field: "study_date",
        },
        read_only: false,
        write_policy: WritePolicy::Conditional,
        page_size: None,
        fields: &[
            FieldSpec::synced("is_completed").bool_as_int(),
            FieldSpec::synced("completed_at").nullable(),
            FieldSpec::synced("content_ref").nullable(),
        ],
        gap_field: None,
    },
    CollectionSchema {
        name: CONTENT_CACHE,
        scope: Scope::Broadcast,
        window: WindowSpec::Position {
            field: "content_index",
        },
        read_only: true,
        write_policy: WritePolicy::Conditional,
        page_size: None,
        fields: &[
            FieldSpec::synced("tractate").nullable(),
            FieldSpec::synced("chapter").nullable(),
        ],
        gap_field: Some("ai_explanation_json"),
    },
    CollectionSchema {
        name: QUIZ_QUESTIONS,
        scope: Scope::Broadcast,
        window: WindowSpec::Position {
            field: "content_index",
        },
        read_only: true,
        write_policy: WritePolicy::Conditional,
        page_size: None,
        fields: &[FieldSpec::synced("explanation").nullable()],
        gap_field: None,
    },
    CollectionSchema {
        name: TRACKS,
        scope: Scope::Broadcast,
        window: WindowSpec::Unbounded,
        read_only: true,
        write_policy: WritePolicy::Conditional,
        page_size: None,
        fields: &[],
        gap_field: None,
    },
];

/// Look up a registered collection.
pub fn collection(name: &str) -> Result<&'static CollectionSchema> {
    COLLECTIONS
        .iter()
        .find(|schema| schema.name == name)
        .ok_or_else(|| Error::UnknownCollection(name.to_string()))
}
