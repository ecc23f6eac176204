//! User preferences as read by the window calculator

use serde::{Deserialize, Serialize};

use super::Document;

/// Study pace chosen by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pace {
    #[default]
    OneChapter,
    SederPerYear,
    TwoMishna,
}

impl Pace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneChapter => "one_chapter",
            Self::SederPerYear => "seder_per_year",
            Self::TwoMishna => "two_mishna",
        }
    }

    /// Parse a stored pace, falling back to the default for unknown values.
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("seder_per_year") => Self::SederPerYear,
            Some("two_mishna") => Self::TwoMishna,
            _ => Self::OneChapter,
        }
    }
}

/// Position and pace extracted from the local preferences document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preferences {
    pub position: u64,
    pub pace: Pace,
}

impl Preferences {
    pub const POSITION_FIELD: &'static str = "current_content_index";
    pub const PACE_FIELD: &'static str = "pace";

    /// Read preferences from a document; a missing document means a new user at position 0.
    pub fn from_document(doc: Option<&Document>) -> Self {
        let Some(doc) = doc.filter(|doc| !doc.deleted) else {
            return Self::default();
        };
        let position = doc
            .int_field(Self::POSITION_FIELD)
            .and_then(|value| u64::try_from(value).ok())
            .unwrap_or(0);
        Self {
            position,
            pace: Pace::parse_lenient(doc.str_field(Self::PACE_FIELD)),
        }
    }
}
