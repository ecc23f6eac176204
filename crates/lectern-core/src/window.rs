//! Sync window calculation.
//!
//! Pure functions deciding which remote rows a collection mirrors. Date
//! windows slide with the calendar; position windows follow the user's
//! progress as read from the local preferences document.

use chrono::{Days, NaiveDate};
use serde_json::Value;

use crate::config::{PositionBand, SyncConfig};
use crate::models::{Document, Preferences};
use crate::remote::Filter;
use crate::schema::WindowSpec;

/// Inputs shared by every collection's window in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReference {
    pub today: NaiveDate,
    pub preferences: Preferences,
}

/// The bounded subset of remote rows a collection mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    Unbounded,
    Date {
        field: &'static str,
        start: NaiveDate,
        end: NaiveDate,
    },
    Position {
        field: &'static str,
        start: u64,
        end: u64,
    },
}

/// `[today - days, today + days]`
pub fn date_bounds(today: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let span = Days::new(u64::from(days));
    (
        today.checked_sub_days(span).unwrap_or(NaiveDate::MIN),
        today.checked_add_days(span).unwrap_or(NaiveDate::MAX),
    )
}

/// `[max(0, position - back), position + ahead]`
pub const fn position_bounds(position: u64, band: PositionBand) -> (u64, u64) {
    (
        position.saturating_sub(band.back),
        position.saturating_add(band.ahead),
    )
}

/// Compute a collection's window for this cycle.
pub fn compute_window(spec: WindowSpec, reference: &WindowReference, config: &SyncConfig) -> Window {
    match spec {
        WindowSpec::Unbounded => Window::Unbounded,
        WindowSpec::Date { field } => {
            let (start, end) = date_bounds(reference.today, config.date_window_days);
            Window::Date { field, start, end }
        }
        WindowSpec::Position { field } => {
            let band = config.band_for(reference.preferences.pace);
            let (start, end) = position_bounds(reference.preferences.position, band);
            Window::Position { field, start, end }
        }
    }
}

impl Window {
    /// Stable fingerprint stored alongside the checkpoint.
    pub fn key(&self) -> String {
        match self {
            Self::Unbounded => "all".to_string(),
            Self::Date { field, start, end } => format!("date:{field}:{start}..={end}"),
            Self::Position { field, start, end } => format!("position:{field}:{start}..={end}"),
        }
    }

    /// Predicates that bound the remote query.
    pub fn bounds_for_query(&self) -> Vec<Filter> {
        match self {
            Self::Unbounded => Vec::new(),
            Self::Date { field, start, end } => vec![
                Filter::gte(*field, start.to_string()),
                Filter::lte(*field, end.to_string()),
            ],
            Self::Position { field, start, end } => vec![
                Filter::gte(*field, *start),
                Filter::lte(*field, *end),
            ],
        }
    }

    /// Whether a key value lies inside the window.
    ///
    /// Values that cannot be interpreted are treated as inside so they are
    /// never pruned on a guess.
    pub fn contains_value(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Date { start, end, .. } => value
                .and_then(Value::as_str)
                .and_then(|text| text.get(..10))
                .and_then(|text| text.parse::<NaiveDate>().ok())
                .map_or(true, |date| (*start..=*end).contains(&date)),
            Self::Position { start, end, .. } => value
                .and_then(|value| match value {
                    Value::Number(number) => number.as_i64(),
                    Value::String(text) => text.trim().parse().ok(),
                    _ => None,
                })
                .map_or(true, |index| {
                    u64::try_from(index).is_ok_and(|index| (*start..=*end).contains(&index))
                }),
        }
    }

    /// Whether a local document lies inside the window.
    pub fn contains(&self, doc: &Document) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Date { field, .. } | Self::Position { field, .. } => {
                self.contains_value(doc.payload.get(*field))
            }
        }
    }

    /// Position range, for position windows.
    pub const fn positions(&self) -> Option<(u64, u64)> {
        match self {
            Self::Position { start, end, .. } => Some((*start, *end)),
            _ => None,
        }
    }
}
