//! Query-parameter filters over the rotation.
//!
//! Four parameters are recognised and always evaluated in the same order:
//! `max-age`, `after`, `before`, `speaker`. `max-age` and `after` share the
//! `After` slot, so an explicit `after` replaces a `max-age` cutoff.
//!
//! A [`Fingerprint`] is the sha256 of the rendered `after`, `before` and
//! `speaker` fragments concatenated in that order (missing ones are empty).
//! It identifies the effective filter, not the query string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, Duration};

use crate::calendar::{iso_date, parse_us_date};
use crate::{QuoteStore, RotationSeq, WallError};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterParam {
    MaxAge,
    After,
    Before,
    Speaker,
}

impl FilterParam {
    /// Evaluation order. Later entries win when they share a slot.
    pub const ORDERED: [Self; 4] = [Self::MaxAge, Self::After, Self::Before, Self::Speaker];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxAge => "max-age",
            Self::After => "after",
            Self::Before => "before",
            Self::Speaker => "speaker",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "max-age" => Some(Self::MaxAge),
            "after" => Some(Self::After),
            "before" => Some(Self::Before),
            "speaker" => Some(Self::Speaker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterSlot {
    After,
    Before,
    Speaker,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FilterParamError {
    #[error("expected a date formatted MM/DD/YYYY, got {0:?}")]
    InvalidDate(String),
    #[error("expected a whole number of days, got {0:?}")]
    InvalidInteger(String),
    #[error("max-age of {0} days reaches past the calendar")]
    OutOfRange(i64),
    #[error("speaker filter is empty")]
    EmptySpeaker,
}

/// One store-query condition. `clause` carries a single `?` placeholder bound
/// to `value`; [`Condition::rendered`] inlines the value as a SQL literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    slot: FilterSlot,
    clause: &'static str,
    value: String,
}

impl Condition {
    #[must_use]
    pub fn said_on_or_after(day: Date) -> Self {
        Self { slot: FilterSlot::After, clause: "q.said_on >= ?", value: iso_date(day) }
    }

    #[must_use]
    pub fn said_on_or_before(day: Date) -> Self {
        Self { slot: FilterSlot::Before, clause: "q.said_on <= ?", value: iso_date(day) }
    }

    /// `LIKE` match anywhere in the author's name.
    #[must_use]
    pub fn speaker_contains(fragment: &str) -> Self {
        Self { slot: FilterSlot::Speaker, clause: "a.name LIKE ?", value: format!("%{fragment}%") }
    }

    #[must_use]
    pub fn slot(&self) -> FilterSlot {
        self.slot
    }

    #[must_use]
    pub fn clause(&self) -> &'static str {
        self.clause
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn rendered(&self) -> String {
        let literal = format!("'{}'", self.value.replace('\'', "''"));
        self.clause.replacen('?', &literal, 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParam {
    pub param: FilterParam,
    pub raw: String,
    pub outcome: Result<Condition, FilterParamError>,
}

/// Parse every recognised parameter, keeping failures so the caller decides
/// what to do with them. Only the first occurrence of a name counts; the
/// result is in [`FilterParam::ORDERED`] order.
#[must_use]
pub fn parse_filter_params(params: &[(String, String)], today: Date) -> Vec<ParsedParam> {
    let mut first = BTreeMap::new();
    for (name, value) in params {
        if let Some(param) = FilterParam::parse(name) {
            first.entry(param).or_insert(value.as_str());
        }
    }

    FilterParam::ORDERED
        .iter()
        .filter_map(|param| {
            let raw = *first.get(param)?;
            Some(ParsedParam {
                param: *param,
                raw: raw.to_string(),
                outcome: parse_one(*param, raw, today),
            })
        })
        .collect()
}

fn parse_one(param: FilterParam, raw: &str, today: Date) -> Result<Condition, FilterParamError> {
    match param {
        FilterParam::MaxAge => {
            let days: i64 = raw
                .trim()
                .parse()
                .map_err(|_| FilterParamError::InvalidInteger(raw.to_string()))?;
            let days = days.max(0);
            let cutoff = days
                .checked_mul(SECONDS_PER_DAY)
                .and_then(|seconds| today.checked_sub(Duration::seconds(seconds)))
                .ok_or(FilterParamError::OutOfRange(days))?;
            Ok(Condition::said_on_or_after(cutoff))
        }
        FilterParam::After => parse_us_date(raw)
            .map(Condition::said_on_or_after)
            .ok_or_else(|| FilterParamError::InvalidDate(raw.to_string())),
        FilterParam::Before => parse_us_date(raw)
            .map(Condition::said_on_or_before)
            .ok_or_else(|| FilterParamError::InvalidDate(raw.to_string())),
        FilterParam::Speaker => {
            if raw.trim().is_empty() {
                Err(FilterParamError::EmptySpeaker)
            } else {
                Ok(Condition::speaker_contains(raw.trim()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    after: Option<Condition>,
    before: Option<Condition>,
    speaker: Option<Condition>,
}

impl FilterSet {
    /// Apply the successfully parsed parameters in order; failed ones are skipped.
    #[must_use]
    pub fn from_parsed(parsed: &[ParsedParam]) -> Self {
        let mut set = Self::default();
        for param in parsed {
            if let Ok(condition) = &param.outcome {
                set.insert(condition.clone());
            }
        }
        set
    }

    pub fn insert(&mut self, condition: Condition) {
        let slot = match condition.slot {
            FilterSlot::After => &mut self.after,
            FilterSlot::Before => &mut self.before,
            FilterSlot::Speaker => &mut self.speaker,
        };
        *slot = Some(condition);
    }

    #[must_use]
    pub fn get(&self, slot: FilterSlot) -> Option<&Condition> {
        match slot {
            FilterSlot::After => self.after.as_ref(),
            FilterSlot::Before => self.before.as_ref(),
            FilterSlot::Speaker => self.speaker.as_ref(),
        }
    }

    /// Active conditions in `after`, `before`, `speaker` order.
    #[must_use]
    pub fn conditions(&self) -> Vec<&Condition> {
        [&self.after, &self.before, &self.speaker].into_iter().flatten().collect()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.conditions().is_empty()
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let render = |condition: &Option<Condition>| {
            condition.as_ref().map(Condition::rendered).unwrap_or_default()
        };
        Fingerprint::of_fragments(&render(&self.after), &render(&self.before), &render(&self.speaker))
    }
}

/// Lowercase hex sha256 of the effective filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn of_fragments(after: &str, before: &str, speaker: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(after.as_bytes());
        hasher.update(before.as_bytes());
        hasher.update(speaker.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub fingerprint: Fingerprint,
    pub active: bool,
    /// `Some` when the fingerprint changed: the fresh candidate list (empty
    /// when no condition is active).
    pub rebuilt: Option<Vec<RotationSeq>>,
}

impl FilterOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.rebuilt.is_some()
    }
}

/// Compare the request's filter against the one recorded in the client's
/// cursor and rebuild the candidate list when they differ.
///
/// # Errors
/// Returns the store error when the filtered query fails; no stale list is
/// substituted.
pub fn evaluate_filters<S>(
    store: &S,
    filters: &FilterSet,
    recorded: Option<&Fingerprint>,
) -> Result<FilterOutcome, WallError>
where
    S: QuoteStore + ?Sized,
{
    let fingerprint = filters.fingerprint();
    let active = filters.is_active();

    if recorded == Some(&fingerprint) {
        return Ok(FilterOutcome { fingerprint, active, rebuilt: None });
    }

    let candidates =
        if active { store.query_filtered_sequences(&filters.conditions())? } else { Vec::new() };
    Ok(FilterOutcome { fingerprint, active, rebuilt: Some(candidates) })
}
