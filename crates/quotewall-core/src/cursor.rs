//! Per-client iteration state carried in the `NextQuote` cookie.
//!
//! Plain mode walks rotation positions `1..=N` and wraps `N -> 1`. Filtered
//! mode walks indexes `0..len` of a materialized candidate list. Each request
//! consumes one [`CursorState`] and yields a new one; nothing is mutated in
//! place.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use time::Duration;

use crate::codec::{CodecError, CookieCodec};
use crate::filter::{FilterOutcome, Fingerprint};
use crate::RotationSeq;

pub const COOKIE_NAME: &str = "NextQuote";
pub const COOKIE_LIFETIME: Duration = Duration::hours(3);
/// Largest `name=value` pair browsers are required to keep.
pub const COOKIE_SIZE_LIMIT: usize = 4096;

const PAD_BYTES: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("cursor payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    /// Plain mode: next rotation position. Filtered mode: next list index.
    pub next: i64,
    /// Candidate rotation positions for the active filter.
    pub list: Vec<RotationSeq>,
    /// Filter that produced `list`; `None` only for cursors from older cookies.
    pub fingerprint: Option<Fingerprint>,
    /// Shuffle generation the positions refer to.
    pub generation: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct CookiePayload {
    front: String,
    next: i64,
    #[serde(default)]
    list: Vec<RotationSeq>,
    #[serde(default)]
    fingerprint: Option<Fingerprint>,
    #[serde(default)]
    generation: Option<i64>,
    back: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Show the conversation at this rotation position.
    Rotation(RotationSeq),
    /// A filter is active but matched nothing.
    NoMatch,
    /// The rotation holds no published conversations.
    EmptyRotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub pick: Pick,
    pub cursor: CursorState,
}

impl CursorState {
    /// Plain-mode cursor starting at a uniformly random position.
    pub fn fresh_plain<R>(rotation_size: i64, fingerprint: Fingerprint, rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        let next = if rotation_size >= 1 { rng.gen_range(1..=rotation_size) } else { 1 };
        Self { next, list: Vec::new(), fingerprint: Some(fingerprint), generation: None }
    }

    #[must_use]
    pub fn fresh_filtered(list: Vec<RotationSeq>, fingerprint: Fingerprint) -> Self {
        Self { next: 0, list, fingerprint: Some(fingerprint), generation: None }
    }

    /// The filter fingerprint, but only while the rotation it indexes is
    /// still the current one. After a reshuffle the stored positions name
    /// other conversations, so the filter must be treated as changed.
    #[must_use]
    pub fn recorded_fingerprint(&self, generation: i64) -> Option<&Fingerprint> {
        if self.generation == Some(generation) {
            self.fingerprint.as_ref()
        } else {
            None
        }
    }

    /// Open and parse a cookie value.
    ///
    /// # Errors
    /// Any codec or payload failure; callers treat all of them as "no cookie".
    pub fn decode(codec: &CookieCodec, sealed: &str) -> Result<Self, CursorError> {
        let plaintext = codec.open(sealed)?;
        let payload: CookiePayload = serde_json::from_slice(&plaintext)?;
        Ok(Self {
            next: payload.next,
            list: payload.list,
            fingerprint: payload.fingerprint,
            generation: payload.generation,
        })
    }

    /// Serialize with fresh padding and seal.
    ///
    /// # Errors
    /// Returns [`CursorError::Payload`] if serialization fails.
    pub fn encode(&self, codec: &CookieCodec) -> Result<String, CursorError> {
        let payload = CookiePayload {
            front: pad_token(),
            next: self.next,
            list: self.list.clone(),
            fingerprint: self.fingerprint.clone(),
            generation: self.generation,
            back: pad_token(),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        Ok(codec.seal(&plaintext))
    }
}

/// Whether a sealed cursor is too large for browsers to store.
#[must_use]
pub fn exceeds_cookie_limit(sealed: &str) -> bool {
    COOKIE_NAME.len() + 1 + sealed.len() > COOKIE_SIZE_LIMIT
}

fn pad_token() -> String {
    let mut bytes = [0_u8; PAD_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Pick the next conversation and produce the cursor to hand back.
///
/// A filter change (reported by `outcome.rebuilt`) discards `incoming`
/// entirely. Otherwise the incoming cursor is re-clamped against the current
/// rotation size or list length before it is consumed. The returned cursor
/// is stamped with `generation`.
pub fn advance<R>(
    incoming: Option<CursorState>,
    rotation_size: i64,
    generation: i64,
    outcome: &FilterOutcome,
    rng: &mut R,
) -> Step
where
    R: Rng + ?Sized,
{
    let cursor = match (&outcome.rebuilt, incoming) {
        (Some(list), _) if outcome.active => {
            CursorState::fresh_filtered(list.clone(), outcome.fingerprint.clone())
        }
        (None, Some(cursor)) => cursor,
        _ => CursorState::fresh_plain(rotation_size, outcome.fingerprint.clone(), rng),
    };

    let mut step =
        if outcome.active { step_filtered(cursor) } else { step_plain(cursor, rotation_size) };
    step.cursor.generation = Some(generation);
    step
}

fn step_plain(cursor: CursorState, rotation_size: i64) -> Step {
    if rotation_size < 1 {
        return Step { pick: Pick::EmptyRotation, cursor };
    }

    let position = if (1..=rotation_size).contains(&cursor.next) { cursor.next } else { 1 };
    let next = if position >= rotation_size { 1 } else { position + 1 };
    Step {
        pick: Pick::Rotation(position),
        cursor: CursorState { next, list: Vec::new(), ..cursor },
    }
}

fn step_filtered(cursor: CursorState) -> Step {
    let len = i64::try_from(cursor.list.len()).unwrap_or(i64::MAX);
    if len == 0 {
        return Step { pick: Pick::NoMatch, cursor };
    }

    let index = if (0..len).contains(&cursor.next) { cursor.next } else { 0 };
    let chosen = usize::try_from(index).ok().and_then(|i| cursor.list.get(i).copied());
    let Some(sequence) = chosen else {
        return Step { pick: Pick::NoMatch, cursor };
    };

    let next = if index + 1 >= len { 0 } else { index + 1 };
    Step { pick: Pick::Rotation(sequence), cursor: CursorState { next, ..cursor } }
}
