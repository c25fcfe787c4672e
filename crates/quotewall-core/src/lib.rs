//! Quote rotation and per-client cursor engine for the quote wall.
//!
//! The crate owns no I/O of its own. Everything that touches persistence goes
//! through [`QuoteStore`], which the sqlite crate implements and tests fake.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

pub mod calendar;
pub mod codec;
pub mod cursor;
pub mod filter;
pub mod rotation;

pub use codec::{CodecError, CookieCodec, CookieKey};
pub use cursor::{
    exceeds_cookie_limit, CursorError, CursorState, Pick, Step, COOKIE_LIFETIME, COOKIE_NAME,
    COOKIE_SIZE_LIMIT,
};
pub use filter::{
    evaluate_filters, parse_filter_params, Condition, FilterOutcome, FilterParam,
    FilterParamError, FilterSet, FilterSlot, Fingerprint, ParsedParam,
};
pub use rotation::{RotationState, ShuffleSnapshot, MIDNIGHT_TOLERANCE};

/// Position of a conversation inside the shuffled rotation table (1-based).
pub type RotationSeq = i64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WallError {
    #[error("store error: {0}")]
    Store(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conversation {0} has no quotes")]
    EmptyConversation(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(raw).map(Self)
            }
        }
    };
}

ulid_id!(ConversationId);
ulid_id!(QuoteId);
ulid_id!(AuthorId);
ulid_id!(AnnotationId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: AuthorId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub id: AnnotationId,
    pub note: String,
}

/// One utterance inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub id: QuoteId,
    pub said_on: Date,
    pub sequence: u32,
    pub phrase: String,
    pub publish: bool,
    pub author: Author,
    pub annotation: Option<Annotation>,
}

/// A group of quotes sharing an occasion, ordered by `Quote::sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub occurred_on: Date,
    pub publish: bool,
    pub quotes: Vec<Quote>,
}

/// Persistence collaborator consumed by the rotation, filter and selection logic.
///
/// Every method is a single blocking round-trip; none of them is retried.
pub trait QuoteStore {
    /// Replace the rotation table with a fresh random permutation of all
    /// published conversations, numbered `1..=N`.
    fn reshuffle_all(&self) -> Result<(), WallError>;

    fn rotation_size(&self) -> Result<i64, WallError>;

    /// Store-side calendar date stamped by the last reshuffle.
    fn shuffle_built_on(&self) -> Result<Date, WallError>;

    /// Counter bumped by every reshuffle, `0` before the first one. Rotation
    /// sequences are only comparable between requests that saw the same value.
    fn shuffle_generation(&self) -> Result<i64, WallError>;

    fn current_store_time(&self) -> Result<OffsetDateTime, WallError>;

    /// Rotation sequence numbers of conversations with at least one quote
    /// matching every condition, in store order.
    fn query_filtered_sequences(&self, conditions: &[&Condition]) -> Result<Vec<RotationSeq>, WallError>;

    fn lookup_conversation_by_rotation_index(
        &self,
        sequence: RotationSeq,
    ) -> Result<ConversationId, WallError>;

    fn fetch_full_conversation(&self, id: ConversationId) -> Result<Conversation, WallError>;

    fn record_metric(&self, route: &str, elapsed_ms: u64) -> Result<(), WallError>;
}
