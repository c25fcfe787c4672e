//! Process-wide cache of the shuffled rotation table.
//!
//! The table itself lives in the store and is rebuilt at most once per store
//! calendar day. Requests read the cached [`ShuffleSnapshot`] under a shared
//! lock; a reshuffle is serialized behind `refresh` so concurrent requests that
//! find the cache stale wait for one rebuild instead of racing several.
//!
//! Every request also reads the store's shuffle generation. When another
//! process (an operator running `qw db reshuffle`) rebuilt the table, the
//! cached snapshot is replaced with the store's without reshuffling again.

use parking_lot::{Mutex, RwLock};
use time::{Date, Duration, OffsetDateTime};

use crate::{QuoteStore, WallError};

/// How far past the store's midnight the previous day's rotation is still
/// accepted, so app and store clocks a few minutes apart do not thrash.
pub const MIDNIGHT_TOLERANCE: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleSnapshot {
    /// Number of conversations in the rotation (`N`).
    pub size: i64,
    /// Store calendar date of the reshuffle.
    pub built_on: Date,
    /// Store shuffle generation the snapshot describes.
    pub generation: i64,
    /// `store clock - local clock`, measured right after the reshuffle.
    pub correction: Duration,
}

impl ShuffleSnapshot {
    #[must_use]
    pub fn is_current_at(&self, local_now: OffsetDateTime) -> bool {
        let store_now = local_now + self.correction;
        if store_now.date() == self.built_on {
            return true;
        }

        (store_now - MIDNIGHT_TOLERANCE).date() == self.built_on
    }
}

#[derive(Debug, Default)]
pub struct RotationState {
    snapshot: RwLock<Option<ShuffleSnapshot>>,
    refresh: Mutex<()>,
}

impl RotationState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<ShuffleSnapshot> {
        *self.snapshot.read()
    }

    /// Make sure the rotation was built today and return its snapshot.
    ///
    /// # Errors
    /// Returns the store error of whichever reshuffle step failed. The cached
    /// snapshot is left untouched in that case.
    pub fn ensure_current<S>(&self, store: &S) -> Result<ShuffleSnapshot, WallError>
    where
        S: QuoteStore + ?Sized,
    {
        self.ensure_current_at(store, OffsetDateTime::now_utc())
    }

    /// [`RotationState::ensure_current`] against an explicit local clock reading.
    ///
    /// # Errors
    /// Same as [`RotationState::ensure_current`].
    pub fn ensure_current_at<S>(
        &self,
        store: &S,
        local_now: OffsetDateTime,
    ) -> Result<ShuffleSnapshot, WallError>
    where
        S: QuoteStore + ?Sized,
    {
        let generation = store.shuffle_generation()?;
        let cached = self.snapshot().filter(|s| s.is_current_at(local_now));
        if let Some(snapshot) = cached.filter(|s| s.generation == generation) {
            return Ok(snapshot);
        }

        let _guard = self.refresh.lock();
        // another request may have finished the rebuild while we waited
        let generation = store.shuffle_generation()?;
        let cached = self.snapshot();
        if let Some(snapshot) =
            cached.filter(|s| s.generation == generation && s.is_current_at(local_now))
        {
            return Ok(snapshot);
        }

        // rebuilt elsewhere (another process or the CLI); take it if still today's
        if generation > 0 && cached.map(|s| s.generation) != Some(generation) {
            let adopted = load_snapshot(store, local_now)?;
            if adopted.is_current_at(local_now) {
                *self.snapshot.write() = Some(adopted);
                return Ok(adopted);
            }
        }

        store.reshuffle_all()?;
        let snapshot = load_snapshot(store, local_now)?;
        *self.snapshot.write() = Some(snapshot);
        Ok(snapshot)
    }
}

fn load_snapshot<S>(store: &S, local_now: OffsetDateTime) -> Result<ShuffleSnapshot, WallError>
where
    S: QuoteStore + ?Sized,
{
    let size = store.rotation_size()?;
    let built_on = store.shuffle_built_on()?;
    let generation = store.shuffle_generation()?;
    let correction = store.current_store_time()? - local_now;

    Ok(ShuffleSnapshot { size, built_on, generation, correction })
}
