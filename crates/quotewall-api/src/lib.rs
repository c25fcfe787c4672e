use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use quotewall_core::calendar::display_date;
use quotewall_core::cursor::advance;
use quotewall_core::{
    evaluate_filters, exceeds_cookie_limit, parse_filter_params, Author, AuthorId, CookieCodec, Conversation,
    ConversationId, CursorState, FilterSet, Pick, Quote, QuoteId, QuoteStore, RotationState,
};
use quotewall_store_sqlite::{
    read_archive, write_archive, ArchiveFileDigest, RotationStatus, RouteMetrics, SchemaStatus,
    SeedSummary, SqliteStore,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const PAGE_TITLE: &str = "Quote Wall Quickie";
pub const REFRESH_SECONDS: u32 = 10;
pub const NO_MATCH_REFRESH_SECONDS: u32 = 300;
pub const NO_MATCH_MESSAGE: &str = "No quotes meet criteria.";

const DEFAULT_PHRASE: &str = "Life isn't about quotes about life.";
const DEFAULT_AUTHOR: &str = "Unknown";
/// Percentage of the page height shared by the quotes of one conversation.
const QUOTE_AREA_PERCENT: u32 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// One selection request as seen by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuickieRequest {
    /// Metric label for the route that served the request.
    pub route: String,
    /// Decoded query parameters in URL order.
    pub params: Vec<(String, String)>,
    /// Raw `NextQuote` cookie value, if the client sent one.
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utterance {
    pub name: String,
    pub quote: String,
    pub date: String,
    pub annotation: Option<String>,
}

/// View model for the quote wall page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickiePage {
    pub datestr: String,
    pub title: String,
    pub refresh_seconds: u32,
    pub quote_share: u32,
    pub utterances: Vec<Utterance>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickieResponse {
    pub page: QuickiePage,
    /// Sealed cursor to hand back as the new `NextQuote` value.
    pub cookie: String,
    pub pick: Pick,
}

impl QuickiePage {
    fn for_conversation(conversation: &Conversation, now: OffsetDateTime) -> Self {
        let utterances = conversation
            .quotes
            .iter()
            .map(|quote| Utterance {
                name: quote.author.name.clone(),
                quote: quote.phrase.clone(),
                date: display_date(quote.said_on),
                annotation: quote.annotation.as_ref().map(|a| a.note.clone()),
            })
            .collect::<Vec<_>>();
        let count = u32::try_from(utterances.len()).unwrap_or(u32::MAX).max(1);

        Self {
            datestr: page_datestr(now),
            title: PAGE_TITLE.to_string(),
            refresh_seconds: REFRESH_SECONDS,
            quote_share: QUOTE_AREA_PERCENT / count,
            utterances,
            message: None,
        }
    }

    fn no_match(now: OffsetDateTime) -> Self {
        Self {
            datestr: page_datestr(now),
            title: PAGE_TITLE.to_string(),
            refresh_seconds: NO_MATCH_REFRESH_SECONDS,
            quote_share: QUOTE_AREA_PERCENT,
            utterances: Vec::new(),
            message: Some(NO_MATCH_MESSAGE.to_string()),
        }
    }
}

fn page_datestr(now: OffsetDateTime) -> String {
    now.format(format_description!(
        "[weekday repr:short] [month repr:short] [day padding:space] [hour]:[minute]:[second] [year]"
    ))
    .unwrap_or_else(|_| now.to_string())
}

/// Conversation shown while the rotation holds nothing publishable.
#[must_use]
pub fn default_conversation(now: OffsetDateTime) -> Conversation {
    let today = now.date();
    Conversation {
        id: ConversationId::new(),
        occurred_on: today,
        publish: true,
        quotes: vec![Quote {
            id: QuoteId::new(),
            said_on: today,
            sequence: 0,
            phrase: DEFAULT_PHRASE.to_string(),
            publish: true,
            author: Author { id: AuthorId::new(), name: DEFAULT_AUTHOR.to_string() },
            annotation: None,
        }],
    }
}

#[derive(Debug, Clone)]
pub struct QuoteWallApi {
    db_path: PathBuf,
    rotation: Arc<RotationState>,
    codec: CookieCodec,
}

impl QuoteWallApi {
    #[must_use]
    pub fn new(db_path: PathBuf, codec: CookieCodec) -> Self {
        Self { db_path, rotation: Arc::new(RotationState::new()), codec }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Load an archive file into the database.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable or any insert fails.
    pub fn seed(&self, src: &Path) -> Result<SeedSummary> {
        let archive = read_archive(src)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        let summary = store.seed_archive(&archive)?;
        info!(
            conversations = summary.conversations,
            quotes = summary.quotes,
            src = %src.display(),
            "archive seeded"
        );
        Ok(summary)
    }

    /// Write the whole database out as an archive file.
    ///
    /// # Errors
    /// Returns an error when reading the database or writing the file fails.
    pub fn export(&self, out: &Path) -> Result<ArchiveFileDigest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let archive = store.export_archive()?;
        write_archive(out, &archive)
    }

    /// Force a new rotation regardless of the cached build date.
    ///
    /// # Errors
    /// Returns an error when the reshuffle or the status query fails.
    pub fn reshuffle(&self) -> Result<RotationStatus> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.reshuffle()?;
        store.rotation_status()
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn metrics(&self) -> Result<Vec<RouteMetrics>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.metric_summary()
    }

    /// # Errors
    /// Returns an error when the backup destination exists or the copy fails.
    pub fn backup(&self, out: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out)
    }

    /// Serve one quote wall request against the configured database and
    /// record how long it took.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or any store step
    /// of the selection fails. Cookie and filter-parameter problems are absorbed.
    pub fn quickie(&self, request: &QuickieRequest) -> Result<QuickieResponse> {
        let started = Instant::now();
        let store = self.open_store()?;

        let response =
            self.select(&store, request, OffsetDateTime::now_utc(), &mut rand::thread_rng());

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(err) = store.record_metric(&request.route, elapsed_ms) {
            warn!(route = %request.route, error = %err, "failed to record request metric");
        }

        response
    }

    /// Run one selection: refresh the rotation if stale, reconcile the
    /// client's cursor with the request's filters, pick and load the next
    /// conversation, and seal the advanced cursor.
    ///
    /// # Errors
    /// Returns the first store failure, or a payload error if the cursor
    /// cannot be serialized.
    pub fn select<S, R>(
        &self,
        store: &S,
        request: &QuickieRequest,
        local_now: OffsetDateTime,
        rng: &mut R,
    ) -> Result<QuickieResponse>
    where
        S: QuoteStore + ?Sized,
        R: Rng + ?Sized,
    {
        let previous = self.rotation.snapshot();
        let snapshot = self.rotation.ensure_current_at(store, local_now)?;
        if previous != Some(snapshot) {
            info!(
                size = snapshot.size,
                built_on = %snapshot.built_on,
                generation = snapshot.generation,
                correction_secs = snapshot.correction.whole_seconds(),
                "rotation reshuffled"
            );
        }

        let incoming = request.cookie.as_deref().and_then(|raw| {
            CursorState::decode(&self.codec, raw)
                .map_err(|err| debug!(reason = %err, "ignoring unreadable cursor cookie"))
                .ok()
        });

        let today = local_now.date();
        let parsed = parse_filter_params(&request.params, today);
        for param in &parsed {
            if let Err(reason) = &param.outcome {
                debug!(param = param.param.as_str(), raw = %param.raw, %reason, "dropping filter parameter");
            }
        }
        let filters = FilterSet::from_parsed(&parsed);

        // positions from an older shuffle point at different conversations
        let recorded =
            incoming.as_ref().and_then(|cursor| cursor.recorded_fingerprint(snapshot.generation));
        let outcome = evaluate_filters(store, &filters, recorded)?;
        if let Some(list) = &outcome.rebuilt {
            debug!(active = outcome.active, candidates = list.len(), "filtered list rebuilt");
        }

        let step = advance(incoming, snapshot.size, snapshot.generation, &outcome, rng);
        let page = match step.pick {
            Pick::Rotation(sequence) => {
                let id = store.lookup_conversation_by_rotation_index(sequence)?;
                let conversation = store.fetch_full_conversation(id)?;
                QuickiePage::for_conversation(&conversation, local_now)
            }
            Pick::NoMatch => QuickiePage::no_match(local_now),
            Pick::EmptyRotation => {
                QuickiePage::for_conversation(&default_conversation(local_now), local_now)
            }
        };

        let cookie = step.cursor.encode(&self.codec).context("failed to seal cursor")?;
        if exceeds_cookie_limit(&cookie) {
            warn!(
                bytes = cookie.len(),
                candidates = step.cursor.list.len(),
                "cursor cookie exceeds the browser size limit"
            );
        }
        Ok(QuickieResponse { page, cookie, pick: step.pick })
    }
}
