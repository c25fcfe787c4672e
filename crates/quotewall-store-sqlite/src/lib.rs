use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use quotewall_core::calendar::{iso_date, parse_iso_date, parse_us_date, us_date};
use quotewall_core::{
    Annotation, AnnotationId, Author, AuthorId, Condition, Conversation, ConversationId, Quote,
    QuoteId, QuoteStore, RotationSeq, WallError,
};
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};

const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS authors (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS annotations (
  id TEXT PRIMARY KEY,
  note TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  occurred_on TEXT NOT NULL,
  publish INTEGER NOT NULL CHECK (publish IN (0, 1))
);

CREATE TABLE IF NOT EXISTS quotes (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
  author_id TEXT NOT NULL REFERENCES authors(id),
  annotation_id TEXT REFERENCES annotations(id),
  said_on TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  phrase TEXT NOT NULL,
  publish INTEGER NOT NULL CHECK (publish IN (0, 1)),
  UNIQUE(conversation_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_quotes_conversation ON quotes(conversation_id);
CREATE INDEX IF NOT EXISTS idx_quotes_author ON quotes(author_id);
CREATE INDEX IF NOT EXISTS idx_quotes_said_on ON quotes(said_on);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS shuffled_conversations (
  id TEXT PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
  sequence INTEGER NOT NULL UNIQUE CHECK (sequence >= 1)
);

CREATE TABLE IF NOT EXISTS shuffle_meta (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  built_on TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_metrics (
  id TEXT PRIMARY KEY,
  route TEXT NOT NULL,
  elapsed_ms INTEGER NOT NULL CHECK (elapsed_ms >= 0),
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_request_metrics_route ON request_metrics(route, recorded_at);
";

const MIGRATION_003_SQL: &str = r"
ALTER TABLE shuffle_meta ADD COLUMN generation INTEGER NOT NULL DEFAULT 0;
";

// Every published conversation that has at least one quote, renumbered 1..=N
// in random order, plus the store-side date stamp and a bumped generation.
// Runs as one batch.
const RESHUFFLE_SQL: &str = r"
BEGIN IMMEDIATE;
DELETE FROM shuffled_conversations;
INSERT INTO shuffled_conversations(id, sequence)
  SELECT c.id, ROW_NUMBER() OVER (ORDER BY random())
  FROM conversations c
  WHERE c.publish = 1
    AND EXISTS (SELECT 1 FROM quotes q WHERE q.conversation_id = c.id);
INSERT INTO shuffle_meta(singleton, built_on, generation) VALUES (1, date('now'), 1)
  ON CONFLICT(singleton) DO UPDATE
  SET built_on = excluded.built_on, generation = shuffle_meta.generation + 1;
COMMIT;
";

const FILTERED_SEQUENCES_SQL: &str = "SELECT DISTINCT s.sequence
 FROM shuffled_conversations s
 JOIN quotes q ON q.conversation_id = s.id
 JOIN authors a ON a.id = q.author_id";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// On-disk archive layout used to seed and export the quote database.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuoteArchive {
    #[serde(alias = "Quotearchive")]
    pub quotearchive: ArchiveBody,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveBody {
    #[serde(default, alias = "Conversations")]
    pub conversations: Vec<ArchiveConversation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConversation {
    #[serde(default, alias = "Conversation")]
    pub conversation: Vec<ArchiveUtterance>,
}

/// One quote as written in an archive file. `date` is `M/D/YYYY`; `publish`
/// is compared case-insensitively against `"true"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveUtterance {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Quote")]
    pub quote: String,
    #[serde(alias = "Date")]
    pub date: String,
    #[serde(default, alias = "Publish")]
    pub publish: String,
    #[serde(default, alias = "Annotation", skip_serializing_if = "String::is_empty")]
    pub annotation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub conversations: usize,
    pub quotes: usize,
    pub authors_created: usize,
    pub annotations_created: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveFileDigest {
    pub path: String,
    pub sha256: String,
    pub conversations: usize,
    pub quotes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteMetrics {
    pub route: String,
    pub requests: i64,
    pub total_ms: i64,
    pub max_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotationStatus {
    pub size: i64,
    pub built_on: Option<String>,
    pub generation: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed quote store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in
            [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL), (3_i64, MIGRATION_003_SQL)]
        {
            if version < target {
                self.apply_migration(target, sql)?;
            }
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Load every conversation of an archive in one transaction. Authors and
    /// annotations are matched by exact text and created when missing.
    ///
    /// # Errors
    /// Returns an error when an utterance carries an unreadable date, a
    /// conversation is empty, or any write fails. Nothing is written then.
    pub fn seed_archive(&mut self, archive: &QuoteArchive) -> Result<SeedSummary> {
        let tx = self.conn.transaction().context("failed to start seed transaction")?;
        let mut authors: HashMap<String, AuthorId> = HashMap::new();
        let mut annotations: HashMap<String, AnnotationId> = HashMap::new();
        let mut summary = SeedSummary::default();

        for (index, entry) in archive.quotearchive.conversations.iter().enumerate() {
            let Some(first) = entry.conversation.first() else {
                return Err(anyhow!("archive conversation #{index} has no utterances"));
            };

            let conversation_id = ConversationId::new();
            tx.execute(
                "INSERT INTO conversations(id, occurred_on, publish) VALUES (?1, ?2, ?3)",
                params![
                    conversation_id.to_string(),
                    iso_date(archive_date(&first.date)?),
                    archive_flag(&first.publish),
                ],
            )
            .with_context(|| format!("failed to insert archive conversation #{index}"))?;
            summary.conversations += 1;

            for (sequence, utterance) in entry.conversation.iter().enumerate() {
                let author_id = match authors.get(&utterance.name) {
                    Some(id) => *id,
                    None => {
                        let (id, created) = find_or_create_author(&tx, &utterance.name)?;
                        summary.authors_created += usize::from(created);
                        authors.insert(utterance.name.clone(), id);
                        id
                    }
                };

                let annotation_id = if utterance.annotation.is_empty() {
                    None
                } else if let Some(id) = annotations.get(&utterance.annotation) {
                    Some(*id)
                } else {
                    let (id, created) = find_or_create_annotation(&tx, &utterance.annotation)?;
                    summary.annotations_created += usize::from(created);
                    annotations.insert(utterance.annotation.clone(), id);
                    Some(id)
                };

                let sequence = i64::try_from(sequence).context("quote sequence overflow")?;
                tx.execute(
                    "INSERT INTO quotes(
                        id, conversation_id, author_id, annotation_id,
                        said_on, sequence, phrase, publish
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        QuoteId::new().to_string(),
                        conversation_id.to_string(),
                        author_id.to_string(),
                        annotation_id.map(|id| id.to_string()),
                        iso_date(archive_date(&utterance.date)?),
                        sequence,
                        utterance.quote,
                        archive_flag(&utterance.publish),
                    ],
                )
                .with_context(|| format!("failed to insert quote {sequence} of conversation #{index}"))?;
                summary.quotes += 1;
            }
        }

        tx.commit().context("failed to commit seed transaction")?;
        Ok(summary)
    }

    /// Read the whole database back into archive form, oldest conversation first.
    ///
    /// # Errors
    /// Returns an error when any query fails or stored rows cannot be decoded.
    pub fn export_archive(&self) -> Result<QuoteArchive> {
        let mut stmt =
            self.conn.prepare("SELECT id FROM conversations ORDER BY occurred_on ASC, id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list conversations")?;

        let mut conversations = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = parse_conversation_id(&raw)?;
            let conversation = self
                .find_conversation(id)?
                .ok_or_else(|| anyhow!("conversation {id} vanished during export"))?;
            conversations.push(ArchiveConversation {
                conversation: conversation
                    .quotes
                    .iter()
                    .map(|quote| ArchiveUtterance {
                        name: quote.author.name.clone(),
                        quote: quote.phrase.clone(),
                        date: us_date(quote.said_on),
                        publish: quote.publish.to_string(),
                        annotation: quote
                            .annotation
                            .as_ref()
                            .map(|a| a.note.clone())
                            .unwrap_or_default(),
                    })
                    .collect(),
            });
        }

        Ok(QuoteArchive { quotearchive: ArchiveBody { conversations } })
    }

    /// Rebuild the rotation table. See [`QuoteStore::reshuffle_all`].
    ///
    /// # Errors
    /// Returns an error when the batch fails; the previous rotation is kept.
    pub fn reshuffle(&self) -> Result<()> {
        if let Err(err) = self.conn.execute_batch(RESHUFFLE_SQL) {
            if !self.conn.is_autocommit() {
                self.conn
                    .execute_batch("ROLLBACK;")
                    .context("failed to roll back reshuffle")?;
            }
            return Err(err).context("failed to reshuffle conversations");
        }
        Ok(())
    }

    /// Number of conversations currently in the rotation table.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn rotation_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM shuffled_conversations", [], |row| row.get(0))
            .context("failed to count shuffled conversations")
    }

    /// Date stamped by the last reshuffle, if there ever was one.
    ///
    /// # Errors
    /// Returns an error when the query fails or the stored date is unreadable.
    pub fn built_on(&self) -> Result<Option<Date>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT built_on FROM shuffle_meta WHERE singleton = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("failed to read shuffle_meta")?;

        raw.map(|raw| {
            parse_iso_date(&raw).ok_or_else(|| anyhow!("invalid shuffle_meta.built_on: {raw}"))
        })
        .transpose()
    }

    /// Number of reshuffles so far; `0` when the table was never built.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn generation(&self) -> Result<i64> {
        let generation: Option<i64> = self
            .conn
            .query_row("SELECT generation FROM shuffle_meta WHERE singleton = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("failed to read shuffle generation")?;
        Ok(generation.unwrap_or(0))
    }

    /// # Errors
    /// Returns an error when any rotation query fails.
    pub fn rotation_status(&self) -> Result<RotationStatus> {
        Ok(RotationStatus {
            size: self.rotation_count()?,
            built_on: self.built_on()?.map(iso_date),
            generation: self.generation()?,
        })
    }

    /// Clock reading of the database engine itself, second precision, UTC.
    ///
    /// # Errors
    /// Returns an error when the query fails or the timestamp is unreadable.
    pub fn store_time(&self) -> Result<OffsetDateTime> {
        let raw: String = self
            .conn
            .query_row("SELECT strftime('%Y-%m-%dT%H:%M:%SZ', 'now')", [], |row| row.get(0))
            .context("failed to read store clock")?;
        parse_rfc3339(&raw)
    }

    /// Rotation sequences whose conversation has a quote matching all conditions.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn filtered_sequences(&self, conditions: &[&Condition]) -> Result<Vec<RotationSeq>> {
        let mut sql = FILTERED_SEQUENCES_SQL.to_string();
        if !conditions.is_empty() {
            sql.push_str("\n WHERE ");
            sql.push_str(&conditions.iter().map(|c| c.clause()).collect::<Vec<_>>().join(" AND "));
        }
        sql.push_str("\n ORDER BY s.sequence ASC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare filtered query")?;
        let rows = stmt.query_map(params_from_iter(conditions.iter().map(|c| c.value())), |row| {
            row.get::<_, i64>(0)
        })?;
        let sequences =
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to run filtered query")?;
        Ok(sequences)
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored id is unreadable.
    pub fn conversation_at(&self, sequence: RotationSeq) -> Result<Option<ConversationId>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM shuffled_conversations WHERE sequence = ?1",
                params![sequence],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up rotation sequence {sequence}"))?;
        raw.as_deref().map(parse_conversation_id).transpose()
    }

    /// Conversation with every quote, author and annotation, quotes in
    /// sequence order.
    ///
    /// # Errors
    /// Returns an error when a query fails or a stored row cannot be decoded.
    pub fn find_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let head: Option<(String, bool)> = self
            .conn
            .query_row(
                "SELECT occurred_on, publish FROM conversations WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to load conversation {id}"))?;
        let Some((occurred_on, publish)) = head else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT
                q.id, q.said_on, q.sequence, q.phrase, q.publish,
                a.id, a.name, n.id, n.note
             FROM quotes q
             JOIN authors a ON a.id = q.author_id
             LEFT JOIN annotations n ON n.id = q.annotation_id
             WHERE q.conversation_id = ?1
             ORDER BY q.sequence ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok(QuoteRow {
                id: row.get(0)?,
                said_on: row.get(1)?,
                sequence: row.get(2)?,
                phrase: row.get(3)?,
                publish: row.get(4)?,
                author_id: row.get(5)?,
                author_name: row.get(6)?,
                annotation_id: row.get(7)?,
                annotation_note: row.get(8)?,
            })
        })?;

        let mut quotes = Vec::new();
        for row in rows {
            let row = row.with_context(|| format!("failed to read quotes of conversation {id}"))?;
            quotes.push(row.into_quote()?);
        }

        Ok(Some(Conversation { id, occurred_on: parse_stored_date(&occurred_on)?, publish, quotes }))
    }

    /// Append one request timing sample.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_metric(&self, route: &str, elapsed_ms: u64) -> Result<()> {
        let elapsed = i64::try_from(elapsed_ms).unwrap_or(i64::MAX);
        self.conn
            .execute(
                "INSERT INTO request_metrics(id, route, elapsed_ms, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ulid::Ulid::new().to_string(), route, elapsed, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record metric for {route}"))?;
        Ok(())
    }

    /// Per-route request counts and timings, busiest route first.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn metric_summary(&self) -> Result<Vec<RouteMetrics>> {
        let mut stmt = self.conn.prepare(
            "SELECT route, COUNT(*), SUM(elapsed_ms), MAX(elapsed_ms)
             FROM request_metrics
             GROUP BY route
             ORDER BY COUNT(*) DESC, route ASC",
        )?;
        let summary = stmt
            .query_map([], |row| {
                Ok(RouteMetrics {
                    route: row.get(0)?,
                    requests: row.get(1)?,
                    total_ms: row.get(2)?,
                    max_ms: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to summarize request metrics")?;
        Ok(summary)
    }

    /// Copy the live database to `out_file` using the SQLite online backup API.
    ///
    /// # Errors
    /// Returns an error when the destination exists or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if out_file.exists() {
            return Err(anyhow!("backup destination already exists: {}", out_file.display()));
        }
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create backup directory {}", parent.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to back up database to {}", out_file.display()))?;
        Ok(())
    }
}

impl QuoteStore for SqliteStore {
    fn reshuffle_all(&self) -> Result<(), WallError> {
        self.reshuffle().map_err(store_error)
    }

    fn rotation_size(&self) -> Result<i64, WallError> {
        self.rotation_count().map_err(store_error)
    }

    fn shuffle_built_on(&self) -> Result<Date, WallError> {
        self.built_on()
            .map_err(store_error)?
            .ok_or_else(|| WallError::NotFound("rotation has never been shuffled".to_string()))
    }

    fn shuffle_generation(&self) -> Result<i64, WallError> {
        self.generation().map_err(store_error)
    }

    fn current_store_time(&self) -> Result<OffsetDateTime, WallError> {
        self.store_time().map_err(store_error)
    }

    fn query_filtered_sequences(
        &self,
        conditions: &[&Condition],
    ) -> Result<Vec<RotationSeq>, WallError> {
        self.filtered_sequences(conditions).map_err(store_error)
    }

    fn lookup_conversation_by_rotation_index(
        &self,
        sequence: RotationSeq,
    ) -> Result<ConversationId, WallError> {
        self.conversation_at(sequence)
            .map_err(store_error)?
            .ok_or_else(|| WallError::NotFound(format!("no conversation at rotation sequence {sequence}")))
    }

    fn fetch_full_conversation(&self, id: ConversationId) -> Result<Conversation, WallError> {
        let conversation = self
            .find_conversation(id)
            .map_err(store_error)?
            .ok_or_else(|| WallError::NotFound(format!("conversation {id}")))?;
        if conversation.quotes.is_empty() {
            return Err(WallError::EmptyConversation(id.to_string()));
        }
        Ok(conversation)
    }

    fn record_metric(&self, route: &str, elapsed_ms: u64) -> Result<(), WallError> {
        self.insert_metric(route, elapsed_ms).map_err(store_error)
    }
}

/// Read an archive file from disk.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a quote archive.
pub fn read_archive(path: &Path) -> Result<QuoteArchive> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read archive file {}", path.display()))?;
    let archive: QuoteArchive = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse archive file {}", path.display()))?;
    if archive.quotearchive.conversations.is_empty() {
        return Err(anyhow!("no quotes found in archive file {}", path.display()));
    }
    Ok(archive)
}

/// Write an archive as pretty JSON and report its digest.
///
/// # Errors
/// Returns an error when serialization or the write fails.
pub fn write_archive(path: &Path, archive: &QuoteArchive) -> Result<ArchiveFileDigest> {
    let raw = serde_json::to_vec_pretty(archive).context("failed to serialize archive")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create export directory {}", parent.display()))?;
    }
    fs::write(path, &raw)
        .with_context(|| format!("failed to write archive file {}", path.display()))?;

    Ok(ArchiveFileDigest {
        path: path.display().to_string(),
        sha256: format!("{:x}", Sha256::digest(&raw)),
        conversations: archive.quotearchive.conversations.len(),
        quotes: archive.quotearchive.conversations.iter().map(|c| c.conversation.len()).sum(),
    })
}

struct QuoteRow {
    id: String,
    said_on: String,
    sequence: i64,
    phrase: String,
    publish: bool,
    author_id: String,
    author_name: String,
    annotation_id: Option<String>,
    annotation_note: Option<String>,
}

impl QuoteRow {
    fn into_quote(self) -> Result<Quote> {
        let annotation = match (self.annotation_id, self.annotation_note) {
            (Some(id), Some(note)) => Some(Annotation {
                id: AnnotationId::from_str(&id)
                    .with_context(|| format!("invalid annotation id: {id}"))?,
                note,
            }),
            _ => None,
        };

        Ok(Quote {
            id: QuoteId::from_str(&self.id).with_context(|| format!("invalid quote id: {}", self.id))?,
            said_on: parse_stored_date(&self.said_on)?,
            sequence: u32::try_from(self.sequence)
                .with_context(|| format!("invalid quote sequence: {}", self.sequence))?,
            phrase: self.phrase,
            publish: self.publish,
            author: Author {
                id: AuthorId::from_str(&self.author_id)
                    .with_context(|| format!("invalid author id: {}", self.author_id))?,
                name: self.author_name,
            },
            annotation,
        })
    }
}

fn find_or_create_author(conn: &Connection, name: &str) -> Result<(AuthorId, bool)> {
    let existing: Option<String> = conn
        .query_row("SELECT id FROM authors WHERE name = ?1", params![name], |row| row.get(0))
        .optional()
        .with_context(|| format!("failed to look up author {name}"))?;
    if let Some(raw) = existing {
        let id = AuthorId::from_str(&raw).with_context(|| format!("invalid author id: {raw}"))?;
        return Ok((id, false));
    }

    let id = AuthorId::new();
    conn.execute("INSERT INTO authors(id, name) VALUES (?1, ?2)", params![id.to_string(), name])
        .with_context(|| format!("failed to create author {name}"))?;
    Ok((id, true))
}

fn find_or_create_annotation(conn: &Connection, note: &str) -> Result<(AnnotationId, bool)> {
    let existing: Option<String> = conn
        .query_row("SELECT id FROM annotations WHERE note = ?1", params![note], |row| row.get(0))
        .optional()
        .context("failed to look up annotation")?;
    if let Some(raw) = existing {
        let id =
            AnnotationId::from_str(&raw).with_context(|| format!("invalid annotation id: {raw}"))?;
        return Ok((id, false));
    }

    let id = AnnotationId::new();
    conn.execute("INSERT INTO annotations(id, note) VALUES (?1, ?2)", params![id.to_string(), note])
        .context("failed to create annotation")?;
    Ok((id, true))
}

fn archive_date(raw: &str) -> Result<Date> {
    parse_us_date(raw).ok_or_else(|| anyhow!("invalid archive date {raw:?}; expected M/D/YYYY"))
}

fn archive_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

fn parse_stored_date(raw: &str) -> Result<Date> {
    parse_iso_date(raw).ok_or_else(|| anyhow!("invalid stored date: {raw}"))
}

fn parse_conversation_id(raw: &str) -> Result<ConversationId> {
    ConversationId::from_str(raw).with_context(|| format!("invalid conversation id: {raw}"))
}

fn store_error(err: anyhow::Error) -> WallError {
    WallError::Store(format!("{err:#}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::*;
    use quotewall_core::FilterSet;
    use time::macros::date;
    use ulid::Ulid;

    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new(label: &str) -> Self {
            Self {
                path: std::env::temp_dir()
                    .join(format!("quotewall-{label}-{}.sqlite3", Ulid::new())),
            }
        }

        fn open_migrated(&self) -> Result<SqliteStore> {
            let mut store = SqliteStore::open(&self.path)?;
            store.migrate()?;
            Ok(store)
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut raw = self.path.clone().into_os_string();
                raw.push(suffix);
                let _ = fs::remove_file(PathBuf::from(raw));
            }
        }
    }

    fn utterance(name: &str, quote: &str, date: &str, publish: &str, annotation: &str) -> ArchiveUtterance {
        ArchiveUtterance {
            name: name.to_string(),
            quote: quote.to_string(),
            date: date.to_string(),
            publish: publish.to_string(),
            annotation: annotation.to_string(),
        }
    }

    fn fixture_archive() -> QuoteArchive {
        let conversations = vec![
            vec![
                utterance("Shari Freeman", "We should ship it Friday.", "3/20/2019", "True", ""),
                utterance("Bob McGowan", "Which Friday?", "3/20/2019", "True", "Said during the release retro"),
            ],
            vec![utterance("Mitesh Shah", "The build is green, which worries me.", "6/24/2019", "true", "")],
            vec![utterance(
                "Beth Smith",
                "Anytime they say, 'All you have to do...', you're screwed",
                "10/1/1997",
                "True",
                "",
            )],
            vec![utterance("Shari Freeman", "Off the record.", "1/5/2020", "False", "")],
        ];

        QuoteArchive {
            quotearchive: ArchiveBody {
                conversations: conversations
                    .into_iter()
                    .map(|conversation| ArchiveConversation { conversation })
                    .collect(),
            },
        }
    }

    fn seeded_store(db: &TempDb) -> Result<SqliteStore> {
        let mut store = db.open_migrated()?;
        store.seed_archive(&fixture_archive())?;
        store.reshuffle()?;
        Ok(store)
    }

    fn sequences_for(store: &SqliteStore, pairs: &[(&str, &str)]) -> Result<BTreeSet<i64>> {
        let params = pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect::<Vec<_>>();
        let parsed = quotewall_core::parse_filter_params(&params, date!(2026 - 10 - 17));
        let filters = FilterSet::from_parsed(&parsed);
        Ok(store.filtered_sequences(&filters.conditions())?.into_iter().collect())
    }

    fn speakers_at(store: &SqliteStore, sequence: i64) -> Result<Vec<String>> {
        let id = store.lookup_conversation_by_rotation_index(sequence)?;
        let conversation = store.fetch_full_conversation(id)?;
        Ok(conversation.quotes.into_iter().map(|q| q.author.name).collect())
    }

    #[test]
    fn migrate_applies_all_versions_once() -> Result<()> {
        let db = TempDb::new("migrate");
        let mut store = SqliteStore::open(&db.path)?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2, 3]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn seeding_reuses_authors_and_annotations() -> Result<()> {
        let db = TempDb::new("seed");
        let mut store = db.open_migrated()?;

        let first = store.seed_archive(&fixture_archive())?;
        assert_eq!(
            first,
            SeedSummary { conversations: 4, quotes: 5, authors_created: 4, annotations_created: 1 }
        );

        let second = store.seed_archive(&fixture_archive())?;
        assert_eq!(second.authors_created, 0);
        assert_eq!(second.annotations_created, 0);
        assert_eq!(second.conversations, 4);
        Ok(())
    }

    #[test]
    fn seeding_rejects_bad_dates_without_partial_writes() -> Result<()> {
        let db = TempDb::new("seed-bad-date");
        let mut store = db.open_migrated()?;
        let mut archive = fixture_archive();
        archive.quotearchive.conversations[2].conversation[0].date = "1997-10-01".to_string();

        let err = match store.seed_archive(&archive) {
            Ok(summary) => panic!("seed should fail, got {summary:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("invalid archive date"));
        assert!(store.export_archive()?.quotearchive.conversations.is_empty());
        Ok(())
    }

    #[test]
    fn reshuffle_numbers_published_conversations_contiguously() -> Result<()> {
        let db = TempDb::new("reshuffle");
        let store = seeded_store(&db)?;

        assert_eq!(store.rotation_count()?, 3);
        let sequences: BTreeSet<i64> = store
            .conn
            .prepare("SELECT sequence FROM shuffled_conversations")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(sequences, BTreeSet::from([1, 2, 3]));

        let built_on = store.shuffle_built_on()?;
        assert_eq!(built_on, store.store_time()?.date());
        assert_eq!(store.shuffle_generation()?, 1);

        store.reshuffle()?;
        assert_eq!(store.rotation_count()?, 3);
        assert_eq!(store.shuffle_generation()?, 2);
        assert_eq!(store.rotation_status()?.generation, 2);
        Ok(())
    }

    #[test]
    fn unshuffled_store_reports_missing_build_date() -> Result<()> {
        let db = TempDb::new("unshuffled");
        let store = db.open_migrated()?;
        assert_eq!(store.rotation_size()?, 0);
        assert!(matches!(store.shuffle_built_on(), Err(WallError::NotFound(_))));
        assert_eq!(store.shuffle_generation()?, 0);
        Ok(())
    }

    #[test]
    fn store_clock_is_close_to_local_clock() -> Result<()> {
        let db = TempDb::new("clock");
        let store = db.open_migrated()?;
        let skew = store.current_store_time()? - OffsetDateTime::now_utc();
        assert!(skew.abs() < time::Duration::minutes(1));
        Ok(())
    }

    #[test]
    fn speaker_filter_matches_substrings_case_insensitively() -> Result<()> {
        let db = TempDb::new("speaker");
        let store = seeded_store(&db)?;

        let sha = sequences_for(&store, &[("speaker", "Sha")])?;
        assert_eq!(sha.len(), 2);
        let mut speakers = Vec::new();
        for sequence in &sha {
            speakers.extend(speakers_at(&store, *sequence)?);
        }
        assert!(speakers.contains(&"Shari Freeman".to_string()));
        assert!(speakers.contains(&"Mitesh Shah".to_string()));

        // the unpublished Freeman conversation is not in the rotation
        let freeman = sequences_for(&store, &[("speaker", "freeman")])?;
        assert_eq!(freeman.len(), 1);
        Ok(())
    }

    #[test]
    fn date_filters_are_inclusive() -> Result<()> {
        let db = TempDb::new("dates");
        let store = seeded_store(&db)?;

        let same_day = sequences_for(&store, &[("after", "03/20/2019"), ("before", "03/20/2019")])?;
        assert_eq!(same_day.len(), 1);
        let only = same_day.iter().copied().next().unwrap_or_default();
        assert_eq!(speakers_at(&store, only)?, vec!["Shari Freeman", "Bob McGowan"]);

        assert_eq!(sequences_for(&store, &[("after", "06/01/2019")])?.len(), 1);
        assert_eq!(sequences_for(&store, &[("before", "12/31/1999")])?.len(), 1);
        assert_eq!(sequences_for(&store, &[("after", "01/01/2030")])?.len(), 0);
        assert_eq!(sequences_for(&store, &[("after", "01/01/1990"), ("speaker", "Beth")])?.len(), 1);
        Ok(())
    }

    #[test]
    fn hostile_speaker_text_is_bound_not_spliced() -> Result<()> {
        let db = TempDb::new("hostile");
        let store = seeded_store(&db)?;

        let hits = sequences_for(&store, &[("speaker", "x' OR '1'='1")])?;
        assert!(hits.is_empty());
        assert_eq!(store.rotation_count()?, 3);
        Ok(())
    }

    #[test]
    fn fetch_returns_quotes_in_order_with_annotations() -> Result<()> {
        let db = TempDb::new("fetch");
        let store = seeded_store(&db)?;

        let found = sequences_for(&store, &[("speaker", "McGowan")])?;
        let sequence = found.iter().copied().next().unwrap_or_default();
        let id = store.lookup_conversation_by_rotation_index(sequence)?;
        let conversation = store.fetch_full_conversation(id)?;

        assert_eq!(conversation.occurred_on, date!(2019 - 03 - 20));
        assert!(conversation.publish);
        assert_eq!(conversation.quotes.len(), 2);
        assert_eq!(conversation.quotes[0].sequence, 0);
        assert_eq!(conversation.quotes[0].phrase, "We should ship it Friday.");
        assert_eq!(conversation.quotes[0].annotation, None);
        assert_eq!(
            conversation.quotes[1].annotation.as_ref().map(|a| a.note.as_str()),
            Some("Said during the release retro")
        );
        Ok(())
    }

    #[test]
    fn lookups_outside_the_rotation_are_not_found() -> Result<()> {
        let db = TempDb::new("missing");
        let store = seeded_store(&db)?;

        assert!(matches!(store.lookup_conversation_by_rotation_index(4), Err(WallError::NotFound(_))));
        assert!(matches!(store.lookup_conversation_by_rotation_index(0), Err(WallError::NotFound(_))));
        assert!(matches!(
            store.fetch_full_conversation(ConversationId::new()),
            Err(WallError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn export_reads_back_what_was_seeded() -> Result<()> {
        let db = TempDb::new("export");
        let store = seeded_store(&db)?;

        let exported = store.export_archive()?;
        let conversations = &exported.quotearchive.conversations;
        assert_eq!(conversations.len(), 4);
        // oldest first
        assert_eq!(conversations[0].conversation[0].name, "Beth Smith");
        assert_eq!(conversations[0].conversation[0].date, "10/1/1997");
        assert_eq!(conversations[1].conversation[1].annotation, "Said during the release retro");
        assert_eq!(conversations[3].conversation[0].publish, "false");

        let out = std::env::temp_dir().join(format!("quotewall-export-{}.json", Ulid::new()));
        let digest = write_archive(&out, &exported)?;
        assert_eq!(digest.quotes, 5);
        let reread = read_archive(&out)?;
        fs::remove_file(&out)?;
        assert_eq!(reread, exported);
        Ok(())
    }

    #[test]
    fn archive_reader_accepts_capitalised_keys() -> Result<()> {
        let raw = r#"{ "quotearchive" : { "conversations" : [
            { "conversation" : [
                { "name" : "Bob McGowan", "Quote" : "I don't see us ever needing to change the product name again.", "date" : "3/14/1997", "publish" : "True" }
            ] } ] } }"#;
        let path = std::env::temp_dir().join(format!("quotewall-archive-{}.json", Ulid::new()));
        fs::write(&path, raw)?;
        let archive = read_archive(&path);
        fs::remove_file(&path)?;

        let archive = archive?;
        let first = &archive.quotearchive.conversations[0].conversation[0];
        assert_eq!(first.quote, "I don't see us ever needing to change the product name again.");
        assert!(first.annotation.is_empty());
        Ok(())
    }

    #[test]
    fn metrics_are_appended() -> Result<()> {
        let db = TempDb::new("metrics");
        let store = db.open_migrated()?;
        store.record_metric("/quickie", 12)?;
        store.record_metric("/quickie", 7)?;

        store.record_metric("/conversations/quickie", 3)?;

        let summary = store.metric_summary()?;
        assert_eq!(
            summary,
            vec![
                RouteMetrics { route: "/quickie".to_string(), requests: 2, total_ms: 19, max_ms: 12 },
                RouteMetrics {
                    route: "/conversations/quickie".to_string(),
                    requests: 1,
                    total_ms: 3,
                    max_ms: 3,
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn backup_copies_the_database() -> Result<()> {
        let db = TempDb::new("backup-src");
        let store = seeded_store(&db)?;
        let copy = TempDb::new("backup-dst");

        store.backup_database(&copy.path)?;
        assert!(store.backup_database(&copy.path).is_err());

        let restored = SqliteStore::open(&copy.path)?;
        assert_eq!(restored.rotation_count()?, 3);
        Ok(())
    }
}
