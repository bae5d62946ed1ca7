//! Loader Service - Ingests archived opportunity extracts into Postgres
//!
//! Responsibilities:
//! - Discover fiscal-year CSV extracts (FY<yyyy>_*.csv) in a data directory
//! - Decode each file through an ordered fallback chain of encodings and
//!   parse strategies (the extracts are inconsistently quoted and encoded)
//! - Rename source columns to the canonical schema and coerce field values
//!   (currency, boolean, date) with null-on-failure semantics
//! - Insert only records whose notice id is not already in the store,
//!   in bounded batches, with the table's unique constraint as the backstop
//! - Report a per-file and run-level outcome summary
//!
//! A failure on one file never aborts the run; the file is reported failed
//! and processing continues with the next one.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads archived opportunity extracts into Postgres")]
struct Args {
    /// Directory containing FY<yyyy> CSV extracts
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Load a single file instead of scanning the data directory
    #[arg(long)]
    file: Option<PathBuf>,

    /// Rows per INSERT batch
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Read and normalize without writing to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Print the run summary as JSON after the text summary
    #[arg(long, default_value = "false")]
    summary_json: bool,
}

#[derive(Debug, Clone)]
struct Config {
    host: String,
    port: String,
    database: String,
    user: String,
    password: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: std::env::var("DB_HOST").context("DB_HOST env var missing")?,
            port: std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string()),
            database: std::env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string()),
            user: std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("DB_PASSWORD").context("DB_PASSWORD env var missing")?,
        })
    }

    fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

// =============================================================================
// Target schema
// =============================================================================

const TABLE: &str = "archived_opportunities";

/// How a field's raw text is coerced before insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coercion {
    Text,
    Currency,
    Boolean,
    Date,
}

/// One target column: the source header label it is renamed from, the
/// canonical column name, and the coercion applied to its values.
#[derive(Debug)]
struct FieldSpec {
    label: &'static str,
    column: &'static str,
    kind: Coercion,
}

const fn field(label: &'static str, column: &'static str, kind: Coercion) -> FieldSpec {
    FieldSpec { label, column, kind }
}

/// Fixed alias table for the archived opportunity extracts. Source labels not
/// listed here pass through the mapper unchanged.
const FIELDS: &[FieldSpec] = &[
    field("NoticeId", "notice_id", Coercion::Text),
    field("Title", "title", Coercion::Text),
    field("Sol#", "solicitation_number", Coercion::Text),
    field("Department/Ind.Agency", "department_agency", Coercion::Text),
    field("CGAC", "cgac", Coercion::Text),
    field("Sub-Tier", "sub_tier", Coercion::Text),
    field("FPDS Code", "fpds_code", Coercion::Text),
    field("Office", "office", Coercion::Text),
    field("AAC Code", "aac_code", Coercion::Text),
    field("PostedDate", "posted_date", Coercion::Date),
    field("Type", "type", Coercion::Text),
    field("BaseType", "base_type", Coercion::Text),
    field("ArchiveType", "archive_type", Coercion::Text),
    field("ArchiveDate", "archive_date", Coercion::Date),
    field("SetASideCode", "set_aside_code", Coercion::Text),
    field("SetASide", "set_aside", Coercion::Text),
    field("ResponseDeadLine", "response_deadline", Coercion::Date),
    field("NaicsCode", "naics_code", Coercion::Text),
    field("ClassificationCode", "classification_code", Coercion::Text),
    field("PopStreetAddress", "pop_street_address", Coercion::Text),
    field("PopCity", "pop_city", Coercion::Text),
    field("PopState", "pop_state", Coercion::Text),
    field("PopZip", "pop_zip", Coercion::Text),
    field("PopCountry", "pop_country", Coercion::Text),
    field("Active", "active", Coercion::Boolean),
    field("AwardNumber", "award_number", Coercion::Text),
    field("AwardDate", "award_date", Coercion::Date),
    field("Award$", "award_amount", Coercion::Currency),
    field("Awardee", "awardee", Coercion::Text),
    field("PrimaryContactTitle", "primary_contact_title", Coercion::Text),
    field("PrimaryContactFullname", "primary_contact_fullname", Coercion::Text),
    field("PrimaryContactEmail", "primary_contact_email", Coercion::Text),
    field("PrimaryContactPhone", "primary_contact_phone", Coercion::Text),
    field("PrimaryContactFax", "primary_contact_fax", Coercion::Text),
    field("SecondaryContactTitle", "secondary_contact_title", Coercion::Text),
    field("SecondaryContactFullname", "secondary_contact_fullname", Coercion::Text),
    field("SecondaryContactEmail", "secondary_contact_email", Coercion::Text),
    field("SecondaryContactPhone", "secondary_contact_phone", Coercion::Text),
    field("SecondaryContactFax", "secondary_contact_fax", Coercion::Text),
    field("OrganizationType", "organization_type", Coercion::Text),
    field("State", "state", Coercion::Text),
    field("City", "city", Coercion::Text),
    field("ZipCode", "zip_code", Coercion::Text),
    field("CountryCode", "country_code", Coercion::Text),
    field("AdditionalInfoLink", "additional_info_link", Coercion::Text),
    field("Link", "link", Coercion::Text),
    field("Description", "description", Coercion::Text),
];

/// `INSERT INTO ... (cols) ` prefix covering every canonical column plus the
/// fiscal_year partition column, in FIELDS order.
fn insert_prefix() -> String {
    let columns: Vec<&str> = FIELDS
        .iter()
        .map(|f| f.column)
        .chain(std::iter::once("fiscal_year"))
        .collect();
    format!("INSERT INTO {} ({}) ", TABLE, columns.join(", "))
}

// =============================================================================
// Schema mapping
// =============================================================================

/// Source headers arrive with stray whitespace and embedded quote characters.
fn clean_label(label: &str) -> String {
    label.trim().replace('"', "")
}

/// Rename one cleaned source label to its canonical column name. Labels with
/// no alias entry pass through unchanged (never dropped), so downstream sees
/// a superset of canonical names plus any unexpected source columns.
fn canonical_label(label: &str) -> String {
    let cleaned = clean_label(label);
    FIELDS
        .iter()
        .find(|f| f.label == cleaned)
        .map(|f| f.column.to_string())
        .unwrap_or(cleaned)
}

fn map_headers(headers: &[String]) -> Vec<String> {
    headers.iter().map(|h| canonical_label(h)).collect()
}

// =============================================================================
// Type coercion
// =============================================================================
// Every coercion is total: it returns Some(value) or None, never an error.
// An unparseable field becomes null; the record is still loaded.

const TRUTHY: &[&str] = &["true", "yes", "1", "y"];
const FALSY: &[&str] = &["false", "no", "0", "n"];

// Timestamp shapes seen across fiscal years, most specific first. The
// offset-bearing forms cover both "-04" and "-04:00" suffixes.
const TIMESTAMP_TZ_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%#z"];
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"];

fn non_empty(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// "$1,234.50" -> 1234.50; empty or non-numeric remainder -> None.
fn parse_currency(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Case-insensitive truthy/falsy token match. Anything else, including the
/// empty string, is null - not false. (The original loader resolved "no
/// match" two different ways at two call sites; this is the single policy.)
fn parse_boolean(raw: &str) -> Option<bool> {
    let token = raw.trim().to_ascii_lowercase();
    if TRUTHY.contains(&token.as_str()) {
        Some(true)
    } else if FALSY.contains(&token.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Free-text date parsing through ordered format lists. Date-only inputs
/// normalize to midnight. Garbage and empty input yield None.
fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    for format in TIMESTAMP_TZ_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Some(parsed.naive_local());
        }
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, format) {
            return parsed.and_hms_opt(0, 0, 0);
        }
    }
    None
}

// =============================================================================
// Records
// =============================================================================

/// A coerced field value, parallel to one FieldSpec.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(Option<String>),
    Number(Option<f64>),
    Flag(Option<bool>),
    Timestamp(Option<NaiveDateTime>),
}

/// One fully normalized row, ready for insertion. `values` is parallel to
/// FIELDS; `notice_id` is a convenience copy of the natural key used for
/// deduplication (legitimately null in some extracts - such records are
/// never deduplicated and always inserted).
#[derive(Debug, Clone)]
struct OpportunityRecord {
    notice_id: Option<String>,
    fiscal_year: Option<i32>,
    values: Vec<FieldValue>,
}

fn row_to_map(headers: &[String], record: &csv::StringRecord) -> HashMap<String, String> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, header)| (header.clone(), record.get(idx).unwrap_or("").to_string()))
        .collect()
}

/// Coerce one mapped row into an OpportunityRecord. Total: coercion failures
/// become null fields, absent columns become null fields, the record itself
/// is always produced.
fn normalize_record(row: &HashMap<String, String>, fiscal_year: Option<i32>) -> OpportunityRecord {
    let mut values = Vec::with_capacity(FIELDS.len());
    for spec in FIELDS {
        let raw = row.get(spec.column).map(String::as_str).unwrap_or("");
        values.push(match spec.kind {
            Coercion::Text => FieldValue::Text(non_empty(raw)),
            Coercion::Currency => FieldValue::Number(parse_currency(raw)),
            Coercion::Boolean => FieldValue::Flag(parse_boolean(raw)),
            Coercion::Date => FieldValue::Timestamp(parse_date(raw)),
        });
    }
    let notice_id = row.get("notice_id").and_then(|v| non_empty(v));
    OpportunityRecord {
        notice_id,
        fiscal_year,
        values,
    }
}

// =============================================================================
// File reading
// =============================================================================
// The extracts are inconsistently quoted and encoded across fiscal years, so
// a single strict parse is not enough. Reading degrades through an ordered
// list of (parse mode, encoding) strategies: whole-file first, then chunked
// re-parsing that salvages whatever sections still parse. A strategy counts
// as successful only if it yields at least one data row.

const CHUNK_ROWS: usize = 10_000;

// encoding_rs resolves latin-1 and iso-8859-1 to the windows-1252 table, so
// the legacy four-entry encoding chain collapses to two distinct decoders.
const ENCODINGS: &[&encoding_rs::Encoding] = &[encoding_rs::UTF_8, encoding_rs::WINDOWS_1252];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Whole,
    Chunked,
}

impl ParseMode {
    fn name(self) -> &'static str {
        match self {
            ParseMode::Whole => "whole-file",
            ParseMode::Chunked => "chunked",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadStrategy {
    mode: ParseMode,
    encoding: &'static encoding_rs::Encoding,
}

fn read_strategies() -> Vec<ReadStrategy> {
    let mut strategies = Vec::new();
    for mode in [ParseMode::Whole, ParseMode::Chunked] {
        for encoding in ENCODINGS {
            strategies.push(ReadStrategy { mode, encoding });
        }
    }
    strategies
}

/// Raw parse result for one file: cleaned-but-unmapped headers, surviving
/// rows, and the count of malformed rows the parser skipped.
#[derive(Debug)]
struct RawTable {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
    skipped: usize,
    encoding: &'static str,
    mode: ParseMode,
}

enum ReadState {
    Trying(usize),
    Succeeded(RawTable),
    Exhausted,
}

/// Decode file bytes with one encoding. UTF-8 is strict (a decode error
/// rejects the strategy); windows-1252 maps every byte and cannot fail.
fn decode_bytes(bytes: &[u8], encoding: &'static encoding_rs::Encoding) -> Option<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return None;
    }
    Some(text.into_owned())
}

/// One-pass parse of the entire decoded file. Malformed rows (ragged quoting,
/// stray escapes) are skipped and counted, not fatal.
fn parse_rows(text: &str) -> Result<(Vec<String>, Vec<csv::StringRecord>, usize)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .escape(Some(b'\\'))
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(clean_label)
        .collect();

    // Rows with more fields than the header are the classic symptom of an
    // unquoted embedded delimiter; they are skipped and counted. Rows with
    // fewer fields are kept, with the missing fields read as empty.
    let expected = headers.len();
    let mut rows = Vec::new();
    let mut skipped = 0;
    for result in reader.records() {
        match result {
            Ok(record) if record.len() > expected => skipped += 1,
            Ok(record) => rows.push(record),
            Err(_) => skipped += 1,
        }
    }
    Ok((headers, rows, skipped))
}

/// Re-parse the file in bounded chunks of rows, each chunk prefixed with the
/// header line and parsed independently. A chunk poisoned by pathological
/// quoting is dropped (and counted) without taking the rest of the file down.
///
/// Splitting on raw newlines tears any record with a quoted embedded newline
/// across lines, so such records do not survive chunked mode. Whole-file mode
/// handles them; this is the last-resort salvage path for files that already
/// failed it.
fn parse_chunked(text: &str) -> Result<(Vec<String>, Vec<csv::StringRecord>, usize)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.lines();
    let header_line = lines.next().context("File has no header line")?;

    let mut headers: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    let mut skipped = 0;
    let mut buffer: Vec<&str> = Vec::with_capacity(CHUNK_ROWS);

    let mut flush = |buffer: &mut Vec<&str>,
                     headers: &mut Option<Vec<String>>,
                     rows: &mut Vec<csv::StringRecord>,
                     skipped: &mut usize| {
        if buffer.is_empty() {
            return;
        }
        let chunk_text = format!("{}\n{}\n", header_line, buffer.join("\n"));
        match parse_rows(&chunk_text) {
            Ok((chunk_headers, chunk_rows, chunk_skipped)) => {
                headers.get_or_insert(chunk_headers);
                rows.extend(chunk_rows);
                *skipped += chunk_skipped;
            }
            Err(_) => *skipped += buffer.len(),
        }
        buffer.clear();
    };

    for line in lines {
        buffer.push(line);
        if buffer.len() == CHUNK_ROWS {
            flush(&mut buffer, &mut headers, &mut rows, &mut skipped);
        }
    }
    flush(&mut buffer, &mut headers, &mut rows, &mut skipped);

    let headers = headers.context("No chunk parsed successfully")?;
    Ok((headers, rows, skipped))
}

fn attempt_strategy(bytes: &[u8], strategy: ReadStrategy) -> Option<RawTable> {
    let text = decode_bytes(bytes, strategy.encoding)?;
    let parsed = match strategy.mode {
        ParseMode::Whole => parse_rows(&text),
        ParseMode::Chunked => parse_chunked(&text),
    };
    let (headers, rows, skipped) = parsed.ok()?;
    Some(RawTable {
        headers,
        rows,
        skipped,
        encoding: strategy.encoding.name(),
        mode: strategy.mode,
    })
}

/// Drive the strategy list as a small state machine: try strategy i, accept
/// the first one that yields at least one data row, report the file
/// unreadable once the list is exhausted.
fn read_table(path: &Path) -> Result<RawTable> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.is_empty() {
        anyhow::bail!("File is empty: {}", path.display());
    }

    let strategies = read_strategies();
    let mut state = ReadState::Trying(0);
    loop {
        state = match state {
            ReadState::Trying(index) if index >= strategies.len() => ReadState::Exhausted,
            ReadState::Trying(index) => match attempt_strategy(&bytes, strategies[index]) {
                Some(table) if !table.rows.is_empty() => ReadState::Succeeded(table),
                _ => ReadState::Trying(index + 1),
            },
            ReadState::Succeeded(table) => return Ok(table),
            ReadState::Exhausted => anyhow::bail!(
                "No encoding or parse strategy produced rows from {}",
                path.display()
            ),
        };
    }
}

// =============================================================================
// Store admin
// =============================================================================

/// Idempotently add the unique constraint on notice_id. This is the actual
/// safety backstop against duplicate inserts; the in-memory key snapshot is
/// only an optimization to avoid constraint-violation round trips. Failure
/// here is fatal for the run.
async fn ensure_unique_constraint(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        DO $$
        BEGIN
            IF NOT EXISTS (
                SELECT 1 FROM pg_constraint
                WHERE conname = 'unique_notice_id'
            ) THEN
                ALTER TABLE archived_opportunities ADD CONSTRAINT unique_notice_id UNIQUE (notice_id);
            END IF;
        END $$;
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to ensure unique constraint on notice_id")?;
    Ok(())
}

// =============================================================================
// Deduplicating load
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct LoadCounts {
    inserted: u64,
    skipped_duplicates: u64,
}

// Postgres caps a single statement at 65,535 bind parameters; each record
// binds every canonical column plus fiscal_year.
const BIND_LIMIT: usize = 65_535;

fn max_batch_size() -> usize {
    BIND_LIMIT / (FIELDS.len() + 1)
}

/// Reject batch sizes that would panic the chunker (zero) or exceed the
/// statement parameter limit (every batch would fail).
fn validate_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        anyhow::bail!("--batch-size must be at least 1");
    }
    let max = max_batch_size();
    if batch_size > max {
        anyhow::bail!(
            "--batch-size {} exceeds the {}-row limit ({} bind parameters per statement)",
            batch_size,
            max,
            BIND_LIMIT
        );
    }
    Ok(())
}

/// Snapshot the non-null natural keys already in the store. Read once per
/// file, not per batch. Concurrent writers between snapshot and insert are
/// handled by the unique constraint, not by this set.
async fn fetch_existing_keys(pool: &PgPool) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT notice_id FROM archived_opportunities WHERE notice_id IS NOT NULL",
    )
    .fetch_all(pool)
    .await
    .context("Failed to snapshot existing notice ids")?;
    Ok(rows.into_iter().map(|row| row.0).collect())
}

/// Partition incoming records against the key snapshot. Records whose key is
/// in the snapshot are dropped and counted; null-keyed records are always
/// kept.
fn filter_new_records(
    records: Vec<OpportunityRecord>,
    existing: &HashSet<String>,
) -> (Vec<OpportunityRecord>, u64) {
    let original = records.len() as u64;
    let kept: Vec<OpportunityRecord> = records
        .into_iter()
        .filter(|record| match &record.notice_id {
            Some(key) => !existing.contains(key),
            None => true,
        })
        .collect();
    let skipped = original - kept.len() as u64;
    (kept, skipped)
}

fn batch_insert_builder(
    batch: &[OpportunityRecord],
    on_conflict_skip: bool,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(insert_prefix());
    builder.push_values(batch, |mut row, record| {
        for value in &record.values {
            match value {
                FieldValue::Text(v) => {
                    row.push_bind(v.clone());
                }
                FieldValue::Number(v) => {
                    row.push_bind(*v);
                }
                FieldValue::Flag(v) => {
                    row.push_bind(*v);
                }
                FieldValue::Timestamp(v) => {
                    row.push_bind(*v);
                }
            }
        }
        row.push_bind(record.fiscal_year);
    });
    if on_conflict_skip {
        builder.push(" ON CONFLICT (notice_id) DO NOTHING");
    }
    builder
}

async fn execute_batch(
    pool: &PgPool,
    batch: &[OpportunityRecord],
    on_conflict_skip: bool,
) -> Result<u64> {
    let mut builder = batch_insert_builder(batch, on_conflict_skip);
    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Insert the kept records in fixed-size batches. Each batch is one multi-row
/// INSERT, so it is atomic. If the plain insert fails (e.g. a constraint race
/// with a concurrent writer), the same batch is retried once with
/// ON CONFLICT DO NOTHING; rows that lose the race are counted as duplicates.
///
/// Earlier batches commit independently, so a mid-file failure returns the
/// counts accumulated so far alongside the error; the caller reports them
/// rather than losing track of rows already in the store.
async fn load_records(
    pool: &PgPool,
    records: Vec<OpportunityRecord>,
    batch_size: usize,
) -> Result<LoadCounts, (LoadCounts, anyhow::Error)> {
    let existing = match fetch_existing_keys(pool).await {
        Ok(existing) => existing,
        Err(e) => return Err((LoadCounts::default(), e)),
    };
    let (kept, skipped) = filter_new_records(records, &existing);

    let mut counts = LoadCounts {
        inserted: 0,
        skipped_duplicates: skipped,
    };

    for batch in kept.chunks(batch_size) {
        match execute_batch(pool, batch, false).await {
            Ok(inserted) => counts.inserted += inserted,
            Err(e) => {
                eprintln!("  Batch insert failed ({}), retrying with conflict skip", e);
                match execute_batch(pool, batch, true).await {
                    Ok(inserted) => {
                        counts.inserted += inserted;
                        counts.skipped_duplicates += batch.len() as u64 - inserted;
                    }
                    Err(e) => {
                        return Err((counts, e.context("Fallback batch insert failed")));
                    }
                }
            }
        }
    }

    Ok(counts)
}

// =============================================================================
// Orchestration
// =============================================================================

#[derive(Debug, Serialize)]
struct FileOutcome {
    file: String,
    fiscal_year: Option<i32>,
    status: &'static str,
    inserted: u64,
    skipped_duplicates: u64,
    skipped_malformed: u64,
    error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    attempted: usize,
    succeeded: usize,
    failed: usize,
    inserted: u64,
    skipped_duplicates: u64,
    skipped_malformed: u64,
    files: Vec<FileOutcome>,
}

impl RunSummary {
    fn record(&mut self, outcome: FileOutcome) {
        self.attempted += 1;
        if outcome.error.is_none() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.inserted += outcome.inserted;
        self.skipped_duplicates += outcome.skipped_duplicates;
        self.skipped_malformed += outcome.skipped_malformed;
        self.files.push(outcome);
    }
}

/// Extract the partition key from an FY<4-digit-year> token in the filename.
/// Absent token means a null fiscal year; the file is still loaded.
fn extract_fiscal_year(filename: &str) -> Option<i32> {
    let bytes = filename.as_bytes();
    let mut index = 0;
    while index + 6 <= bytes.len() {
        if bytes[index] == b'F'
            && bytes[index + 1] == b'Y'
            && bytes[index + 2..index + 6].iter().all(u8::is_ascii_digit)
        {
            return filename[index + 2..index + 6].parse().ok();
        }
        index += 1;
    }
    None
}

/// All .csv files in the data directory, sorted by name so fiscal years load
/// in a stable order.
fn discover_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();
    Ok(files)
}

struct FileCounts {
    inserted: u64,
    skipped_duplicates: u64,
    skipped_malformed: u64,
    error: Option<String>,
}

/// Run Reader -> Mapper -> Normalizer for one file, yielding insertable
/// records and the count of malformed rows the reader skipped.
fn read_records(path: &Path, fiscal_year: Option<i32>) -> Result<(Vec<OpportunityRecord>, u64)> {
    let table = read_table(path)?;
    println!(
        "  Read {} rows ({} encoding, {} parse); {} malformed rows skipped",
        table.rows.len(),
        table.encoding,
        table.mode.name(),
        table.skipped
    );

    let headers = map_headers(&table.headers);
    let records = table
        .rows
        .iter()
        .map(|row| normalize_record(&row_to_map(&headers, row), fiscal_year))
        .collect();
    Ok((records, table.skipped as u64))
}

/// Run Reader -> Mapper -> Normalizer -> Loader for one file. A load failure
/// partway through still returns the counts committed before it, with the
/// error attached.
async fn process_file(
    pool: &PgPool,
    path: &Path,
    fiscal_year: Option<i32>,
    batch_size: usize,
    dry_run: bool,
) -> Result<FileCounts> {
    let (records, skipped_malformed) = read_records(path, fiscal_year)?;

    if dry_run {
        let existing = fetch_existing_keys(pool).await?;
        let (kept, skipped) = filter_new_records(records, &existing);
        println!(
            "  Dry run - would insert {} records ({} already present)",
            kept.len(),
            skipped
        );
        return Ok(FileCounts {
            inserted: 0,
            skipped_duplicates: skipped,
            skipped_malformed,
            error: None,
        });
    }

    match load_records(pool, records, batch_size).await {
        Ok(counts) => {
            println!(
                "  Inserted {} new records, skipped {} duplicates",
                counts.inserted, counts.skipped_duplicates
            );
            Ok(FileCounts {
                inserted: counts.inserted,
                skipped_duplicates: counts.skipped_duplicates,
                skipped_malformed,
                error: None,
            })
        }
        Err((counts, e)) => Ok(FileCounts {
            inserted: counts.inserted,
            skipped_duplicates: counts.skipped_duplicates,
            skipped_malformed,
            error: Some(format!("{:#}", e)),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    validate_batch_size(args.batch_size)?;
    let config = Config::from_env()?;

    println!("=== Opportunity Archive Loader ===");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;

    // Without the uniqueness guarantee the run cannot proceed safely, so
    // constraint setup happens before any file is touched.
    if !args.dry_run {
        ensure_unique_constraint(&pool).await?;
    }

    let files = match &args.file {
        Some(path) => vec![path.clone()],
        None => discover_files(&args.data_dir)?,
    };
    if files.is_empty() {
        anyhow::bail!("No CSV files found in {}", args.data_dir.display());
    }
    println!("Found {} file(s) to process", files.len());

    let mut summary = RunSummary::default();

    for path in &files {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let fiscal_year = extract_fiscal_year(&file_name);

        println!(
            "\n[{}] fiscal year: {}",
            file_name,
            fiscal_year.map_or("none".to_string(), |year| year.to_string())
        );

        match process_file(&pool, path, fiscal_year, args.batch_size, args.dry_run).await {
            Ok(counts) => {
                if let Some(error) = &counts.error {
                    eprintln!("  ✗ Load failed mid-file: {}", error);
                }
                let status = if counts.error.is_none() { "loaded" } else { "failed" };
                summary.record(FileOutcome {
                    file: file_name,
                    fiscal_year,
                    status,
                    inserted: counts.inserted,
                    skipped_duplicates: counts.skipped_duplicates,
                    skipped_malformed: counts.skipped_malformed,
                    error: counts.error,
                })
            }
            Err(e) => {
                eprintln!("  ✗ Failed: {:#}", e);
                summary.record(FileOutcome {
                    file: file_name,
                    fiscal_year,
                    status: "failed",
                    inserted: 0,
                    skipped_duplicates: 0,
                    skipped_malformed: 0,
                    error: Some(format!("{:#}", e)),
                });
            }
        }
    }

    println!("\n=== Load Summary ===");
    println!("Files attempted: {}", summary.attempted);
    println!("Files succeeded: {}", summary.succeeded);
    println!("Files failed:    {}", summary.failed);
    println!("Records inserted:            {}", summary.inserted);
    println!("Records skipped (duplicate): {}", summary.skipped_duplicates);
    println!("Rows skipped (malformed):    {}", summary.skipped_malformed);

    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn strings(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|l| l.to_string()).collect()
    }

    fn record(notice_id: Option<&str>) -> OpportunityRecord {
        OpportunityRecord {
            notice_id: notice_id.map(|id| id.to_string()),
            fiscal_year: Some(2015),
            values: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // SCHEMA MAPPER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_map_headers_known_aliases() {
        let mapped = map_headers(&strings(&["NoticeId", "Award$", "Department/Ind.Agency"]));
        assert_eq!(mapped, strings(&["notice_id", "award_amount", "department_agency"]));
    }

    #[test]
    fn test_map_headers_unknown_labels_pass_through() {
        let mapped = map_headers(&strings(&["NoticeId", "SomethingNew"]));
        assert_eq!(mapped, strings(&["notice_id", "SomethingNew"]));
    }

    #[test]
    fn test_map_headers_strips_quotes_and_whitespace() {
        let mapped = map_headers(&strings(&["  \"NoticeId\"  ", " Title"]));
        assert_eq!(mapped, strings(&["notice_id", "title"]));
    }

    #[test]
    fn test_map_headers_never_drops_columns() {
        let input = strings(&["NoticeId", "Mystery", "Title", "AnotherMystery"]);
        let mapped = map_headers(&input);
        assert_eq!(mapped.len(), input.len());
    }

    // -------------------------------------------------------------------------
    // CURRENCY COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_currency_with_symbol_and_commas() {
        assert_eq!(parse_currency("$1,234.50"), Some(1234.50));
    }

    #[test]
    fn test_currency_plain_number() {
        assert_eq!(parse_currency("2000"), Some(2000.0));
    }

    #[test]
    fn test_currency_internal_whitespace() {
        assert_eq!(parse_currency(" $ 1,000,000 "), Some(1_000_000.0));
    }

    #[test]
    fn test_currency_empty_is_null() {
        assert_eq!(parse_currency(""), None);
        assert_eq!(parse_currency("   "), None);
    }

    #[test]
    fn test_currency_garbage_is_null() {
        assert_eq!(parse_currency("abc"), None);
        assert_eq!(parse_currency("$N/A"), None);
    }

    // -------------------------------------------------------------------------
    // BOOLEAN COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_boolean_truthy_tokens() {
        for token in ["true", "Yes", "1", "y", "TRUE"] {
            assert_eq!(parse_boolean(token), Some(true), "token: {}", token);
        }
    }

    #[test]
    fn test_boolean_falsy_tokens() {
        for token in ["false", "No", "0", "N", "FALSE"] {
            assert_eq!(parse_boolean(token), Some(false), "token: {}", token);
        }
    }

    #[test]
    fn test_boolean_no_match_is_null_not_false() {
        assert_eq!(parse_boolean("maybe"), None);
        assert_eq!(parse_boolean(""), None);
        assert_eq!(parse_boolean("  "), None);
    }

    // -------------------------------------------------------------------------
    // DATE COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_date_iso_date_roundtrip() {
        let parsed = parse_date("2015-08-05").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2015, 8, 5).unwrap());
        assert_eq!(parsed.time(), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn test_date_us_format() {
        let parsed = parse_date("08/05/2015").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2015, 8, 5).unwrap());
    }

    #[test]
    fn test_date_timestamp_with_offset() {
        let parsed = parse_date("2015-08-05 13:24:41.277-04").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2015, 8, 5).unwrap());
    }

    #[test]
    fn test_date_timestamp_with_colon_offset() {
        let parsed = parse_date("2015-08-21 16:00:00-04:00").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2015, 8, 21).unwrap());
    }

    #[test]
    fn test_date_plain_timestamp() {
        let parsed = parse_date("2015-08-05 13:24:41").unwrap();
        assert_eq!(parsed.time(), chrono::NaiveTime::from_hms_opt(13, 24, 41).unwrap());
    }

    #[test]
    fn test_date_garbage_is_null() {
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("2015-13-45"), None);
    }

    // -------------------------------------------------------------------------
    // RECORD NORMALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_record_coerces_typed_fields() {
        let mut row = HashMap::new();
        row.insert("notice_id".to_string(), "abc-123".to_string());
        row.insert("award_amount".to_string(), "$1,234.50".to_string());
        row.insert("active".to_string(), "Yes".to_string());
        row.insert("posted_date".to_string(), "2015-08-05".to_string());

        let rec = normalize_record(&row, Some(2015));
        assert_eq!(rec.notice_id.as_deref(), Some("abc-123"));
        assert_eq!(rec.fiscal_year, Some(2015));
        assert_eq!(rec.values.len(), FIELDS.len());

        let amount_idx = FIELDS.iter().position(|f| f.column == "award_amount").unwrap();
        assert_eq!(rec.values[amount_idx], FieldValue::Number(Some(1234.50)));
        let active_idx = FIELDS.iter().position(|f| f.column == "active").unwrap();
        assert_eq!(rec.values[active_idx], FieldValue::Flag(Some(true)));
    }

    #[test]
    fn test_normalize_record_unparseable_fields_become_null() {
        let mut row = HashMap::new();
        row.insert("notice_id".to_string(), "abc-123".to_string());
        row.insert("award_amount".to_string(), "call for pricing".to_string());
        row.insert("active".to_string(), "maybe".to_string());
        row.insert("posted_date".to_string(), "unknown".to_string());

        let rec = normalize_record(&row, None);
        let amount_idx = FIELDS.iter().position(|f| f.column == "award_amount").unwrap();
        assert_eq!(rec.values[amount_idx], FieldValue::Number(None));
        let active_idx = FIELDS.iter().position(|f| f.column == "active").unwrap();
        assert_eq!(rec.values[active_idx], FieldValue::Flag(None));
        let posted_idx = FIELDS.iter().position(|f| f.column == "posted_date").unwrap();
        assert_eq!(rec.values[posted_idx], FieldValue::Timestamp(None));
    }

    #[test]
    fn test_normalize_record_absent_columns_are_null() {
        let row = HashMap::new();
        let rec = normalize_record(&row, Some(2020));
        assert_eq!(rec.notice_id, None);
        assert!(rec.values.iter().all(|v| matches!(
            v,
            FieldValue::Text(None)
                | FieldValue::Number(None)
                | FieldValue::Flag(None)
                | FieldValue::Timestamp(None)
        )));
    }

    // -------------------------------------------------------------------------
    // FISCAL YEAR DERIVATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_fiscal_year_from_filename() {
        assert_eq!(extract_fiscal_year("FY2015_archived_opportunities.csv"), Some(2015));
    }

    #[test]
    fn test_fiscal_year_token_mid_filename() {
        assert_eq!(extract_fiscal_year("archive_FY2020_extract.csv"), Some(2020));
    }

    #[test]
    fn test_fiscal_year_absent_token() {
        assert_eq!(extract_fiscal_year("opportunities.csv"), None);
        assert_eq!(extract_fiscal_year("FY20_short.csv"), None);
    }

    // -------------------------------------------------------------------------
    // DUPLICATE FILTERING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_filter_drops_keys_in_snapshot_keeps_new_and_null() {
        let existing: HashSet<String> = ["A", "B"].iter().map(|k| k.to_string()).collect();
        let incoming = vec![record(Some("A")), record(Some("C")), record(None)];

        let (kept, skipped) = filter_new_records(incoming, &existing);
        assert_eq!(skipped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].notice_id.as_deref(), Some("C"));
        assert_eq!(kept[1].notice_id, None);
    }

    #[test]
    fn test_filter_empty_snapshot_keeps_everything() {
        let existing = HashSet::new();
        let incoming = vec![record(Some("A")), record(None)];
        let (kept, skipped) = filter_new_records(incoming, &existing);
        assert_eq!(skipped, 0);
        assert_eq!(kept.len(), 2);
    }

    // -------------------------------------------------------------------------
    // INSERT STATEMENT TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_insert_prefix_covers_all_columns() {
        let prefix = insert_prefix();
        assert!(prefix.starts_with("INSERT INTO archived_opportunities (notice_id, "));
        assert!(prefix.ends_with("fiscal_year) "));
        // 47 canonical columns plus fiscal_year.
        assert_eq!(prefix.matches(',').count(), FIELDS.len());
    }

    // -------------------------------------------------------------------------
    // BATCH SIZE VALIDATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_batch_size_zero_is_rejected() {
        assert!(validate_batch_size(0).is_err());
    }

    #[test]
    fn test_batch_size_over_bind_limit_is_rejected() {
        assert!(validate_batch_size(max_batch_size() + 1).is_err());
        assert!(validate_batch_size(100_000).is_err());
    }

    #[test]
    fn test_batch_size_in_range_is_accepted() {
        assert!(validate_batch_size(1).is_ok());
        assert!(validate_batch_size(1000).is_ok());
        assert!(validate_batch_size(max_batch_size()).is_ok());
    }

    #[test]
    fn test_max_batch_size_respects_bind_limit() {
        // One bind per canonical column plus fiscal_year, per row.
        assert!(max_batch_size() * (FIELDS.len() + 1) <= BIND_LIMIT);
    }

    // -------------------------------------------------------------------------
    // FILE READER TESTS
    // -------------------------------------------------------------------------

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_read_table_well_formed_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "FY2015_ok.csv",
            b"NoticeId,Title\nabc-1,First\nabc-2,Second\n",
        );

        let table = read_table(&path).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.skipped, 0);
        assert_eq!(table.mode, ParseMode::Whole);
        assert_eq!(table.headers, strings(&["NoticeId", "Title"]));
    }

    #[test]
    fn test_read_table_falls_back_past_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        // 0xE9 is "é" in windows-1252 but an invalid UTF-8 sequence.
        let path = write_file(&dir, "latin.csv", b"NoticeId,Title\nabc-1,Caf\xe9\n");

        let table = read_table(&path).unwrap();
        assert_eq!(table.encoding, "windows-1252");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].get(1), Some("Café"));
    }

    #[test]
    fn test_read_table_empty_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.csv", b"");
        assert!(read_table(&path).is_err());
    }

    #[test]
    fn test_read_table_header_only_file_is_unreadable() {
        // Zero data rows from every strategy means the file is reported
        // unreadable rather than silently loading nothing.
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "header_only.csv", b"NoticeId,Title\n");
        assert!(read_table(&path).is_err());
    }

    #[test]
    fn test_parse_rows_skips_rows_with_embedded_delimiters() {
        // The third row has an unquoted comma, so it carries more fields than
        // the header; it is skipped, the rest survive.
        let text = "NoticeId,Title\nabc-1,First\nabc-2,Second, with a stray comma\nabc-3,Third\n";
        let (_, rows, skipped) = parse_rows(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_parse_rows_keeps_short_rows() {
        let text = "NoticeId,Title,Office\nabc-1,First\n";
        let (_, rows, skipped) = parse_rows(text).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 0);
        assert_eq!(rows[0].get(2), None);
    }

    #[test]
    fn test_parse_rows_strips_bom() {
        let text = "\u{feff}NoticeId,Title\nabc-1,First\n";
        let (headers, rows, _) = parse_rows(text).unwrap();
        assert_eq!(headers[0], "NoticeId");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_chunked_concatenates_chunks() {
        let text = "NoticeId,Title\nabc-1,a\nabc-2,b\nabc-3,c\n";
        let (headers, rows, skipped) = parse_chunked(text).unwrap();
        assert_eq!(headers, strings(&["NoticeId", "Title"]));
        assert_eq!(rows.len(), 3);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_parse_chunked_salvages_around_bad_rows() {
        let text = "NoticeId,Title\nabc-1,good\nabc-2,bad,extra,fields\nabc-3,good\n";
        let (_, rows, skipped) = parse_chunked(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_decode_bytes_utf8_strict() {
        assert!(decode_bytes(b"abc\xe9", encoding_rs::UTF_8).is_none());
        assert_eq!(
            decode_bytes(b"abc\xe9", encoding_rs::WINDOWS_1252).as_deref(),
            Some("abcé")
        );
    }

    #[test]
    fn test_read_strategies_whole_before_chunked() {
        let strategies = read_strategies();
        assert_eq!(strategies.len(), 4);
        assert_eq!(strategies[0].mode, ParseMode::Whole);
        assert_eq!(strategies.last().unwrap().mode, ParseMode::Chunked);
    }

    // -------------------------------------------------------------------------
    // RUN SUMMARY AND FAULT ISOLATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_run_summary_aggregates_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(FileOutcome {
            file: "FY2014_a.csv".to_string(),
            fiscal_year: Some(2014),
            status: "loaded",
            inserted: 10,
            skipped_duplicates: 2,
            skipped_malformed: 1,
            error: None,
        });
        summary.record(FileOutcome {
            file: "FY2015_b.csv".to_string(),
            fiscal_year: Some(2015),
            status: "failed",
            inserted: 4,
            skipped_duplicates: 0,
            skipped_malformed: 0,
            error: Some("Fallback batch insert failed".to_string()),
        });

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        // Batches committed before a mid-file failure still count in the
        // run totals even though the file itself is reported failed.
        assert_eq!(summary.inserted, 14);
        assert_eq!(summary.skipped_duplicates, 2);
        assert_eq!(summary.skipped_malformed, 1);
    }

    #[test]
    fn test_unreadable_file_does_not_stop_later_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir, "FY2014_a.csv", b"NoticeId,Title\nabc-1,First\n");
        // Header-only: every strategy yields zero rows, so reading fails.
        write_file(&dir, "FY2015_b.csv", b"NoticeId,Title\n");
        write_file(&dir, "FY2016_c.csv", b"NoticeId,Title\nabc-2,Third\n");

        let files = discover_files(dir.path()).unwrap();
        assert_eq!(files.len(), 3);

        let mut summary = RunSummary::default();
        for path in &files {
            let file_name = path.file_name().unwrap().to_string_lossy().to_string();
            let fiscal_year = extract_fiscal_year(&file_name);
            match read_records(path, fiscal_year) {
                Ok((records, skipped_malformed)) => summary.record(FileOutcome {
                    file: file_name,
                    fiscal_year,
                    status: "loaded",
                    inserted: records.len() as u64,
                    skipped_duplicates: 0,
                    skipped_malformed,
                    error: None,
                }),
                Err(e) => summary.record(FileOutcome {
                    file: file_name,
                    fiscal_year,
                    status: "failed",
                    inserted: 0,
                    skipped_duplicates: 0,
                    skipped_malformed: 0,
                    error: Some(format!("{:#}", e)),
                }),
            }
        }

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.files[0].status, "loaded");
        assert_eq!(summary.files[1].status, "failed");
        // The file after the unreadable one is still processed.
        assert_eq!(summary.files[2].status, "loaded");
        assert_eq!(summary.files[2].fiscal_year, Some(2016));
    }

    // -------------------------------------------------------------------------
    // END-TO-END NORMALIZATION (no database)
    // -------------------------------------------------------------------------

    #[test]
    fn test_file_to_records_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "FY2015_archived_opportunities.csv",
            b"NoticeId,Title,Award$,Active,PostedDate\n\
              abc-1,Road Repair,\"$10,000.00\",Yes,2015-08-05\n\
              ,Untitled,,,\n",
        );

        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        let fiscal_year = extract_fiscal_year(&file_name);
        assert_eq!(fiscal_year, Some(2015));

        let table = read_table(&path).unwrap();
        let headers = map_headers(&table.headers);
        let records: Vec<OpportunityRecord> = table
            .rows
            .iter()
            .map(|row| normalize_record(&row_to_map(&headers, row), fiscal_year))
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].notice_id.as_deref(), Some("abc-1"));
        assert_eq!(records[0].fiscal_year, Some(2015));
        // The null-keyed record is still produced and loadable.
        assert_eq!(records[1].notice_id, None);
        assert_eq!(records[1].fiscal_year, Some(2015));
    }
}
