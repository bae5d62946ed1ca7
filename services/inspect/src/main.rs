//! Inspect Service - Ad hoc checks against the opportunity archive
//!
//! Companion tooling for the loader, not part of the ingestion pipeline:
//! - Verify database connectivity, table existence, and schema
//! - Report row counts, notice id coverage, and duplicate-key groups
//! - Preview the raw header row of a source extract before loading it
//!
//! Usage:
//!   cargo run --bin inspect -- --check
//!   cargo run --bin inspect -- --stats --sample 10
//!   cargo run --bin inspect -- --headers data/FY2015_archived_opportunities.csv

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};

const TABLE: &str = "archived_opportunities";

#[derive(Parser, Debug)]
#[command(name = "inspect", about = "Ad hoc checks against the opportunity archive")]
struct Args {
    /// Check connectivity, table existence, and schema
    #[arg(long, default_value = "false")]
    check: bool,

    /// Report row counts, notice id coverage, and duplicate keys
    #[arg(long, default_value = "false")]
    stats: bool,

    /// Print the raw and cleaned header labels of a source CSV file
    #[arg(long)]
    headers: Option<PathBuf>,

    /// Number of sample rows to print in stats mode
    #[arg(long, default_value = "5")]
    sample: i64,
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
// Connectivity and schema check
// =============================================================================

async fn run_check(pool: &PgPool) -> Result<()> {
    println!("✓ Database connection successful");

    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = 'public'
            AND table_name = $1
        )
        "#,
    )
    .bind(TABLE)
    .fetch_one(pool)
    .await?;

    println!("✓ Table '{}' exists: {}", TABLE, table_exists);
    if !table_exists {
        println!("  Apply db/schema.sql before running the loader");
        return Ok(());
    }

    let columns: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT column_name, data_type, is_nullable
        FROM information_schema.columns
        WHERE table_name = $1
        ORDER BY ordinal_position
        "#,
    )
    .bind(TABLE)
    .fetch_all(pool)
    .await?;

    println!("\nTable schema ({} columns):", columns.len());
    for (name, data_type, nullable) in &columns {
        let null_note = if nullable == "YES" { "NULL" } else { "NOT NULL" };
        println!("  {}: {} ({})", name, data_type, null_note);
    }

    let constraint_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = 'unique_notice_id')",
    )
    .fetch_one(pool)
    .await?;
    println!("\nUnique constraint on notice_id: {}", constraint_exists);

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", TABLE))
        .fetch_one(pool)
        .await?;
    println!("Current row count: {}", count);

    Ok(())
}

// =============================================================================
// Row and duplicate statistics
// =============================================================================

async fn run_stats(pool: &PgPool, sample: i64) -> Result<()> {
    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", TABLE))
        .fetch_one(pool)
        .await?;
    let with_key: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE notice_id IS NOT NULL",
        TABLE
    ))
    .fetch_one(pool)
    .await?;
    let distinct: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(DISTINCT notice_id) FROM {} WHERE notice_id IS NOT NULL",
        TABLE
    ))
    .fetch_one(pool)
    .await?;

    println!("Total records: {}", total);
    println!("Records with notice_id: {}", with_key);
    println!("Records with NULL notice_id: {}", total - with_key);
    println!("Distinct notice_ids: {}", distinct);

    // With the unique constraint in place this should always be empty; a
    // non-empty result means the constraint was added after duplicate data.
    let duplicates: Vec<(String, i64)> = sqlx::query_as(&format!(
        r#"
        SELECT notice_id, COUNT(*)
        FROM {}
        WHERE notice_id IS NOT NULL
        GROUP BY notice_id
        HAVING COUNT(*) > 1
        ORDER BY COUNT(*) DESC
        LIMIT 10
        "#,
        TABLE
    ))
    .fetch_all(pool)
    .await?;

    if duplicates.is_empty() {
        println!("Duplicate notice_id groups: none");
    } else {
        println!("Duplicate notice_id groups (top {}):", duplicates.len());
        for (notice_id, count) in &duplicates {
            println!("  '{}': {} records", notice_id, count);
        }
    }

    let per_year: Vec<(Option<i32>, i64)> = sqlx::query_as(&format!(
        "SELECT fiscal_year, COUNT(*) FROM {} GROUP BY fiscal_year ORDER BY fiscal_year",
        TABLE
    ))
    .fetch_all(pool)
    .await?;

    println!("\nRecords per fiscal year:");
    for (year, count) in &per_year {
        match year {
            Some(year) => println!("  {}: {}", year, count),
            None => println!("  (none): {}", count),
        }
    }

    let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(&format!(
        "SELECT notice_id, title FROM {} LIMIT $1",
        TABLE
    ))
    .bind(sample)
    .fetch_all(pool)
    .await?;

    println!("\nSample records:");
    for (notice_id, title) in &rows {
        let title = title.as_deref().unwrap_or("");
        let truncated: String = title.chars().take(50).collect();
        println!(
            "  notice_id: {:?}, title: '{}{}'",
            notice_id,
            truncated,
            if title.chars().count() > 50 { "..." } else { "" }
        );
    }

    Ok(())
}

// =============================================================================
// Source file header preview
// =============================================================================

/// Decode just enough of a source file to show its header row. Mirrors the
/// loader's fallback: strict UTF-8 first, then windows-1252.
fn decode_with_fallback(bytes: &[u8]) -> String {
    let (text, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    text.into_owned()
}

fn clean_label(label: &str) -> String {
    label.trim().replace('"', "")
}

fn run_headers(path: &Path) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = decode_with_fallback(&bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    println!("Raw columns ({}):", headers.len());
    for (idx, header) in headers.iter().enumerate() {
        println!("  {:2}: '{}'", idx + 1, header);
    }

    println!("\nCleaned columns:");
    for (idx, header) in headers.iter().enumerate() {
        println!("  {:2}: '{}'", idx + 1, clean_label(header));
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Opportunity Archive Inspect ===");

    if let Some(path) = &args.headers {
        // Header preview needs no database connection.
        return run_headers(path);
    }

    if !args.check && !args.stats {
        anyhow::bail!(
            "Must specify a mode:\n  \
             --check for connectivity and schema,\n  \
             --stats for row and duplicate statistics, or\n  \
             --headers <path> for a source file header preview"
        );
    }

    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;

    if args.check {
        run_check(&pool).await?;
    }
    if args.stats {
        run_stats(&pool, args.sample).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_label() {
        assert_eq!(clean_label("  \"NoticeId\"  "), "NoticeId");
        assert_eq!(clean_label("Title"), "Title");
    }

    #[test]
    fn test_decode_with_fallback_valid_utf8() {
        assert_eq!(decode_with_fallback(b"NoticeId,Title"), "NoticeId,Title");
    }

    #[test]
    fn test_decode_with_fallback_latin_bytes() {
        // 0xE9 is invalid UTF-8 but "é" in windows-1252.
        assert_eq!(decode_with_fallback(b"Caf\xe9"), "Café");
    }
}
