use anyhow::{Context, Result};
use indexmap::IndexSet;
use log::warn;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use crate::db::{
    helpers::{
        decode_blob, encode_blob, format_datetime, parse_category, parse_datetime,
        parse_priority, parse_status,
    },
    models::{Enrichment, Metadata, Record, RecordFilter},
};

const RECORD_COLUMNS: &str = "id, category, content, tags, source_app, trigger_used, created_at, \
     status, priority, metadata, enrichment";

/// Result of reading every row of the records table.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(Vec<Record>),
    /// The first row failed to decode a mandatory field.
    Corrupt(anyhow::Error),
}

fn row_to_record(row: &Row) -> Result<Record> {
    // Mandatory fields, in dependency order.
    let id: String = row.get("id").context("failed to read id")?;
    let category: String = row.get("category").context("failed to read category")?;
    let category = parse_category(&category)?;
    let content: String = row.get("content").context("failed to read content")?;
    let trigger_used: String = row
        .get("trigger_used")
        .context("failed to read trigger_used")?;
    let created_at: String = row.get("created_at").context("failed to read created_at")?;
    let created_at = parse_datetime(&created_at, "created_at")?;
    let status: String = row.get("status").context("failed to read status")?;
    let status = parse_status(&status)?;

    Ok(Record {
        tags: optional_field(&id, "tags", row, |raw| decode_blob::<IndexSet<String>>(raw, "tags"))
            .unwrap_or_default(),
        source_app: optional_field(&id, "source_app", row, |raw| Ok(raw.to_string())),
        priority: optional_field(&id, "priority", row, parse_priority),
        metadata: optional_field(&id, "metadata", row, |raw| {
            decode_blob::<Metadata>(raw, "metadata")
        }),
        enrichment: optional_field(&id, "enrichment", row, |raw| {
            decode_blob::<Enrichment>(raw, "enrichment")
        }),
        id,
        category,
        content,
        trigger_used,
        created_at,
        status,
    })
}

/// Optional columns never fail a row; an undecodable value is logged and dropped.
fn optional_field<T>(
    id: &str,
    column: &str,
    row: &Row,
    decode: impl FnOnce(&str) -> Result<T>,
) -> Option<T> {
    let raw: Option<String> = match row.get(column) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("record {id}: unreadable {column}: {err}");
            return None;
        }
    };
    match raw.as_deref().map(decode).transpose() {
        Ok(value) => value,
        Err(err) => {
            warn!("record {id}: dropping undecodable {column}: {err:#}");
            None
        }
    }
}

pub fn upsert_record(conn: &Connection, record: &Record) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records (id, category, content, tags, source_app, trigger_used, created_at, status, priority, metadata, enrichment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.id,
            record.category.as_str(),
            record.content,
            encode_blob(&record.tags, "tags")?,
            record.source_app,
            record.trigger_used,
            format_datetime(&record.created_at),
            record.status.as_str(),
            record.priority.map(|p| p.as_str()),
            record
                .metadata
                .as_ref()
                .map(|m| encode_blob(m, "metadata"))
                .transpose()?,
            record
                .enrichment
                .as_ref()
                .map(|e| encode_blob(e, "enrichment"))
                .transpose()?,
        ],
    )
    .with_context(|| format!("failed to save record {}", record.id))?;
    Ok(())
}

pub fn delete_record(conn: &Connection, id: &str) -> Result<bool> {
    let removed = conn
        .execute("DELETE FROM records WHERE id = ?1", params![id])
        .with_context(|| format!("failed to delete record {id}"))?;
    Ok(removed > 0)
}

pub fn get_record(conn: &Connection, id: &str) -> Result<Option<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
    conn.query_row(&sql, params![id], |row| Ok(row_to_record(row)))
        .optional()?
        .transpose()
}

/// Loads every record newest-first.
///
/// A bad first row condemns the whole file; bad later rows are skipped.
pub fn load_records(conn: &Connection) -> Result<LoadOutcome> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY created_at DESC");
    let mut stmt = conn.prepare(&sql).context("failed to prepare record load")?;
    let mut rows = stmt.query([]).context("failed to query records")?;

    let mut records = Vec::new();
    let mut index = 0usize;
    while let Some(row) = rows.next().context("failed to step record rows")? {
        match row_to_record(row) {
            Ok(record) => records.push(record),
            Err(err) if index == 0 => return Ok(LoadOutcome::Corrupt(err)),
            Err(err) => warn!("skipping undecodable record at row {index}: {err:#}"),
        }
        index += 1;
    }

    Ok(LoadOutcome::Loaded(records))
}

fn collect_lenient(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(sql)
        .context("failed to prepare record query")?;
    let mut rows = stmt.query(args).context("failed to run record query")?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        match row_to_record(row) {
            Ok(record) => records.push(record),
            Err(err) => warn!("skipping undecodable record: {err:#}"),
        }
    }
    Ok(records)
}

/// Indexed columns only; newest first.
pub fn filter_records(conn: &Connection, filter: &RecordFilter) -> Result<Vec<Record>> {
    let category = filter.category.map(|c| c.as_str());
    let status = filter.status.map(|s| s.as_str());
    let priority = filter.priority.map(|p| p.as_str());

    let mut clauses = Vec::new();
    let mut args: Vec<&dyn ToSql> = Vec::new();
    if let Some(category) = category.as_ref() {
        clauses.push("category = ?");
        args.push(category);
    }
    if let Some(status) = status.as_ref() {
        clauses.push("status = ?");
        args.push(status);
    }
    if let Some(priority) = priority.as_ref() {
        clauses.push("priority = ?");
        args.push(priority);
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records {where_sql} ORDER BY created_at DESC");
    collect_lenient(conn, &sql, &args)
}

/// Content or any tag contains `needle`, ignoring case; newest first.
pub fn search_records(conn: &Connection, needle: &str) -> Result<Vec<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY created_at DESC");
    let records = collect_lenient(conn, &sql, &[])?;
    Ok(records
        .into_iter()
        .filter(|record| record.matches_text(needle))
        .collect())
}

/// Rows whose enrichment is absent or failed to decode; newest first.
pub fn records_without_enrichment(conn: &Connection) -> Result<Vec<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY created_at DESC");
    let records = collect_lenient(conn, &sql, &[])?;
    Ok(records
        .into_iter()
        .filter(Record::needs_processing)
        .collect())
}

pub fn count_records(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
        .context("failed to count records")
}

/// Newest row's text columns, for the corruption heuristic.
pub fn sample_text_fields(conn: &Connection) -> Result<Option<Vec<String>>> {
    conn.query_row(
        "SELECT id, content, trigger_used, source_app FROM records ORDER BY created_at DESC LIMIT 1",
        [],
        |row| {
            let mut fields = vec![
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ];
            if let Some(source) = row.get::<_, Option<String>>(3)? {
                fields.push(source);
            }
            Ok(fields)
        },
    )
    .optional()
    .context("failed to sample record")
}
