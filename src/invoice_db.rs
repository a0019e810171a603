use crate::invoice::ExtractedInvoice;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row, params};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::info;
use uuid::Uuid;

pub struct InvoiceStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub id: i64,
    pub file_name: String,
    pub file_path: String,
    pub uploaded_at: String,
}

/// A persisted invoice. JSON sections are returned exactly as the model
/// produced them.
#[derive(Debug, Clone, Serialize)]
pub struct StoredInvoice {
    pub invoice_id: String,
    pub source_file_name: Option<String>,
    pub source_file_hash: Option<String>,
    pub raw_text: Option<String>,
    pub raw_extracted_json: Option<Value>,
    pub vendor: Option<Value>,
    pub invoice: Option<Value>,
    pub items: Option<Value>,
    pub amounts: Option<Value>,
    pub classification: Option<Value>,
    pub rule_trace: Option<Value>,
    pub confidence_score: Option<f64>,
    pub doc_score: Option<String>,
    pub created_at: String,
}

/// Everything needed to insert one invoice row.
pub struct NewInvoice<'a> {
    pub source_file_name: &'a str,
    pub source_file_hash: &'a str,
    pub raw_text: &'a str,
    pub extracted: &'a ExtractedInvoice,
}

/// Database totals, reported by `stats` and at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub uploaded_files: usize,
    pub invoices: usize,
    pub duplicate_hashes: usize,
}

const INVOICE_COLUMNS: &str = "invoice_id, source_file_name, source_file_hash, raw_text, \
     raw_extracted_json, vendor, invoice, items, amounts, classification, rule_trace, \
     confidence_score, doc_score, created_at";

/// Fixed-width UTC timestamp so that text ordering is chronological.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| OffsetDateTime::UNIX_EPOCH.to_string())
}

fn json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

fn json_column(row: &Row<'_>, idx: usize) -> SqliteResult<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    Ok(text.and_then(|t| serde_json::from_str(&t).ok()))
}

impl InvoiceStore {
    /// Open (or create) the SQLite database and ensure the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS uploaded_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                uploaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS invoices (
                invoice_id TEXT PRIMARY KEY,
                source_file_name TEXT,
                source_file_hash TEXT,
                raw_text TEXT,
                raw_extracted_json TEXT,
                vendor TEXT,
                invoice TEXT,
                items TEXT,
                amounts TEXT,
                classification TEXT,
                rule_trace TEXT,
                confidence_score REAL,
                doc_score TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_uploaded_files_name ON uploaded_files(file_name);
            CREATE INDEX IF NOT EXISTS idx_uploaded_files_path ON uploaded_files(file_path);
            CREATE INDEX IF NOT EXISTS idx_invoices_hash ON invoices(source_file_hash);
            CREATE INDEX IF NOT EXISTS idx_invoices_created ON invoices(created_at);",
        )?;

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    /// Hex SHA-256 of a byte buffer.
    pub fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Record a saved upload and return it with its assigned id.
    pub fn insert_uploaded_file(&self, file_name: &str, file_path: &str) -> SqliteResult<UploadedFile> {
        let uploaded_at = now_timestamp();
        self.conn.execute(
            "INSERT INTO uploaded_files (file_name, file_path, uploaded_at) VALUES (?1, ?2, ?3)",
            params![file_name, file_path, uploaded_at],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(id, file_name = %file_name, "Upload recorded");
        Ok(UploadedFile {
            id,
            file_name: file_name.to_string(),
            file_path: file_path.to_string(),
            uploaded_at,
        })
    }

    /// Insert an extracted invoice and return the stored row.
    pub fn insert_invoice(&self, new: &NewInvoice<'_>) -> SqliteResult<StoredInvoice> {
        let ex = new.extracted;
        let stored = StoredInvoice {
            invoice_id: Uuid::new_v4().to_string(),
            source_file_name: Some(new.source_file_name.to_string()),
            source_file_hash: Some(new.source_file_hash.to_string()),
            raw_text: Some(new.raw_text.to_string()),
            raw_extracted_json: ex.raw_extracted_json.clone(),
            vendor: ex.vendor.clone(),
            invoice: ex.invoice.clone(),
            items: ex.items.clone(),
            amounts: ex.amounts.clone(),
            classification: ex.classification.clone(),
            rule_trace: ex.rule_trace.clone(),
            confidence_score: ex.confidence_score,
            doc_score: ex.doc_score.clone(),
            created_at: now_timestamp(),
        };

        self.conn.execute(
            &format!(
                "INSERT INTO invoices ({INVOICE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                stored.invoice_id,
                stored.source_file_name,
                stored.source_file_hash,
                stored.raw_text,
                json_text(&stored.raw_extracted_json),
                json_text(&stored.vendor),
                json_text(&stored.invoice),
                json_text(&stored.items),
                json_text(&stored.amounts),
                json_text(&stored.classification),
                json_text(&stored.rule_trace),
                stored.confidence_score,
                stored.doc_score,
                stored.created_at,
            ],
        )?;
        info!(
            invoice_id = %stored.invoice_id,
            file = %new.source_file_name,
            doc_score = ?stored.doc_score,
            "Invoice stored"
        );
        Ok(stored)
    }

    fn row_to_invoice(row: &Row<'_>) -> SqliteResult<StoredInvoice> {
        Ok(StoredInvoice {
            invoice_id: row.get(0)?,
            source_file_name: row.get(1)?,
            source_file_hash: row.get(2)?,
            raw_text: row.get(3)?,
            raw_extracted_json: json_column(row, 4)?,
            vendor: json_column(row, 5)?,
            invoice: json_column(row, 6)?,
            items: json_column(row, 7)?,
            amounts: json_column(row, 8)?,
            classification: json_column(row, 9)?,
            rule_trace: json_column(row, 10)?,
            confidence_score: row.get(11)?,
            doc_score: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    /// All invoices, newest first.
    pub fn list_invoices(&self) -> SqliteResult<Vec<StoredInvoice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], Self::row_to_invoice)?;
        rows.collect()
    }

    /// Every invoice whose source file hash occurs more than once,
    /// grouped by hash.
    pub fn find_duplicates(&self) -> SqliteResult<Vec<StoredInvoice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE source_file_hash IN (
                SELECT source_file_hash FROM invoices
                WHERE source_file_hash IS NOT NULL
                GROUP BY source_file_hash
                HAVING COUNT(*) > 1
             )
             ORDER BY source_file_hash, created_at, rowid"
        ))?;
        let rows = stmt.query_map([], Self::row_to_invoice)?;
        rows.collect()
    }

    pub fn get_invoice(&self, invoice_id: &str) -> SqliteResult<Option<StoredInvoice>> {
        self.conn
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = ?1"),
                params![invoice_id],
                Self::row_to_invoice,
            )
            .optional()
    }

    pub fn get_counts(&self) -> SqliteResult<StoreCounts> {
        let uploaded_files: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM uploaded_files", [], |row| row.get(0))?;
        let invoices: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0))?;
        let duplicate_hashes: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT source_file_hash FROM invoices
                WHERE source_file_hash IS NOT NULL
                GROUP BY source_file_hash HAVING COUNT(*) > 1
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreCounts {
            uploaded_files,
            invoices,
            duplicate_hashes,
        })
    }
}
