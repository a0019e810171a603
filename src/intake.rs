// src/intake.rs

use crate::invoice::{self, ParseError, RuleStatus};
use crate::invoice_db::{InvoiceStore, NewInvoice, StoredInvoice, UploadedFile};
use crate::llm_client::{InvoiceModel, ModelError};
use crate::prompts;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tracing::{Instrument, info, info_span, warn};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("failed to read upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),
    #[error("unusable model reply: {0}")]
    Parse(#[from] ParseError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Run one saved upload through transcription, extraction and storage.
pub async fn process_upload(
    model: &dyn InvoiceModel,
    store: &Mutex<InvoiceStore>,
    upload: &UploadedFile,
) -> Result<StoredInvoice, IntakeError> {
    let today = OffsetDateTime::now_utc().date();
    let span = info_span!("intake", id = upload.id, file = %upload.file_name);
    process_file(model, store, Path::new(&upload.file_path), today)
        .instrument(span)
        .await
}

/// The pipeline proper; `today` anchors the date validity rule.
pub async fn process_file(
    model: &dyn InvoiceModel,
    store: &Mutex<InvoiceStore>,
    path: &Path,
    today: Date,
) -> Result<StoredInvoice, IntakeError> {
    let pdf_bytes = tokio::fs::read(path).await?;
    info!(bytes = pdf_bytes.len(), model = %model.describe(), "Transcribing document");

    let ocr_text = model.transcribe(&pdf_bytes).await?;
    info!(chars = ocr_text.len(), "Transcription received");

    let prompt = prompts::render_invoice_prompt(&ocr_text, today);
    let reply = model.extract(&prompt).await?;
    let extracted = invoice::parse_model_reply(&reply)?;

    let (filled, total) = extracted.coverage();
    let summary = extracted.rule_summary();
    info!(
        filled,
        total,
        invoice_no = ?extracted.invoice_number(),
        vendor = ?extracted.vendor_name(),
        pass = summary.pass,
        warnings = summary.warning,
        fails = summary.fail,
        confidence = ?extracted.confidence_score,
        "Extraction result"
    );

    for rule in extracted.rules() {
        if rule.status == RuleStatus::Fail {
            warn!(rule = %rule.rule_name, message = %rule.message, "Rule failed");
        }
    }

    let derived = extracted.derived_doc_score();
    match extracted.reported_doc_score() {
        Some(reported) if reported != derived => {
            warn!(%reported, %derived, "Model doc_score disagrees with its rule trace");
        }
        None => warn!(raw = ?extracted.doc_score, %derived, "Model doc_score missing or unknown"),
        _ => {}
    }

    let file_hash = InvoiceStore::sha256_hex(&pdf_bytes);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let store = store.lock().map_err(|_| IntakeError::Poisoned)?;
    let stored = store.insert_invoice(&NewInvoice {
        source_file_name: &file_name,
        source_file_hash: &file_hash,
        raw_text: &ocr_text,
        extracted: &extracted,
    })?;
    Ok(stored)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use time::macros::date;

    /// Canned model that records the prompts it sees.
    pub(crate) struct FakeModel {
        pub transcript: String,
        pub reply: String,
        pub prompts: StdMutex<Vec<String>>,
    }

    impl FakeModel {
        pub(crate) fn new(transcript: &str, reply: &str) -> Self {
            Self {
                transcript: transcript.to_string(),
                reply: reply.to_string(),
                prompts: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InvoiceModel for FakeModel {
        async fn transcribe(&self, pdf_bytes: &[u8]) -> Result<String, ModelError> {
            if pdf_bytes.is_empty() {
                return Err(ModelError::Empty);
            }
            Ok(self.transcript.clone())
        }

        async fn extract(&self, prompt: &str) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    pub(crate) const GOOD_REPLY: &str = r#"{
        "raw_extracted_json": {"GSTIN": "29ABCDE1234F1Z5"},
        "vendor": {"vendor_name": "Bharat Supplies", "vendor_gstin": "29ABCDE1234F1Z5", "vendor_pan": "ABCDE1234F"},
        "invoice": {"invoice_number": "BS/24-25/118", "invoice_date": "2025-02-10"},
        "items": [],
        "amounts": {"taxable_amount": 500.0, "cgst_amount": 45.0, "sgst_amount": 45.0, "igst_amount": 0.0, "total_tax_amount": 90.0, "invoice_total_amount": 590.0, "tax_applicable": true},
        "classification": {"expense_type": "OpEx", "ledger_category": "Expenses"},
        "rule_trace": [{"rule_name": "TAX STRUCTURE CONSISTENCY", "status": "PASS", "message": "intra-state"}],
        "confidence_score": 88,
        "doc_score": "ACCEPTABLE"
    }"#;

    #[tokio::test]
    async fn test_pipeline_stores_invoice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.pdf");
        std::fs::write(&path, b"%PDF-1.4 bill").unwrap();

        let model = FakeModel::new("TAX INVOICE BS/24-25/118", GOOD_REPLY);
        let store = Mutex::new(InvoiceStore::in_memory().unwrap());

        let stored = process_file(&model, &store, &path, date!(2025 - 03 - 01))
            .await
            .unwrap();

        assert_eq!(stored.source_file_name.as_deref(), Some("bill.pdf"));
        assert_eq!(
            stored.source_file_hash,
            Some(InvoiceStore::sha256_hex(b"%PDF-1.4 bill"))
        );
        assert_eq!(stored.raw_text.as_deref(), Some("TAX INVOICE BS/24-25/118"));
        assert_eq!(stored.doc_score.as_deref(), Some("ACCEPTABLE"));
        assert_eq!(stored.confidence_score, Some(88.0));

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("TAX INVOICE BS/24-25/118"));
        assert!(prompts[0].contains("Use 2025-03-01 as Current Date"));

        let store = store.lock().unwrap();
        assert_eq!(store.list_invoices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_reply_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let model = FakeModel::new("text", "Sorry, I cannot help with that.");
        let store = Mutex::new(InvoiceStore::in_memory().unwrap());

        let err = process_file(&model, &store, &path, date!(2025 - 03 - 01))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Parse(_)));
        assert!(store.lock().unwrap().list_invoices().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let model = FakeModel::new("text", GOOD_REPLY);
        let store = Mutex::new(InvoiceStore::in_memory().unwrap());
        let err = process_file(&model, &store, Path::new("/nonexistent/x.pdf"), date!(2025 - 01 - 01))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Io(_)));
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pdf");
        std::fs::write(&path, b"").unwrap();

        let model = FakeModel::new("text", GOOD_REPLY);
        let store = Mutex::new(InvoiceStore::in_memory().unwrap());
        let err = process_file(&model, &store, &path, date!(2025 - 01 - 01))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Model(ModelError::Empty)));
    }
}
