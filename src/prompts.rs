// src/prompts.rs

use time::Date;

/// Sent alongside the PDF bytes to obtain a plain transcription.
pub const TEXT_EXTRACTION_PROMPT: &str = r#"Extract all readable text from the provided document exactly as it appears.
Preserve line breaks and ordering as much as possible.
Do not summarize, analyze, or interpret.
Return only the extracted text."#;

pub const SYSTEM_INSTRUCTION: &str = "You are a senior Chartered Accountant and Data Validation Agent specializing in Indian GST and Invoice compliance.";

/// Temperature and thinking budget for the two model calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub thinking_level: &'static str,
}

pub const TRANSCRIBE_SETTINGS: GenerationSettings = GenerationSettings {
    temperature: 0.1,
    thinking_level: "low",
};

pub const EXTRACT_SETTINGS: GenerationSettings = GenerationSettings {
    temperature: 0.2,
    thinking_level: "medium",
};

const OCR_TEXT_SLOT: &str = "{ocr_text}";
const DATE_TODAY_SLOT: &str = "{date_today}";

const INVOICE_PROMPT_TEMPLATE: &str = r#"Your task is to extract structured invoice data from OCR text and return a single well-formed nested JSON object that is immediately usable for database storage and downstream analytics.

You MUST:
1. Extract all available invoice fields.
2. Normalize formats (dates -> YYYY-MM-DD, numbers -> float).
3. Perform India-specific validation checks.
4. Flag missing or inconsistent information.
5. Never hallucinate values. Use null if unavailable.
6. Always return valid JSON only (no markdown, no explanations).

--------------------------------------------------
OCR TEXT START

{ocr_text}

OCR TEXT END
--------------------------------------------------

--------------------------------------------------
OUTPUT REQUIREMENTS
--------------------------------------------------

Return exactly ONE JSON object with the following schema:

{
  "raw_extracted_json": object,

  "vendor": {
    "vendor_name": string | null,
    "vendor_gstin": string | null,
    "vendor_pan": string | null
  },

  "invoice": {
    "invoice_number": string | null,
    "invoice_date": string | null,
    "invoice_period": {
      "start": string | null,
      "end": string | null
    },
    "currency": string | null,
    "payment_due_date": string | null,
    "payment_terms_days": number | null
  },

  "items": [
    {
      "description": string | null,
      "hsn_sac": string | null,
      "quantity": number | null,
      "unit_price": number | null,
      "tax_rate": number | null,
      "taxable_value": number | null,
      "cgst": number | null,
      "sgst": number | null,
      "igst": number | null,
      "total_value": number | null
    }
  ],

  "amounts": {
    "taxable_amount": number | null,
    "cgst_amount": number | null,
    "sgst_amount": number | null,
    "igst_amount": number | null,
    "total_tax_amount": number | null,
    "invoice_total_amount": number | null,
    "tax_applicable": boolean
  },

  "classification": {
    "expense_type": "OpEx" | "CapEx" | null,
    "ledger_category": "Assets" | "Liabilities" | "Equity" | "Revenue" | "Expenses" | null
  },

  "rule_trace": [
    {
      "rule_name": string,
      "status": "PASS" | "WARNING" | "FAIL" | "NOT_APPLICABLE",
      "message": string
    }
  ],

  "confidence_score": number - 0 to 100,
  "doc_score": "ACCEPTABLE" | "WARNING" | "CRITICAL"
}

--------------------------------------------------
EXTRACTION RULES
--------------------------------------------------

- Store all intermediate extracted fields in "raw_extracted_json".
- If a field is missing or unreadable -> use null.
- Use only the headings given in the format.
- Never invent values.

--------------------------------------------------
NORMALIZATION RULES
--------------------------------------------------

- Dates -> YYYY-MM-DD
- Amounts -> float (no currency symbols, commas removed)
- GSTIN -> uppercase, no spaces
- PAN -> uppercase
- Currency -> ISO code if possible (INR, USD, etc.)

--------------------------------------------------
INDIA-SPECIFIC VALIDATION RULES (rule_trace)
--------------------------------------------------

Evaluate and log each rule independently:

1. GST CALCULATION MATCH
   - Verify: taxable_amount + total_tax_amount ~= invoice_total_amount
   - Verify CGST + SGST + IGST = total_tax_amount
   - Allow tolerance of +/-1 INR for rounding.

2. GST / PAN PRESENCE
   - If tax_applicable = true:
       - GSTIN must exist -> else WARNING
       - PAN must exist -> else WARNING

3. DATE VALIDITY
   - Use {date_today} as Current Date
   - Invoice date must not be in the future -> FAIL
   - Invoice date older than 18 months -> WARNING

4. TAX STRUCTURE CONSISTENCY
   - If IGST > 0 -> CGST and SGST must be 0
   - If CGST or SGST > 0 -> IGST must be 0
   - Otherwise -> FAIL

5. PAYMENT TERMS CONSISTENCY
   - If payment_terms_days present -> validate payment_due_date matches invoice_date + terms
   - Mismatch -> WARNING

--------------------------------------------------
FLAGGING RULES
--------------------------------------------------

- If a required field is missing but expected -> add WARNING in rule_trace.
- If logically incorrect -> FAIL.
- If not applicable -> NOT_APPLICABLE.

--------------------------------------------------
DOCUMENT SCORING
--------------------------------------------------

Determine final doc_score:

- ACCEPTABLE
  - No FAIL
  - LESS THAN OR EQUAL TO 2 WARNINGS

- WARNING
  - No FAIL
  - GREATER THAN 2 WARNINGS

- CRITICAL
  - Any FAIL exists

--------------------------------------------------
CONFIDENCE SCORE
--------------------------------------------------

Compute confidence_score (0-100) based on:
- Field completeness
- Numeric consistency
- OCR clarity
- Rule success rate

Higher completeness + fewer warnings = higher score.

--------------------------------------------------
OUTPUT STRICTNESS
--------------------------------------------------

Return ONLY valid JSON.
No commentary.
No markdown.
No explanations.
No trailing commas."#;

/// Fill the extraction template with the transcription and today's date.
///
/// The date slot is substituted before the text slot so that OCR text
/// containing a literal `{date_today}` is left alone.
pub fn render_invoice_prompt(ocr_text: &str, today: Date) -> String {
    INVOICE_PROMPT_TEMPLATE
        .replace(DATE_TODAY_SLOT, &iso_date(today))
        .replace(OCR_TEXT_SLOT, ocr_text)
}

/// `YYYY-MM-DD`
pub fn iso_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_render_fills_both_slots() {
        let prompt = render_invoice_prompt("TAX INVOICE\nINV-7", date!(2025 - 03 - 09));
        assert!(prompt.contains("OCR TEXT START\n\nTAX INVOICE\nINV-7\n\nOCR TEXT END"));
        assert!(prompt.contains("Use 2025-03-09 as Current Date"));
        assert!(!prompt.contains(OCR_TEXT_SLOT));
        assert!(!prompt.contains(DATE_TODAY_SLOT));
    }

    #[test]
    fn test_render_keeps_schema_braces() {
        let prompt = render_invoice_prompt("x", date!(2025 - 01 - 01));
        assert!(prompt.contains(r#""vendor": {"#));
        assert!(prompt.contains(r#""doc_score": "ACCEPTABLE" | "WARNING" | "CRITICAL""#));
    }

    #[test]
    fn test_ocr_text_with_placeholder_is_verbatim() {
        let prompt = render_invoice_prompt("note {date_today} here", date!(2024 - 12 - 31));
        assert!(prompt.contains("note {date_today} here"));
    }

    #[test]
    fn test_iso_date_pads() {
        assert_eq!(iso_date(date!(2026 - 02 - 05)), "2026-02-05");
    }
}
