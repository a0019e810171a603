// src/pdf_text.rs

use lopdf::Document;
use tracing::{info, warn};

/// Result of attempting to extract text from a PDF.
#[derive(Debug)]
pub enum PdfContent {
    /// The PDF contains extractable text.
    Text(String),
    /// The PDF appears to be scanned / image-only, needs a vision model.
    ScannedImage,
    /// Something went wrong during extraction.
    Error(String),
}

/// Minimum number of non-whitespace characters we expect from a
/// "real" text PDF. Below this threshold we treat it as scanned.
const MIN_TEXT_CHARS: usize = 30;

/// Share of image-only pages above which the whole PDF counts as scanned.
const SCANNED_PAGE_RATIO: f64 = 0.8;

/// Takes raw PDF bytes and returns the local text layer, if any.
pub fn extract_text_from_pdf(pdf_bytes: &[u8]) -> PdfContent {
    let doc = match Document::load_mem(pdf_bytes) {
        Ok(d) => d,
        Err(e) => return PdfContent::Error(format!("Failed to parse PDF: {e}")),
    };

    if looks_like_scanned(&doc) {
        info!("PDF structural check: likely scanned / image-only");
        return PdfContent::ScannedImage;
    }

    match pdf_extract::extract_text_from_mem(pdf_bytes) {
        Ok(text) => classify_text(text),
        Err(e) => {
            warn!(error = %e, "pdf-extract failed, may be scanned or corrupted");
            PdfContent::ScannedImage
        }
    }
}

fn classify_text(text: String) -> PdfContent {
    let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
    if meaningful < MIN_TEXT_CHARS {
        info!(chars = meaningful, "Extracted text too short, treating as scanned");
        PdfContent::ScannedImage
    } else {
        info!(chars = meaningful, "Text extracted successfully");
        PdfContent::Text(text)
    }
}

/// A page counts as image-only when its `Resources` carry XObjects
/// but no fonts.
fn looks_like_scanned(doc: &Document) -> bool {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return false;
    }

    let image_only_pages = pages
        .values()
        .filter_map(|id| doc.get_object(*id).ok())
        .filter_map(|obj| obj.as_dict().ok())
        .filter(|dict| {
            resource_has(doc, dict, b"XObject") && !resource_has(doc, dict, b"Font")
        })
        .count();

    let ratio = image_only_pages as f64 / pages.len() as f64;
    info!(
        total_pages = pages.len(),
        image_only = image_only_pages,
        ratio = format!("{ratio:.2}"),
        "Scanned-page analysis"
    );

    ratio >= SCANNED_PAGE_RATIO
}

/// Whether the page's resource dictionary has a non-empty `key` entry.
fn resource_has(doc: &Document, page_dict: &lopdf::Dictionary, key: &[u8]) -> bool {
    page_dict
        .get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .and_then(|res| res.get(key).ok())
        .and_then(|o| doc.dereference(o).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .is_some_and(|d| !d.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{Object, Stream, dictionary};

    /// One-page PDF; `page` adds any objects it needs and returns the
    /// page's resources and drawing operations.
    fn single_page_pdf(
        page: impl FnOnce(&mut Document) -> (lopdf::Dictionary, Vec<Operation>),
    ) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let (resources, operations) = page(&mut doc);
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources,
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    /// A page that only paints an image, like a scanner produces.
    pub(crate) fn scanned_pdf() -> Vec<u8> {
        single_page_pdf(|doc| {
            let image_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => 1,
                    "Height" => 1,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                },
                vec![0x80],
            ));
            let resources = dictionary! {
                "XObject" => dictionary! { "Im1" => image_id },
            };
            let operations = vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![595.into(), 0.into(), 0.into(), 842.into(), 0.into(), 0.into()],
                ),
                Operation::new("Do", vec!["Im1".into()]),
                Operation::new("Q", vec![]),
            ];
            (resources, operations)
        })
    }

    const TEXT_LINE: &str = "TAX INVOICE No INV-2025-001 GSTIN 27AAPFU0939F1ZV";

    /// A page with a real font and a line of text.
    pub(crate) fn text_pdf() -> Vec<u8> {
        single_page_pdf(|doc| {
            let font_id = doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "Helvetica",
                "Encoding" => "WinAnsiEncoding",
            });
            let resources = dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            };
            let operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(TEXT_LINE)]),
                Operation::new("ET", vec![]),
            ];
            (resources, operations)
        })
    }

    #[test]
    fn test_image_only_page_is_scanned() {
        assert!(matches!(
            extract_text_from_pdf(&scanned_pdf()),
            PdfContent::ScannedImage
        ));
    }

    #[test]
    fn test_text_layer_is_extracted() {
        match extract_text_from_pdf(&text_pdf()) {
            PdfContent::Text(text) => {
                assert!(text.contains("INV-2025-001"));
                assert!(text.contains("27AAPFU0939F1ZV"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_bytes() {
        let result = extract_text_from_pdf(b"this is not a pdf");
        assert!(matches!(result, PdfContent::Error(_)));
    }

    #[test]
    fn test_short_text_counts_as_scanned() {
        let result = classify_text("  Page 1 \n\n ".to_string());
        assert!(matches!(result, PdfContent::ScannedImage));
    }

    #[test]
    fn test_long_text_is_kept() {
        let text = "TAX INVOICE\nGSTIN: 27AAPFU0939F1ZV\nInvoice No: INV-2025-001\n".to_string();
        match classify_text(text.clone()) {
            PdfContent::Text(t) => assert_eq!(t, text),
            other => panic!("expected text, got {other:?}"),
        }
    }
}
