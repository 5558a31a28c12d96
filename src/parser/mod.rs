//! Text extraction from ingested file bytes
//!
//! Covers the formats the engine embeds as text:
//! - Plain-text family (txt/md/csv/json/log)
//! - PDFs (text extraction with a quality gate)
//!
//! Image formats are not handled here; they go straight to the image
//! branch of the encoder.

mod pdf;
mod text;

pub use pdf::extract_pdf_text;
pub use text::{build_preview, extract_plain_text};

use crate::error::{EngineError, EngineResult};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tiff"];
const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv", "json", "log"];

/// Normalize a declared extension: lowercase, no leading dot.
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_lowercase()
}

/// Whether the declared extension routes to the image branch.
pub fn is_image_extension(extension: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&normalize_extension(extension).as_str())
}

/// Extract text from file bytes based on the declared extension.
///
/// `UnsupportedMedia` when the extension is not a known text format;
/// `ExtractionFailed` when the format is known but nothing usable came out.
pub fn extract_text(bytes: &[u8], extension: &str) -> EngineResult<String> {
    let ext = normalize_extension(extension);

    let extracted = if PLAIN_TEXT_EXTENSIONS.contains(&ext.as_str()) {
        extract_plain_text(bytes)
    } else if ext == "pdf" {
        extract_pdf_text(bytes)?
    } else {
        return Err(EngineError::UnsupportedMedia(format!(
            "no text extractor for extension '{}'",
            ext
        )));
    };

    if extracted.trim().is_empty() {
        return Err(EngineError::ExtractionFailed(format!(
            "no text extracted from '{}' content",
            ext
        )));
    }
    Ok(extracted)
}
