//! PDF text extraction

use std::io::Write;

use pdf_oxide::converters::ConversionOptions;

use crate::error::{EngineError, EngineResult};

/// Extracted text below this score is treated as garbage (scanned pages,
/// broken encodings) rather than usable text.
const MIN_TEXT_QUALITY_SCORE: f64 = 0.6;

fn markdown_options() -> ConversionOptions {
    ConversionOptions {
        include_images: false,
        ..ConversionOptions::default()
    }
}

/// Extract text from PDF bytes, page by page.
///
/// The bytes are staged through a temp file because the PDF reader
/// consumes paths. Pages are joined with a separator; output failing the
/// quality gate is an `ExtractionFailed`.
pub fn extract_pdf_text(bytes: &[u8]) -> EngineResult<String> {
    let mut file = tempfile::Builder::new().suffix(".pdf").tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;

    let path = file.path().to_string_lossy().to_string();
    let mut doc = pdf_oxide::PdfDocument::open(&path)
        .map_err(|e| EngineError::ExtractionFailed(e.to_string()))?;
    let page_count = doc
        .page_count()
        .map_err(|e| EngineError::ExtractionFailed(e.to_string()))?;

    let options = markdown_options();
    let mut output = String::new();

    for page_index in 0..page_count {
        let text = doc
            .to_markdown(page_index, &options)
            .map_err(|e| EngineError::ExtractionFailed(e.to_string()))?;
        if text.trim().is_empty() {
            continue;
        }
        if !output.is_empty() {
            output.push_str("\n---\n\n");
        }
        output.push_str(text.trim_end());
        output.push('\n');
    }

    if output.trim().is_empty() {
        return Err(EngineError::ExtractionFailed(
            "PDF contains no extractable text".to_string(),
        ));
    }

    let score = text_quality_score(&output);
    if score < MIN_TEXT_QUALITY_SCORE {
        return Err(EngineError::ExtractionFailed(format!(
            "PDF text quality too low ({:.2})",
            score
        )));
    }

    Ok(output)
}

fn text_quality_score(text: &str) -> f64 {
    let mut total = 0usize;
    let mut printable = 0usize;
    let mut alnum = 0usize;
    let mut control = 0usize;
    let mut replacement = 0usize;

    for ch in text.chars() {
        if ch.is_whitespace() {
            continue;
        }
        total += 1;

        if ch == '\u{FFFD}' {
            replacement += 1;
            continue;
        }
        if ch.is_control() {
            control += 1;
            continue;
        }

        printable += 1;
        if ch.is_alphanumeric() {
            alnum += 1;
        }
    }

    if total == 0 {
        return 0.0;
    }

    let printable_ratio = printable as f64 / total as f64;
    let alnum_ratio = alnum as f64 / total as f64;
    let replacement_ratio = replacement as f64 / total as f64;
    let control_ratio = control as f64 / total as f64;

    let mut score = 0.6 * printable_ratio + 0.4 * alnum_ratio;
    score -= 0.7 * replacement_ratio;
    score -= 0.5 * control_ratio;
    score.clamp(0.0, 1.0)
}
