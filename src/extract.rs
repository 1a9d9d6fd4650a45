//! Text extraction for uploaded files (PDF, TXT, DOCX) and remote URLs.
//!
//! Extraction is the first pipeline stage: it turns raw bytes or a fetched
//! page into one plain-UTF-8 document, or fails with an error the caller can
//! act on. The extractor holds no state across calls.

use std::io::Read;
use std::time::Duration;

use crate::error::QaError;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Supported file kinds, dispatched purely on the declared extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Txt,
    Docx,
}

/// Resolve the declared extension of `name` into a [`FileKind`].
///
/// Fails with [`QaError::UnsupportedFormat`] before any I/O is attempted.
pub fn kind_for_path(name: &str) -> Result<FileKind, QaError> {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => Ok(FileKind::Pdf),
        "txt" => Ok(FileKind::Txt),
        "docx" | "doc" => Ok(FileKind::Docx),
        _ => Err(QaError::UnsupportedFormat(format!(
            "'{}' (expected pdf, txt, docx, or doc)",
            name
        ))),
    }
}

/// Extract plain text from file bytes of a known kind.
///
/// A source that yields no text at all is an extraction failure, never a
/// silent empty document.
pub fn extract_file(bytes: &[u8], kind: FileKind) -> Result<String, QaError> {
    let text = match kind {
        FileKind::Pdf => extract_pdf(bytes)?,
        FileKind::Txt => extract_txt(bytes)?,
        FileKind::Docx => extract_docx(bytes)?,
    };
    ensure_nonempty(text)
}

/// Fetch `url` and extract the visible text of the page.
///
/// A non-success HTTP status fails with the status code. On success, text is
/// collected from paragraph, list-item, and heading elements in document
/// order; script and style content is discarded.
pub async fn extract_url(url: &str, timeout: Duration) -> Result<String, QaError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| QaError::ExtractionFailed(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| QaError::ExtractionFailed(format!("fetch failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(QaError::ExtractionFailed(format!(
            "HTTP {} fetching {}",
            status.as_u16(),
            url
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| QaError::ExtractionFailed(format!("failed to read body: {}", e)))?;

    ensure_nonempty(html_visible_text(&body))
}

fn ensure_nonempty(text: String) -> Result<String, QaError> {
    if text.trim().is_empty() {
        return Err(QaError::ExtractionFailed(
            "no text extracted from source".to_string(),
        ));
    }
    Ok(text)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, QaError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| QaError::ExtractionFailed(format!("PDF: {}", e)))
}

fn extract_txt(bytes: &[u8]) -> Result<String, QaError> {
    // Strict decoding: invalid byte sequences fail rather than being
    // silently replaced, so the contract stays observable.
    String::from_utf8(bytes.to_vec())
        .map_err(|e| QaError::ExtractionFailed(format!("invalid UTF-8: {}", e)))
}

fn extract_docx(bytes: &[u8]) -> Result<String, QaError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| QaError::ExtractionFailed(format!("DOCX: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| QaError::ExtractionFailed("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| QaError::ExtractionFailed(format!("DOCX: {}", e)))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(QaError::ExtractionFailed(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    docx_paragraph_text(&doc_xml)
}

/// Collect `w:t` runs from a DOCX body, one output line per `w:p` paragraph.
///
/// Text is taken verbatim: whitespace inside a run is significant, since a
/// paragraph is often split across several runs ("Second " + "paragraph.").
/// Inter-element whitespace never reaches the output because only text
/// inside `w:t` is collected.
fn docx_paragraph_text(xml: &[u8]) -> Result<String, QaError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(QaError::ExtractionFailed(format!("DOCX XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Which HTML elements contribute visible text.
fn is_content_element(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"li" | b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6"
    )
}

fn is_skipped_element(name: &[u8]) -> bool {
    matches!(name, b"script" | b"style")
}

/// Extract visible text from an HTML page.
///
/// The scan is lenient: real-world HTML is not well-formed XML, so end-name
/// checking is off and a parse error terminates the scan with whatever text
/// was collected up to that point.
pub fn html_visible_text(html: &str) -> String {
    let mut reader = quick_xml::Reader::from_str(html);
    {
        let cfg = reader.config_mut();
        cfg.trim_text(true);
        cfg.check_end_names = false;
    }

    let mut out = String::new();
    let mut content_depth = 0usize;
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name();
                let lower = name.as_ref().to_ascii_lowercase();
                if is_skipped_element(&lower) {
                    skip_depth += 1;
                } else if is_content_element(&lower) {
                    content_depth += 1;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                let lower = name.as_ref().to_ascii_lowercase();
                if is_skipped_element(&lower) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if is_content_element(&lower) {
                    content_depth = content_depth.saturating_sub(1);
                    if content_depth == 0 && !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if content_depth > 0 && skip_depth == 0 => {
                let text = match te.unescape() {
                    Ok(t) => t.into_owned(),
                    Err(_) => String::from_utf8_lossy(te.as_ref()).into_owned(),
                };
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push(' ');
                    }
                    out.push_str(trimmed);
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }

    out
}
