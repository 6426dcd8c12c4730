//! Format detection and text extraction.
//!
//! [`DocumentFormat`] is a closed set of supported formats plus an explicit
//! [`DocumentFormat::Unknown`] fallback. Each variant has one handler; when a
//! handler fails the extractor tries a single alternate strategy (raw byte
//! decode with encoding sniffing) before giving up with an
//! [`ExtractionError`].
//!
//! Output text is normalized: line endings are `\n`, trailing whitespace is
//! stripped from each line, runs of blank lines collapse to one, and the
//! whole text is trimmed. The chunker works on this normalized form.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::ExtractionError;
use crate::links;

/// Sheets processed per workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Cells processed per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for a single OOXML part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Bytes inspected when deciding whether content is binary.
const SNIFF_WINDOW: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    SourceCode(&'static str),
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Image,
    /// No dedicated handler; decoded with encoding sniffing.
    Unknown,
}

impl DocumentFormat {
    pub fn detect(path: &Path, bytes: &[u8]) -> Self {
        if bytes.starts_with(b"%PDF-") {
            return DocumentFormat::Pdf;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "md" | "markdown" | "mdx" => DocumentFormat::Markdown,
            "txt" | "text" | "log" | "csv" | "tsv" | "json" | "yaml" | "yml" | "toml" | "ini"
            | "cfg" | "conf" | "xml" | "html" | "htm" | "rst" | "org" => DocumentFormat::PlainText,
            "pdf" => DocumentFormat::Pdf,
            "docx" => DocumentFormat::Docx,
            "pptx" => DocumentFormat::Pptx,
            "xlsx" => DocumentFormat::Xlsx,
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "gif" | "webp" => {
                DocumentFormat::Image
            }
            other => match code_language(other) {
                Some(lang) => DocumentFormat::SourceCode(lang),
                None => DocumentFormat::Unknown,
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            DocumentFormat::PlainText => "text".to_string(),
            DocumentFormat::Markdown => "markdown".to_string(),
            DocumentFormat::SourceCode(lang) => format!("code:{}", lang),
            DocumentFormat::Pdf => "pdf".to_string(),
            DocumentFormat::Docx => "docx".to_string(),
            DocumentFormat::Pptx => "pptx".to_string(),
            DocumentFormat::Xlsx => "xlsx".to_string(),
            DocumentFormat::Image => "image".to_string(),
            DocumentFormat::Unknown => "unknown".to_string(),
        }
    }
}

fn code_language(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" | "cxx" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "lua" => "lua",
        _ => return None,
    })
}

/// Image-to-text capability used for images and text-less PDFs.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bytes: &[u8], format: DocumentFormat) -> Result<String, ExtractionError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Heading {
    pub offset: usize,
    pub level: usize,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuralMetadata {
    pub format: DocumentFormat,
    pub encoding: &'static str,
    pub headings: Vec<Heading>,
    /// Byte offsets in the normalized text where a structural unit begins
    /// (headings, code definitions).
    pub boundaries: Vec<usize>,
    pub links: Vec<String>,
    pub language: String,
    pub line_count: usize,
    pub used_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub text: String,
    pub metadata: StructuralMetadata,
}

#[derive(Clone, Default)]
pub struct Extractor {
    ocr: Option<Arc<dyn OcrEngine>>,
    max_bytes: Option<u64>,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Read and extract a file.
    pub fn extract(&self, path: &Path) -> Result<Extracted, ExtractionError> {
        if let Some(limit) = self.max_bytes {
            let size = std::fs::metadata(path)
                .map_err(|e| ExtractionError::Corrupt(e.to_string()))?
                .len();
            if size > limit {
                return Err(ExtractionError::TooLarge { size, limit });
            }
        }
        let bytes = std::fs::read(path).map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
        self.extract_bytes(path, &bytes)
    }

    /// Extract already-read bytes of `path`.
    pub fn extract_bytes(&self, path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractionError> {
        if let Some(limit) = self.max_bytes {
            if bytes.len() as u64 > limit {
                return Err(ExtractionError::TooLarge {
                    size: bytes.len() as u64,
                    limit,
                });
            }
        }
        let format = DocumentFormat::detect(path, bytes);

        let (raw, encoding, used_fallback) = match self.primary(format, bytes) {
            Ok((text, encoding)) => (text, encoding, false),
            Err(primary_err) if format != DocumentFormat::Unknown => {
                match decode_sniffed(bytes) {
                    Ok((text, encoding)) if !text.trim().is_empty() => {
                        tracing::debug!(path = %path.display(), error = %primary_err, "primary extraction failed; using decoded bytes");
                        (text, encoding, true)
                    }
                    _ => return Err(primary_err),
                }
            }
            Err(e) => return Err(e),
        };

        let text = normalize(&raw);
        let headings = if matches!(format, DocumentFormat::Markdown | DocumentFormat::PlainText) {
            markdown_headings(&text)
        } else {
            Vec::new()
        };
        let mut boundaries: Vec<usize> = headings.iter().map(|h| h.offset).collect();
        if let DocumentFormat::SourceCode(_) = format {
            boundaries.extend(code_definitions(&text));
            boundaries.sort_unstable();
            boundaries.dedup();
        }

        let metadata = StructuralMetadata {
            format,
            encoding,
            links: links::extract_wiki_links(&text),
            language: detect_language(&text).to_string(),
            line_count: text.lines().count(),
            headings,
            boundaries,
            used_fallback,
        };
        Ok(Extracted { text, metadata })
    }

    fn primary(
        &self,
        format: DocumentFormat,
        bytes: &[u8],
    ) -> Result<(String, &'static str), ExtractionError> {
        match format {
            DocumentFormat::PlainText | DocumentFormat::Markdown | DocumentFormat::SourceCode(_) => {
                decode_utf8(bytes).map(|t| (t, "utf-8"))
            }
            DocumentFormat::Pdf => self.extract_pdf(bytes).map(|t| (t, "pdf")),
            DocumentFormat::Docx => extract_docx(bytes).map(|t| (t, "ooxml")),
            DocumentFormat::Pptx => extract_pptx(bytes).map(|t| (t, "ooxml")),
            DocumentFormat::Xlsx => extract_xlsx(bytes).map(|t| (t, "ooxml")),
            DocumentFormat::Image => match &self.ocr {
                Some(ocr) => ocr.recognize(bytes, format).map(|t| (t, "ocr")),
                None => Err(ExtractionError::Unsupported(
                    "image without an OCR engine".to_string(),
                )),
            },
            DocumentFormat::Unknown => decode_sniffed(bytes),
        }
    }

    fn extract_pdf(&self, bytes: &[u8]) -> Result<String, ExtractionError> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractionError::Corrupt(format!("pdf: {}", e)))?;
        if !text.trim().is_empty() {
            return Ok(text);
        }
        match &self.ocr {
            Some(ocr) => ocr.recognize(bytes, DocumentFormat::Pdf),
            None => Err(ExtractionError::NoText("pdf has no text layer".to_string())),
        }
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractionError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    UTF_8
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
        .ok_or_else(|| ExtractionError::Encoding("invalid utf-8".to_string()))
}

/// Decode bytes of unknown encoding: BOMs, UTF-8, BOM-less UTF-16, then
/// Windows-1252. Binary content is rejected.
pub fn decode_sniffed(bytes: &[u8]) -> Result<(String, &'static str), ExtractionError> {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        return decode_strict(encoding, &bytes[bom_len..]);
    }
    if let Some(s) = UTF_8.decode_without_bom_handling_and_without_replacement(bytes) {
        if !looks_binary(s.as_bytes()) {
            return Ok((s.into_owned(), "utf-8"));
        }
    }

    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if window.len() >= 4 {
        let even_zero = window.iter().step_by(2).filter(|b| **b == 0).count();
        let odd_zero = window.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
        let half = window.len() / 2;
        if odd_zero * 10 >= half * 9 && even_zero == 0 {
            return decode_strict(UTF_16LE, bytes);
        }
        if even_zero * 10 >= half * 9 && odd_zero == 0 {
            return decode_strict(UTF_16BE, bytes);
        }
    }

    if looks_binary(window) {
        return Err(ExtractionError::Encoding(
            "content appears to be binary".to_string(),
        ));
    }
    decode_strict(WINDOWS_1252, bytes)
}

fn decode_strict(
    encoding: &'static Encoding,
    bytes: &[u8],
) -> Result<(String, &'static str), ExtractionError> {
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        return Err(ExtractionError::Encoding(format!(
            "malformed {}",
            encoding.name()
        )));
    }
    Ok((text.into_owned(), encoding_label(encoding)))
}

fn encoding_label(encoding: &'static Encoding) -> &'static str {
    if encoding == UTF_8 {
        "utf-8"
    } else if encoding == UTF_16LE {
        "utf-16le"
    } else if encoding == UTF_16BE {
        "utf-16be"
    } else {
        "windows-1252"
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if window.is_empty() {
        return false;
    }
    let control = window
        .iter()
        .filter(|&&b| b == 0 || (b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0c)))
        .count();
    control * 10 > window.len()
}

/// Canonical text form consumed by the chunker.
pub fn normalize(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn markdown_headings(text: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&level) && trimmed[level..].starts_with(' ') {
            headings.push(Heading {
                offset,
                level,
                title: trimmed[level..].trim().to_string(),
            });
        }
        offset += line.len();
    }
    headings
}

fn code_definitions(text: &str) -> Vec<usize> {
    const STARTS: &[&str] = &[
        "fn ", "pub fn ", "pub(crate) fn ", "async fn ", "pub async fn ", "impl ", "struct ",
        "pub struct ", "enum ", "pub enum ", "trait ", "pub trait ", "def ", "async def ",
        "class ", "function ", "export function ", "func ", "public ", "private ",
    ];
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if STARTS.iter().any(|s| line.starts_with(s)) && offset > 0 {
            offsets.push(offset);
        }
        offset += line.len();
    }
    offsets
}

/// Coarse language tag: `en` when common English function words are
/// frequent, otherwise `und`.
pub fn detect_language(text: &str) -> &'static str {
    const STOPWORDS: &[&str] = &[
        "the", "and", "of", "to", "in", "is", "that", "for", "it", "with", "as", "on", "this",
        "are", "be", "by", "or", "an", "from", "at",
    ];
    let mut words = 0usize;
    let mut hits = 0usize;
    for word in text.split_whitespace().take(500) {
        words += 1;
        let w = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_ascii_lowercase();
        if STOPWORDS.contains(&w.as_str()) {
            hits += 1;
        }
    }
    if words >= 5 && hits * 100 >= words * 8 {
        "en"
    } else {
        "und"
    }
}

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>, ExtractionError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractionError::Corrupt(format!("ooxml: {}", e)))
}

fn read_part(archive: &mut ZipReader<'_>, name: &str) -> Result<Vec<u8>, ExtractionError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractionError::Corrupt(format!("ooxml part {}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractionError::Corrupt(format!(
            "ooxml part {} exceeds {} bytes",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Collect the text of every `<*:t>` element; `break_on` ends a line.
fn text_elements(xml: &[u8], break_on: &[u8]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == break_on && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Corrupt(format!("ooxml xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn numbered_parts(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    // One paragraph per line, blank line between paragraphs.
    let text = text_elements(&xml, b"p")?;
    Ok(text.replace('\n', "\n\n"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = open_zip(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_part(&mut archive, &name)?;
        let text = text_elements(&xml, b"p")?;
        if !text.trim().is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = open_zip(bytes)?;
    let shared = match read_part(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => shared_strings(&xml)?,
        Err(_) => Vec::new(),
    };
    let mut sheets = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_part(&mut archive, &name)?;
        sheets.push(sheet_rows(&xml, &shared)?);
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractionError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(cur) = current.as_mut() {
                    let text = te
                        .unescape()
                        .map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
                    cur.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Corrupt(format!("xlsx strings: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cells joined by tabs, rows by newlines.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, ExtractionError> {
    use quick_xml::events::Event;

    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared_cell = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && matches!(a.value.as_ref(), b"s")
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te
                    .unescape()
                    .map_err(|e| ExtractionError::Corrupt(e.to_string()))?;
                let raw = raw.trim();
                let value = if shared_cell {
                    raw.parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned())
                } else {
                    Some(raw.to_string())
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    row.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Corrupt(format!("xlsx sheet: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn zip_with(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            let opts = zip::write::SimpleFileOptions::default();
            for (name, body) in parts {
                w.start_file(*name, opts).unwrap();
                w.write_all(body.as_bytes()).unwrap();
            }
            w.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn detects_formats_by_extension_and_magic() {
        assert_eq!(
            DocumentFormat::detect(&PathBuf::from("a.md"), b"# x"),
            DocumentFormat::Markdown
        );
        assert_eq!(
            DocumentFormat::detect(&PathBuf::from("a.rs"), b"fn main() {}"),
            DocumentFormat::SourceCode("rust")
        );
        assert_eq!(
            DocumentFormat::detect(&PathBuf::from("noext"), b"%PDF-1.7"),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::detect(&PathBuf::from("data.bin"), b"abc"),
            DocumentFormat::Unknown
        );
    }

    #[test]
    fn normalize_collapses_blank_runs_and_crlf() {
        let text = normalize("  \r\nline one  \r\n\r\n\r\n\r\nline two\t\n\n");
        assert_eq!(text, "line one\n\nline two");
    }

    #[test]
    fn markdown_headings_and_links() {
        let ex = Extractor::new();
        let out = ex
            .extract_bytes(
                &PathBuf::from("note.md"),
                b"# Title\n\nSee [[Other Note]] and [[Plan|the plan]].\n\n## Part\n\nBody.",
            )
            .unwrap();
        assert_eq!(out.metadata.headings.len(), 2);
        assert_eq!(out.metadata.headings[1].title, "Part");
        assert_eq!(out.metadata.links, vec!["Other Note", "Plan"]);
        assert!(!out.metadata.used_fallback);
    }

    #[test]
    fn invalid_utf8_text_falls_back_to_windows_1252() {
        let ex = Extractor::new();
        let out = ex
            .extract_bytes(&PathBuf::from("old.txt"), b"caf\xe9 au lait")
            .unwrap();
        assert_eq!(out.text, "café au lait");
        assert!(out.metadata.used_fallback);
        assert_eq!(out.metadata.encoding, "windows-1252");
    }

    #[test]
    fn cp1252_punctuation_is_not_decoded_as_control_chars() {
        let ex = Extractor::new();
        let out = ex
            .extract_bytes(
                &PathBuf::from("old.txt"),
                b"It\x92s a caf\xe9 \x93quote\x94 \x80 5",
            )
            .unwrap();
        assert_eq!(out.text, "It\u{2019}s a caf\u{e9} \u{201c}quote\u{201d} \u{20ac} 5");
        assert!(!out.text.chars().any(|c| ('\u{80}'..='\u{9f}').contains(&c)));
    }

    #[test]
    fn bomless_utf16le_is_detected() {
        let mut bytes = Vec::new();
        for u in "plain ascii words".encode_utf16() {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        let (text, enc) = decode_sniffed(&bytes).unwrap();
        assert_eq!(text, "plain ascii words");
        assert_eq!(enc, "utf-16le");
    }

    #[test]
    fn utf16_with_bom_is_decoded() {
        let mut bytes = vec![0xFF, 0xFE];
        for u in "hello".encode_utf16() {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        let (text, enc) = decode_sniffed(&bytes).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(enc, "utf-16le");
    }

    #[test]
    fn binary_unknown_is_an_encoding_error() {
        let ex = Extractor::new();
        let bytes: Vec<u8> = (0..512).map(|i| (i % 7) as u8).collect();
        let err = ex
            .extract_bytes(&PathBuf::from("blob.dat"), &bytes)
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Encoding(_)));
    }

    #[test]
    fn corrupt_pdf_is_reported() {
        let ex = Extractor::new();
        let mut bytes = b"not a pdf".to_vec();
        bytes.extend(std::iter::repeat(0u8).take(256));
        let err = ex
            .extract_bytes(&PathBuf::from("broken.pdf"), &bytes)
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt(_)), "{:?}", err);
    }

    #[test]
    fn mislabelled_pdf_is_rescued_by_byte_decode() {
        let out = Extractor::new()
            .extract_bytes(&PathBuf::from("notes.pdf"), b"not a pdf, just notes")
            .unwrap();
        assert!(out.metadata.used_fallback);
        assert_eq!(out.text, "not a pdf, just notes");
    }

    #[test]
    fn image_without_ocr_is_unsupported() {
        let ex = Extractor::new();
        let err = ex
            .extract_bytes(&PathBuf::from("scan.png"), b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Unsupported(_)));
    }

    struct FixedOcr;

    impl OcrEngine for FixedOcr {
        fn recognize(&self, _bytes: &[u8], _f: DocumentFormat) -> Result<String, ExtractionError> {
            Ok("recognized text".to_string())
        }
    }

    #[test]
    fn image_uses_ocr_engine() {
        let ex = Extractor::new().with_ocr(Arc::new(FixedOcr));
        let out = ex
            .extract_bytes(&PathBuf::from("scan.png"), b"\x89PNG\r\n\x1a\n")
            .unwrap();
        assert_eq!(out.text, "recognized text");
        assert_eq!(out.metadata.encoding, "ocr");
    }

    #[test]
    fn docx_paragraphs_become_blocks() {
        let doc = zip_with(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="x"><w:body><w:p><w:r><w:t>First para</w:t></w:r></w:p><w:p><w:r><w:t>Second para</w:t></w:r></w:p></w:body></w:document>"#,
        )]);
        let out = Extractor::new()
            .extract_bytes(&PathBuf::from("a.docx"), &doc)
            .unwrap();
        assert_eq!(out.text, "First para\n\nSecond para");
    }

    #[test]
    fn xlsx_rows_use_shared_strings() {
        let book = zip_with(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>Name</t></si><si><t>Total</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row><c t="s"><v>0</v></c><c t="s"><v>1</v></c></row><row><c><v>42</v></c></row></sheetData></worksheet>"#,
            ),
        ]);
        let out = Extractor::new()
            .extract_bytes(&PathBuf::from("b.xlsx"), &book)
            .unwrap();
        assert_eq!(out.text, "Name\tTotal\n42");
    }

    #[test]
    fn source_code_records_definition_boundaries() {
        let src = b"use std::io;\n\nfn one() {}\n\nfn two() {}\n";
        let out = Extractor::new()
            .extract_bytes(&PathBuf::from("lib.rs"), src)
            .unwrap();
        assert_eq!(out.metadata.format, DocumentFormat::SourceCode("rust"));
        assert_eq!(out.metadata.boundaries.len(), 2);
    }

    #[test]
    fn oversized_input_is_rejected() {
        let ex = Extractor::new().with_max_bytes(4);
        let err = ex
            .extract_bytes(&PathBuf::from("a.txt"), b"too long")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::TooLarge { .. }));
    }

    #[test]
    fn english_detection() {
        assert_eq!(
            detect_language("This is a note about the design of the parser and its errors."),
            "en"
        );
        assert_eq!(detect_language("fn main() { println!(\"x\"); }"), "und");
    }
}
