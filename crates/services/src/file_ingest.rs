//! Turn user-selected files into [`FileAttachment`]s.
//!
//! Images and opaque files travel as base64 data URLs; documents are reduced
//! to text. Format parsers for PDF and Word are injected, workbooks are read
//! with calamine.

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use calamine::Reader;
use shared::{AttachmentKind, FileAttachment};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "ico"];
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv"];
const GENERIC_MIME: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported file: {0}")]
    Unsupported(String),

    #[error("failed to extract {name}: {message}")]
    Extraction { name: String, message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raw upload as handed over by the host.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    /// Declared MIME type; may be empty.
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self, IngestError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_default();
        Ok(Self::new(name, mime_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

// ── Format collaborators ─────────────────────────────────────────────

pub trait PdfTextExtractor: Send + Sync {
    /// Text of each page, in order.
    fn page_texts(&self, bytes: &[u8]) -> anyhow::Result<Vec<String>>;
}

pub trait WordTextExtractor: Send + Sync {
    fn raw_text(&self, bytes: &[u8]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

pub trait WorkbookReader: Send + Sync {
    fn sheets(&self, bytes: &[u8]) -> anyhow::Result<Vec<Sheet>>;
}

/// Reads xls/xlsx/ods workbooks with calamine.
pub struct CalamineWorkbookReader;

impl WorkbookReader for CalamineWorkbookReader {
    fn sheets(&self, bytes: &[u8]) -> anyhow::Result<Vec<Sheet>> {
        let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .context("not a readable workbook")?;
        let mut sheets = Vec::new();
        for name in workbook.sheet_names() {
            let range = workbook
                .worksheet_range(&name)
                .with_context(|| format!("failed to read sheet {}", name))?;
            let rows = range
                .rows()
                .map(|row| row.iter().map(|cell| cell.to_string()).collect())
                .collect();
            sheets.push(Sheet { name, rows });
        }
        Ok(sheets)
    }
}

/// Stand-in for a format with no parser configured.
struct Unavailable(&'static str);

impl PdfTextExtractor for Unavailable {
    fn page_texts(&self, _bytes: &[u8]) -> anyhow::Result<Vec<String>> {
        bail!("{} text extraction is not available", self.0)
    }
}

impl WordTextExtractor for Unavailable {
    fn raw_text(&self, _bytes: &[u8]) -> anyhow::Result<String> {
        bail!("{} text extraction is not available", self.0)
    }
}

// ── Classification ───────────────────────────────────────────────────

fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Classify by declared MIME type or extension, checking image, text, pdf,
/// then office formats. Anything else is an opaque file.
pub fn classify(name: &str, mime_type: &str) -> AttachmentKind {
    let ext = extension(name);
    let mime = mime_type.to_ascii_lowercase();
    let mime = if mime == GENERIC_MIME { "" } else { mime.as_str() };
    let has_ext = |list: &[&str]| list.contains(&ext.as_str());

    if mime.starts_with("image/") || has_ext(IMAGE_EXTENSIONS) {
        AttachmentKind::Image
    } else if mime.starts_with("text/") || has_ext(TEXT_EXTENSIONS) {
        AttachmentKind::Text
    } else if mime == "application/pdf" || ext == "pdf" {
        AttachmentKind::Pdf
    } else if has_ext(&["doc", "docx"])
        || mime.contains("msword")
        || mime.contains("wordprocessingml")
    {
        AttachmentKind::Word
    } else if has_ext(&["xls", "xlsx"])
        || mime.contains("ms-excel")
        || mime.contains("spreadsheetml")
    {
        AttachmentKind::Excel
    } else if has_ext(&["ppt", "pptx"])
        || mime.contains("ms-powerpoint")
        || mime.contains("presentationml")
    {
        AttachmentKind::Powerpoint
    } else {
        AttachmentKind::File
    }
}

pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    let mime = if mime_type.is_empty() {
        GENERIC_MIME
    } else {
        mime_type
    };
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// `Sheet: <name>` header plus CSV rows per sheet, sheets separated by a blank line.
pub fn render_sheets(sheets: &[Sheet]) -> anyhow::Result<String> {
    let mut blocks = Vec::with_capacity(sheets.len());
    for sheet in sheets {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        for row in &sheet.rows {
            writer.write_record(row)?;
        }
        let csv = String::from_utf8(writer.into_inner()?)?;
        blocks.push(format!("Sheet: {}\n{}", sheet.name, csv.trim_end()));
    }
    Ok(blocks.join("\n\n").trim().to_string())
}

// ── Ingestor ─────────────────────────────────────────────────────────

pub struct FileIngestor {
    pdf: Arc<dyn PdfTextExtractor>,
    word: Arc<dyn WordTextExtractor>,
    workbook: Arc<dyn WorkbookReader>,
}

impl Default for FileIngestor {
    fn default() -> Self {
        Self {
            pdf: Arc::new(Unavailable("PDF")),
            word: Arc::new(Unavailable("Word")),
            workbook: Arc::new(CalamineWorkbookReader),
        }
    }
}

impl FileIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pdf_extractor(mut self, pdf: Arc<dyn PdfTextExtractor>) -> Self {
        self.pdf = pdf;
        self
    }

    pub fn with_word_extractor(mut self, word: Arc<dyn WordTextExtractor>) -> Self {
        self.word = word;
        self
    }

    pub fn with_workbook_reader(mut self, workbook: Arc<dyn WorkbookReader>) -> Self {
        self.workbook = workbook;
        self
    }

    pub fn process_file(&self, file: &UploadedFile) -> Result<FileAttachment, IngestError> {
        if file.name.trim().is_empty() && file.mime_type.trim().is_empty() {
            return Err(IngestError::Unsupported(
                "file has neither a name nor a type".into(),
            ));
        }
        let kind = classify(&file.name, &file.mime_type);
        let mime_type = if file.mime_type.is_empty() {
            mime_guess::from_path(&file.name)
                .first_or_octet_stream()
                .to_string()
        } else {
            file.mime_type.clone()
        };
        let extraction = |e: anyhow::Error| IngestError::Extraction {
            name: file.name.clone(),
            message: format!("{:#}", e),
        };

        let content = match kind {
            AttachmentKind::Image | AttachmentKind::File | AttachmentKind::Error => {
                data_url(&mime_type, &file.bytes)
            }
            AttachmentKind::Text => std::str::from_utf8(&file.bytes)
                .context("file is not valid UTF-8 text")
                .map_err(extraction)?
                .to_string(),
            AttachmentKind::Pdf => self
                .pdf
                .page_texts(&file.bytes)
                .map_err(extraction)?
                .join("\n")
                .trim()
                .to_string(),
            AttachmentKind::Word => self
                .word
                .raw_text(&file.bytes)
                .map_err(extraction)?
                .trim()
                .to_string(),
            AttachmentKind::Excel => self
                .workbook
                .sheets(&file.bytes)
                .and_then(|sheets| render_sheets(&sheets))
                .map_err(extraction)?,
            AttachmentKind::Powerpoint => format!(
                "[PowerPoint file: {} ({:.2} KB). Slide text extraction is not supported.]",
                file.name,
                file.size() as f64 / 1024.0
            ),
        };
        debug!(name = %file.name, kind = kind.as_str(), "file ingested");

        Ok(FileAttachment {
            name: file.name.clone(),
            kind,
            size: file.size(),
            content,
            mime_type,
        })
    }

    /// Ingest a batch. A failing file becomes an error attachment and the
    /// rest still go through; unsupported files are dropped.
    pub fn process_files(&self, files: &[UploadedFile]) -> Vec<FileAttachment> {
        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            match self.process_file(file) {
                Ok(attachment) => attachments.push(attachment),
                Err(IngestError::Unsupported(reason)) => {
                    warn!(name = %file.name, %reason, "skipping unsupported file");
                }
                Err(e) => {
                    warn!(name = %file.name, error = %e, "file ingestion failed");
                    attachments.push(FileAttachment::error(
                        &file.name,
                        file.size(),
                        &file.mime_type,
                        e.to_string(),
                    ));
                }
            }
        }
        attachments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePdf;

    impl PdfTextExtractor for FakePdf {
        fn page_texts(&self, bytes: &[u8]) -> anyhow::Result<Vec<String>> {
            if !bytes.starts_with(b"%PDF") {
                bail!("missing PDF header");
            }
            Ok(vec!["  page one".into(), "page two  ".into()])
        }
    }

    struct FakeWord;

    impl WordTextExtractor for FakeWord {
        fn raw_text(&self, _bytes: &[u8]) -> anyhow::Result<String> {
            Ok("\n  Dear reader,\n".into())
        }
    }

    struct FakeWorkbook;

    impl WorkbookReader for FakeWorkbook {
        fn sheets(&self, _bytes: &[u8]) -> anyhow::Result<Vec<Sheet>> {
            Ok(vec![
                Sheet {
                    name: "Q1".into(),
                    rows: vec![
                        vec!["region".into(), "total".into()],
                        vec!["north, east".into(), "12".into()],
                    ],
                },
                Sheet {
                    name: "Empty".into(),
                    rows: vec![],
                },
            ])
        }
    }

    fn ingestor() -> FileIngestor {
        FileIngestor::new()
            .with_pdf_extractor(Arc::new(FakePdf))
            .with_word_extractor(Arc::new(FakeWord))
            .with_workbook_reader(Arc::new(FakeWorkbook))
    }

    #[test]
    fn test_classify_priority_and_fallbacks() {
        assert_eq!(classify("photo.PNG", ""), AttachmentKind::Image);
        assert_eq!(classify("blob", "image/webp"), AttachmentKind::Image);
        assert_eq!(classify("notes.md", GENERIC_MIME), AttachmentKind::Text);
        assert_eq!(classify("data.csv", "application/vnd.ms-excel"), AttachmentKind::Text);
        assert_eq!(classify("script.rs", "text/x-rust"), AttachmentKind::Text);
        assert_eq!(classify("paper.pdf", ""), AttachmentKind::Pdf);
        assert_eq!(classify("letter.DOCX", ""), AttachmentKind::Word);
        assert_eq!(classify("report.xlsx", GENERIC_MIME), AttachmentKind::Excel);
        assert_eq!(classify("deck.pptx", ""), AttachmentKind::Powerpoint);
        assert_eq!(classify("archive.zip", "application/zip"), AttachmentKind::File);
    }

    #[test]
    fn test_batch_isolates_failures() {
        let files = vec![
            UploadedFile::new("valid.txt", "text/plain", b"hello world".to_vec()),
            UploadedFile::new("corrupt.pdf", "application/pdf", b"garbage".to_vec()),
            UploadedFile::new("image.png", "image/png", vec![0x89, b'P', b'N', b'G']),
        ];
        let attachments = ingestor().process_files(&files);

        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].kind, AttachmentKind::Text);
        assert_eq!(attachments[0].content, "hello world");
        assert_eq!(attachments[1].kind, AttachmentKind::Error);
        assert!(attachments[1].content.contains("missing PDF header"));
        assert_eq!(attachments[1].size, 7);
        assert_eq!(attachments[2].kind, AttachmentKind::Image);
        assert_eq!(attachments[2].content, "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_invalid_utf8_text_is_extraction_error() {
        let latin1 = UploadedFile::new("notes.txt", "text/plain", b"caf\xe9 au lait".to_vec());
        assert!(matches!(
            ingestor().process_file(&latin1),
            Err(IngestError::Extraction { .. })
        ));

        let files = vec![
            latin1,
            UploadedFile::new("ok.md", "", "caf\u{e9}".as_bytes().to_vec()),
        ];
        let attachments = ingestor().process_files(&files);
        assert_eq!(attachments[0].kind, AttachmentKind::Error);
        assert!(attachments[0].content.contains("not valid UTF-8"));
        assert_eq!(attachments[1].kind, AttachmentKind::Text);
        assert_eq!(attachments[1].content, "caf\u{e9}");
    }

    #[test]
    fn test_default_ingestor_reports_missing_pdf_support() {
        let files = vec![UploadedFile::new("a.pdf", "", b"%PDF-1.7".to_vec())];
        let attachments = FileIngestor::new().process_files(&files);
        assert_eq!(attachments[0].kind, AttachmentKind::Error);
        assert!(attachments[0].content.contains("not available"));
    }

    #[test]
    fn test_unsupported_file_is_skipped() {
        let files = vec![
            UploadedFile::new("", "", vec![1, 2, 3]),
            UploadedFile::new("ok.txt", "", b"ok".to_vec()),
        ];
        let attachments = ingestor().process_files(&files);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].name, "ok.txt");
        assert_eq!(attachments[0].mime_type, "text/plain");
    }

    #[test]
    fn test_document_text_is_trimmed() {
        let pdf = ingestor()
            .process_file(&UploadedFile::new("a.pdf", "application/pdf", b"%PDF".to_vec()))
            .unwrap();
        assert_eq!(pdf.content, "page one\npage two");

        let word = ingestor()
            .process_file(&UploadedFile::new("a.docx", "", vec![0]))
            .unwrap();
        assert_eq!(word.content, "Dear reader,");
    }

    #[test]
    fn test_workbook_rendered_as_csv_blocks() {
        let xlsx = ingestor()
            .process_file(&UploadedFile::new("r.xlsx", "", vec![0]))
            .unwrap();
        assert_eq!(
            xlsx.content,
            "Sheet: Q1\nregion,total\n\"north, east\",12\n\nSheet: Empty"
        );
    }

    #[test]
    fn test_garbage_workbook_is_extraction_error() {
        let result =
            FileIngestor::new().process_file(&UploadedFile::new("r.xlsx", "", b"nope".to_vec()));
        assert!(matches!(result, Err(IngestError::Extraction { .. })));
    }

    #[test]
    fn test_powerpoint_placeholder_and_opaque_files() {
        let ppt = ingestor()
            .process_file(&UploadedFile::new("deck.pptx", "", vec![0; 2048]))
            .unwrap();
        assert_eq!(ppt.kind, AttachmentKind::Powerpoint);
        assert!(ppt.content.contains("deck.pptx"));
        assert!(ppt.content.contains("2.00 KB"));

        let bin = ingestor()
            .process_file(&UploadedFile::new("blob.bin", "", vec![1, 2, 3]))
            .unwrap();
        assert_eq!(bin.kind, AttachmentKind::File);
        assert_eq!(bin.content, "data:application/octet-stream;base64,AQID");
    }

    #[tokio::test]
    async fn test_from_path_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# hi").unwrap();
        let file = UploadedFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "notes.md");
        assert_eq!(file.mime_type, "text/markdown");
        assert_eq!(file.bytes, b"# hi");

        assert!(matches!(
            UploadedFile::from_path(&dir.path().join("missing.txt")).await,
            Err(IngestError::Io { .. })
        ));
    }
}
