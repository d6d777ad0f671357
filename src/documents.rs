/// Document processing module
///
/// This module handles:
/// - Format detection (PDF, DOCX, TXT/Markdown)
/// - Text extraction
/// - Character-based chunking with overlap
/// - Forwarding chunks to the vector store for embedding
///
/// Re-ingesting a file appends new chunks; nothing is deduplicated here.
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{BotError, Result};
use crate::vector_store::VectorStoreManager;

/// Maximum decompressed size of `word/document.xml`
const MAX_DOCX_XML_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Txt,
}

impl DocumentFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| BotError::UnsupportedFormat(path.display().to_string()))?;
        ext.parse()
    }
}

impl FromStr for DocumentFormat {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" => Ok(DocumentFormat::Docx),
            "txt" | "md" => Ok(DocumentFormat::Txt),
            other => Err(BotError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Txt => "txt",
        };
        f.write_str(name)
    }
}

/// Where a chunk came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// File name of the source document
    pub source: String,
    /// Index of the chunk within its document
    pub position: usize,
    /// Offset of the chunk's first character in the extracted text
    pub char_offset: usize,
}

/// Represents a chunk of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Outcome of ingesting the documents directory
#[derive(Debug, Default)]
pub struct IngestReport {
    pub files_ingested: usize,
    pub chunks_added: usize,
    /// Files that were skipped, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Extract plain text from document bytes
pub fn extract_text(bytes: &[u8], format: DocumentFormat, path: &str) -> Result<String> {
    let extraction_error = |message: String| BotError::Extraction {
        path: path.to_string(),
        message,
    };

    let text = match format {
        DocumentFormat::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| extraction_error(e.to_string()))?
        }
        DocumentFormat::Docx => extract_docx(bytes).map_err(extraction_error)?,
        DocumentFormat::Txt => String::from_utf8(bytes.to_vec())
            .map_err(|e| extraction_error(format!("not valid UTF-8: {}", e)))?,
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(extraction_error("no text found".to_string()));
    }
    Ok(text.to_string())
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, String> {
    use quick_xml::events::Event;

    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let mut xml = Vec::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| format!("word/document.xml: {}", e))?
        .take(MAX_DOCX_XML_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| e.to_string())?;
    if xml.len() as u64 >= MAX_DOCX_XML_BYTES {
        return Err("word/document.xml exceeds size limit".to_string());
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" => out.push('\n'),
                b"tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                out.push_str(&t.unescape().map_err(|e| e.to_string())?);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Split text into overlapping chunks of `chunk_size` characters
///
/// Consecutive chunks share exactly `overlap` characters; the last chunk may
/// be shorter. Requires `overlap < chunk_size`.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    debug_assert!(overlap < chunk_size);
    if text.trim().is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();

    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

pub struct DocumentProcessor {
    vector_store: Arc<VectorStoreManager>,
    documents_dir: PathBuf,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentProcessor {
    pub fn new(
        vector_store: Arc<VectorStoreManager>,
        documents_dir: PathBuf,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            vector_store,
            documents_dir,
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn documents_dir(&self) -> &Path {
        &self.documents_dir
    }

    /// Split extracted text into chunks tagged with their source
    pub fn chunk_document(&self, source: &str, text: &str) -> Vec<DocumentChunk> {
        let step = self.chunk_size - self.chunk_overlap;
        chunk_text(text, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(position, content)| DocumentChunk {
                id: uuid::Uuid::new_v4().to_string(),
                content,
                metadata: ChunkMetadata {
                    source: source.to_string(),
                    position,
                    char_offset: position * step,
                },
            })
            .collect()
    }

    /// Ingest one file of a declared format
    ///
    /// Returns the number of chunks added to the vector store.
    pub async fn ingest_file(&self, path: &Path, format: DocumentFormat) -> Result<usize> {
        let display = path.display().to_string();
        log::info!("Ingesting {} as {}", display, format);

        let bytes = tokio::fs::read(path).await.map_err(|e| BotError::Extraction {
            path: display.clone(),
            message: e.to_string(),
        })?;

        let extract_path = display.clone();
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, format, &extract_path))
            .await
            .map_err(|e| BotError::Extraction {
                path: display.clone(),
                message: e.to_string(),
            })??;

        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(display);
        let chunks = self.chunk_document(&source, &text);
        log::info!("Split {} into {} chunks", source, chunks.len());

        self.vector_store.add(&chunks).await
    }

    /// Ingest one file, detecting the format from its extension
    pub async fn ingest_path(&self, path: &Path) -> Result<usize> {
        let format = DocumentFormat::from_path(path)?;
        self.ingest_file(path, format).await
    }

    /// Ingest every file under the documents directory
    ///
    /// Unsupported or unreadable files are logged and skipped; an embedding
    /// failure aborts the run.
    pub async fn ingest_directory(&self) -> Result<IngestReport> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.documents_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        log::info!(
            "Ingesting {} files from {}",
            files.len(),
            self.documents_dir.display()
        );

        let mut report = IngestReport::default();
        for path in files {
            match self.ingest_path(&path).await {
                Ok(count) => {
                    report.files_ingested += 1;
                    report.chunks_added += count;
                }
                Err(e @ (BotError::UnsupportedFormat(_) | BotError::Extraction { .. })) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    report
                        .skipped
                        .push((path.display().to_string(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Ingestion complete: {} files, {} chunks, {} skipped",
            report.files_ingested,
            report.chunks_added,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Save an uploaded file into the documents directory
    ///
    /// The name is reduced to its final component and restricted to a safe
    /// character set. Unsupported formats are rejected before writing.
    pub async fn store_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let safe_name = sanitize_file_name(file_name);
        DocumentFormat::from_path(Path::new(&safe_name))?;

        let path = self.documents_dir.join(&safe_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BotError::Extraction {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        log::info!("Stored upload at {}", path.display());
        Ok(path)
    }
}

fn sanitize_file_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload.txt".to_string()
    } else {
        cleaned
    }
}
