use crate::llm::ContextDocument;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Pdf(String),
    #[error("Unsupported file type: .{0}")]
    Unsupported(String),
}

/// Parse a knowledge base file into a context document
pub fn parse_file(path: &Path) -> Result<ContextDocument, DocumentError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let (content, file_type) = match ext.as_str() {
        "txt" => (fs::read_to_string(path)?, "txt"),
        "md" | "markdown" => (fs::read_to_string(path)?, "md"),
        "pdf" => {
            let bytes = fs::read(path)?;
            let content = pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| DocumentError::Pdf(e.to_string()))?;
            (content, "pdf")
        }
        _ => return Err(DocumentError::Unsupported(ext)),
    };

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let size = fs::metadata(path)?.len();

    Ok(ContextDocument {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        file_type: file_type.to_string(),
        content,
        size,
    })
}

/// Load every supported file in `dir`, ordered by file name.
///
/// Unsupported files are skipped; a supported file that fails to parse is an error.
pub fn load_dir(dir: &Path) -> Result<Vec<ContextDocument>, DocumentError> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut documents = Vec::new();
    for path in paths {
        match parse_file(&path) {
            Ok(doc) => documents.push(doc),
            Err(DocumentError::Unsupported(ext)) => {
                warn!(path = %path.display(), ext = %ext, "Skipping unsupported knowledge file");
            }
            Err(e) => return Err(e),
        }
    }

    info!(dir = %dir.display(), count = documents.len(), "Loaded context documents");
    Ok(documents)
}
