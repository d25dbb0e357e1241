use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("file {0} not found")]
    NotFound(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extracting text from {path}: {message}")]
    Extract { path: String, message: String },
    #[error("file path {0} leaves the files root")]
    OutsideRoot(String),
}

/// Answers whether a stored article file mentions a phrase, ignoring case.
#[async_trait]
pub trait FileTextScanner: Send + Sync {
    async fn contains_text(&self, file_path: &str, needle: &str) -> Result<bool, ScanError>;
}

/// Reads article files below `root`; `.pdf` files go through text extraction.
#[derive(Debug, Clone)]
pub struct FsTextScanner {
    root: PathBuf,
}

impl FsTextScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn extract_text(&self, file_path: &str) -> Result<String, ScanError> {
        let relative = Path::new(file_path);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(ScanError::OutsideRoot(file_path.to_string()));
        }
        let path = self.root.join(relative);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScanError::NotFound(file_path.to_string()))
            }
            Err(source) => {
                return Err(ScanError::Io {
                    path: file_path.to_string(),
                    source,
                })
            }
        };

        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }

        let extracted = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|err| ScanError::Extract {
                path: file_path.to_string(),
                message: err.to_string(),
            })?;
        extracted.map_err(|err| ScanError::Extract {
            path: file_path.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl FileTextScanner for FsTextScanner {
    async fn contains_text(&self, file_path: &str, needle: &str) -> Result<bool, ScanError> {
        let text = self.extract_text(file_path).await?;
        debug!(file_path, chars = text.len(), "scanned file text");
        Ok(contains_ignoring_case(&text, needle))
    }
}

/// Case-insensitive containment that also tolerates line breaks and repeated spaces inside the needle.
pub fn contains_ignoring_case(haystack: &str, needle: &str) -> bool {
    let collapse = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    collapse(haystack).contains(&collapse(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_ignores_case_and_wrapping() {
        assert!(contains_ignoring_case("... FUNDED BY\nSCOAP3 ...", "Funded by SCOAP3"));
        assert!(!contains_ignoring_case("funded by someone", "Funded by SCOAP3"));
    }

    #[tokio::test]
    async fn scans_plain_text_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("files/7")).unwrap();
        std::fs::write(dir.path().join("files/7/main.xml"), "<p>funded by scoap3</p>").unwrap();

        let scanner = FsTextScanner::new(dir.path());
        assert!(scanner.contains_text("files/7/main.xml", "Funded by SCOAP3").await.unwrap());
        assert!(!scanner.contains_text("files/7/main.xml", "Erratum").await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = FsTextScanner::new(dir.path());
        let err = scanner.contains_text("files/1/gone.pdf", "x").await.unwrap_err();
        assert!(matches!(err, ScanError::NotFound(path) if path == "files/1/gone.pdf"));
    }

    #[tokio::test]
    async fn paths_outside_the_root_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("root")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "funded by scoap3").unwrap();

        let scanner = FsTextScanner::new(dir.path().join("root"));
        for path in ["../secret.txt", "files/../../secret.txt"] {
            let err = scanner.contains_text(path, "scoap3").await.unwrap_err();
            assert!(matches!(err, ScanError::OutsideRoot(_)), "{path}");
        }
        let absolute = dir.path().join("secret.txt");
        let err = scanner.contains_text(absolute.to_str().unwrap(), "scoap3").await.unwrap_err();
        assert!(matches!(err, ScanError::OutsideRoot(_)));
    }

    #[tokio::test]
    async fn broken_pdf_is_an_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.pdf"), b"not a pdf").unwrap();
        let scanner = FsTextScanner::new(dir.path());
        let err = scanner.contains_text("broken.pdf", "x").await.unwrap_err();
        assert!(matches!(err, ScanError::Extract { .. }));
    }
}
