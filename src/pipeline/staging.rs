use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs::File;
use tracing::{debug, warn};

/// The staged media of one request: a temp file on local disk plus what the
/// receiver learned about it.
///
/// Exactly one staged file exists per request. Dropping the guard removes it
/// from disk exactly once, so whoever holds the guard last (normally the
/// response stream) decides when cleanup happens.
pub struct StagedMedia {
    temp: Option<TempPath>,
    location: PathBuf,
    content_type: String,
    file_name: Option<String>,
    len: u64,
}

impl StagedMedia {
    pub(crate) fn new(
        temp: TempPath,
        content_type: String,
        file_name: Option<String>,
        len: u64,
    ) -> Self {
        let location = temp.to_path_buf();
        StagedMedia {
            temp: Some(temp),
            location,
            content_type,
            file_name,
            len,
        }
    }

    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Content type detected from the staged bytes, not the declared header.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// File name the client sent, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opens a fresh read handle on the staged file. Every downstream send
    /// gets its own handle, so each one reads from the first byte.
    pub async fn reopen(&self) -> std::io::Result<File> {
        File::open(&self.location).await
    }
}

impl Drop for StagedMedia {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            match temp.close() {
                Ok(()) => debug!(path = %self.location.display(), "removed staged upload"),
                Err(err) => {
                    warn!(path = %self.location.display(), %err, "failed to remove staged upload")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn drop_removes_the_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(b"\x89PNG\r\n\x1a\n").unwrap();

        let staged = StagedMedia::new(
            file.into_temp_path(),
            "image/png".into(),
            Some("frame.png".into()),
            8,
        );
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(staged.len(), 8);

        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn reopen_always_reads_from_the_first_byte() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        file.write_all(b"abcdef").unwrap();
        let staged = StagedMedia::new(file.into_temp_path(), "image/png".into(), None, 6);

        for _ in 0..2 {
            let mut contents = String::new();
            staged
                .reopen()
                .await
                .unwrap()
                .read_to_string(&mut contents)
                .await
                .unwrap();
            assert_eq!(contents, "abcdef");
        }
    }
}
