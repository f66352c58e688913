use std::path::PathBuf;

use axum::extract::multipart::{Field, Multipart};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::staging::StagedMedia;
use crate::pipeline::Stage;

/// Form field carrying the media upload.
pub const MEDIA_FIELD: &str = "media";
/// Form field carrying the optional text payload.
pub const TEXT_FIELD: &str = "text";

/// How many leading bytes the sniffer gets to look at.
const SNIFF_LEN: usize = 8192;

/// The text part of an upload, kept verbatim for forwarding, with a parsed
/// reading alongside when the content happens to be JSON.
#[derive(Debug, Clone)]
pub struct TextPayload {
    pub raw: String,
    pub parsed: Option<serde_json::Value>,
}

impl TextPayload {
    pub fn new(raw: String) -> Self {
        let parsed = serde_json::from_str(&raw).ok();
        TextPayload { raw, parsed }
    }
}

/// The part kinds the upload schema knows. Fields outside this set are
/// rejected, never silently dropped.
pub enum UploadPart {
    Media(StagedMedia),
    Text(TextPayload),
}

/// Everything the receiver accepted from one request.
pub struct StagedUpload {
    pub media: Option<StagedMedia>,
    pub text: Option<TextPayload>,
}

/// Takes the inbound multipart body apart, stages media on disk and enforces
/// the upload contract while the bytes arrive.
pub struct UploadReceiver {
    max_upload_bytes: u64,
    allowed_content_types: Vec<String>,
    staging_dir: Option<PathBuf>,
}

impl UploadReceiver {
    pub fn new(
        max_upload_bytes: u64,
        allowed_content_types: Vec<String>,
        staging_dir: Option<PathBuf>,
    ) -> Self {
        UploadReceiver {
            max_upload_bytes,
            allowed_content_types,
            staging_dir,
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn receive(&self, mut multipart: Multipart) -> Result<StagedUpload, PipelineError> {
        let mut media = None;
        let mut text = None;
        // Size accounting spans all fields of one request.
        let mut total: u64 = 0;

        while let Some(field) = multipart.next_field().await? {
            let part = match field.name() {
                Some(MEDIA_FIELD) => {
                    // Duplicates are caught before staging so a request can
                    // never hold two temp files at once.
                    if media.is_some() {
                        return Err(PipelineError::DuplicateField(MEDIA_FIELD));
                    }
                    UploadPart::Media(self.stage_media(field, &mut total).await?)
                }
                Some(TEXT_FIELD) => {
                    if text.is_some() {
                        return Err(PipelineError::DuplicateField(TEXT_FIELD));
                    }
                    UploadPart::Text(self.read_text(field, &mut total).await?)
                }
                Some(name) => return Err(PipelineError::UnknownField(name.to_string())),
                // Parts without a name are dropped.
                None => continue,
            };
            match part {
                UploadPart::Media(staged) => media = Some(staged),
                UploadPart::Text(payload) => text = Some(payload),
            }
        }

        debug!(
            stage = %Stage::Staged,
            total_bytes = total,
            structured_text = text.as_ref().map_or(false, |t| t.parsed.is_some()),
            "upload ready for dispatch"
        );
        Ok(StagedUpload { media, text })
    }

    /// Streams a media field into a temp file chunk by chunk. The size cap is
    /// checked as bytes arrive and a window of the leading bytes is kept for
    /// content type detection once the field is complete.
    async fn stage_media(
        &self,
        mut field: Field<'_>,
        total: &mut u64,
    ) -> Result<StagedMedia, PipelineError> {
        let file_name = field.file_name().map(str::to_owned);
        let declared = field.content_type().map(str::to_owned);

        let temp = match &self.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }?
        .into_temp_path();
        let mut writer = File::create(&temp).await?;

        let mut head = Vec::with_capacity(SNIFF_LEN);
        let mut written: u64 = 0;
        while let Some(chunk) = field.chunk().await? {
            *total += chunk.len() as u64;
            if *total > self.max_upload_bytes {
                // The temp path guard removes the partial file on return.
                return Err(PipelineError::PayloadTooLarge {
                    limit: self.max_upload_bytes,
                });
            }
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        drop(writer);

        let detected = self.sniff(&head)?;
        if declared.as_deref() != Some(detected.as_str()) {
            debug!(
                ?declared,
                %detected, "declared content type differs from sniffed bytes"
            );
        }
        debug!(stage = %Stage::Validated, bytes = written, content_type = %detected, "media accepted");
        Ok(StagedMedia::new(temp, detected, file_name, written))
    }

    /// The sniffed type decides; the declared header is never trusted.
    fn sniff(&self, head: &[u8]) -> Result<String, PipelineError> {
        let detected = infer::get(head).map(|kind| kind.mime_type().to_string());
        match detected {
            Some(mime) if self.allowed_content_types.iter().any(|t| t == &mime) => Ok(mime),
            other => Err(PipelineError::UnsupportedMediaType { detected: other }),
        }
    }

    async fn read_text(
        &self,
        mut field: Field<'_>,
        total: &mut u64,
    ) -> Result<TextPayload, PipelineError> {
        let mut buf = Vec::new();
        while let Some(chunk) = field.chunk().await? {
            *total += chunk.len() as u64;
            if *total > self.max_upload_bytes {
                return Err(PipelineError::PayloadTooLarge {
                    limit: self.max_upload_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        let raw = String::from_utf8(buf).map_err(|_| PipelineError::TextNotUtf8)?;
        Ok(TextPayload::new(raw))
    }
}
