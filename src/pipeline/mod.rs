//! Document pipeline: OCR, image description, merge, persist.
//!
//! One run moves a record `queued → running → succeeded | failed`. The result and the
//! `succeeded` status are written in a single transaction, so a crashed or failed run
//! never leaves a partial result behind.

pub mod extract;
mod merge;
mod mistral;
mod vision;

pub use extract::{DetectedImage, ExtractError, ImageDescriber, OcrExtractor, OcrOutput};
pub use merge::merge_descriptions;
pub use mistral::MistralOcr;
pub use vision::VisionDescriber;

use std::sync::Arc;
use std::time::Instant;

use futures::{StreamExt, TryStreamExt};
use thiserror::Error;

use crate::checksum::Digest;
use crate::content::{ContentError, ContentStore};
use crate::state_machine::StatusEvent;
use crate::storage::models::{ImageDescription, OcrResult};
use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result of one [`DocumentPipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
    /// The record was deleted before or during the run.
    Vanished,
}

pub struct DocumentPipeline {
    content: ContentStore,
    ocr: Arc<dyn OcrExtractor>,
    describer: Arc<dyn ImageDescriber>,
    image_concurrency: usize,
}

impl DocumentPipeline {
    pub fn new(
        content: ContentStore,
        ocr: Arc<dyn OcrExtractor>,
        describer: Arc<dyn ImageDescriber>,
        image_concurrency: usize,
    ) -> Self {
        Self {
            content,
            ocr,
            describer,
            image_concurrency: image_concurrency.max(1),
        }
    }

    /// Process a `queued` record to completion. Extraction failures are recorded on
    /// the record and reported as [`RunOutcome::Failed`]; only metadata store errors
    /// escape as `Err`.
    pub async fn run(&self, digest: &Digest) -> Result<RunOutcome, DatabaseError> {
        let db = self.content.db();
        if db.transition(digest, StatusEvent::Start)?.is_none() {
            return Ok(RunOutcome::Vanished);
        }

        let started = Instant::now();
        tracing::info!(digest = %digest, "Pipeline run started");

        match self.execute(digest).await {
            Ok(result) => {
                if !db.complete_processing(digest, &result)? {
                    tracing::warn!(digest = %digest, "Record deleted during run, result dropped");
                    return Ok(RunOutcome::Vanished);
                }
                tracing::info!(
                    digest = %digest,
                    images = result.image_descriptions.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Pipeline run succeeded"
                );
                Ok(RunOutcome::Succeeded)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(digest = %digest, error = %reason, "Pipeline run failed");
                match db.transition(digest, StatusEvent::Fail(reason.clone()))? {
                    Some(_) => Ok(RunOutcome::Failed(reason)),
                    None => Ok(RunOutcome::Vanished),
                }
            }
        }
    }

    async fn execute(&self, digest: &Digest) -> Result<OcrResult, PipelineError> {
        let (record, data) = self.content.retrieve(digest).await?;
        let mime_type = essence(&record.content_type);

        if mime_type.starts_with("image/") {
            let description = self.describer.describe(data, &mime_type).await?;
            return Ok(OcrResult {
                markdown_text: description,
                image_descriptions: Vec::new(),
            });
        }
        if mime_type != "application/pdf" {
            return Err(ExtractError::UnsupportedFormat(mime_type).into());
        }

        let ocr = self.ocr.extract(data, &mime_type).await?;
        tracing::debug!(digest = %digest, images = ocr.images.len(), "OCR complete");

        let descriptions: Vec<ImageDescription> = futures::stream::iter(ocr.images)
            .map(|image| {
                let describer = Arc::clone(&self.describer);
                async move {
                    let text = describer.describe(image.data, &image.mime_type).await?;
                    Ok::<_, ExtractError>(ImageDescription {
                        position_anchor: image.anchor,
                        description_text: text,
                    })
                }
            })
            .buffered(self.image_concurrency)
            .try_collect()
            .await?;

        Ok(OcrResult {
            markdown_text: merge_descriptions(&ocr.markdown, &descriptions),
            image_descriptions: descriptions,
        })
    }
}

/// `Application/PDF; charset=binary` → `application/pdf`.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::essence;

    #[test]
    fn content_type_essence() {
        assert_eq!(essence("Application/PDF; charset=binary"), "application/pdf");
        assert_eq!(essence("image/png"), "image/png");
    }
}
