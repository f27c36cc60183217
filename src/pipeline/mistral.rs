//! HTTP client for the Mistral document OCR endpoint.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::extract::{DetectedImage, ExtractError, OcrExtractor, OcrOutput};
use crate::retry::RetryPolicy;

pub struct MistralOcr {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: DocumentInput,
    include_image_base64: bool,
}

#[derive(Serialize)]
struct DocumentInput {
    #[serde(rename = "type")]
    kind: &'static str,
    document_url: String,
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<OcrPage>,
}

#[derive(Deserialize)]
struct OcrPage {
    index: u32,
    markdown: String,
    #[serde(default)]
    images: Vec<OcrImage>,
}

#[derive(Deserialize)]
struct OcrImage {
    id: String,
    #[serde(default)]
    image_base64: Option<String>,
}

impl MistralOcr {
    pub fn new(
        url: String,
        api_key: String,
        model: String,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url,
            api_key,
            model,
            retry,
        })
    }

    async fn request(&self, body: &OcrRequest<'_>) -> Result<OcrResponse, ExtractError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(ExtractError::from_request)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ExtractError::from_status(status, &text));
        }

        resp.json().await.map_err(ExtractError::from_request)
    }
}

#[async_trait]
impl OcrExtractor for MistralOcr {
    async fn extract(&self, data: Bytes, mime_type: &str) -> Result<OcrOutput, ExtractError> {
        if mime_type != "application/pdf" {
            return Err(ExtractError::UnsupportedFormat(mime_type.to_string()));
        }

        let body = OcrRequest {
            model: &self.model,
            document: DocumentInput {
                kind: "document_url",
                document_url: format!("data:{mime_type};base64,{}", STANDARD.encode(&data)),
            },
            include_image_base64: true,
        };

        let response = self.retry.run("ocr", || self.request(&body)).await?;
        tracing::debug!(pages = response.pages.len(), "OCR returned");
        render_pages(response.pages)
    }
}

/// Join pages under `(Page N)` headings and turn each inline image reference into a
/// page-qualified `[page_{p}_{id}]` anchor.
fn render_pages(pages: Vec<OcrPage>) -> Result<OcrOutput, ExtractError> {
    let mut output = OcrOutput::default();

    for page in pages {
        let mut markdown = page.markdown;

        for image in page.images {
            let Some(encoded) = image.image_base64 else {
                continue;
            };
            let (mime_type, payload) = split_data_url(&encoded);
            let data = STANDARD
                .decode(payload)
                .map_err(|e| ExtractError::InvalidResponse(format!("image {}: {e}", image.id)))?;

            let anchor = format!("page_{}_{}", page.index, image.id);
            let reference = format!("![{id}]({id})", id = image.id);
            if markdown.contains(&reference) {
                markdown = markdown.replace(&reference, &format!("[{anchor}]"));
            } else {
                markdown = markdown.replace(&format!("![{}]", image.id), &format!("[{anchor}]"));
            }

            output.images.push(DetectedImage {
                anchor,
                data: Bytes::from(data),
                mime_type,
            });
        }

        output
            .markdown
            .push_str(&format!("\n\n(Page {})\n\n", page.index + 1));
        output.markdown.push_str(&markdown);
        output.markdown.push('\n');
    }

    Ok(output)
}

/// `data:image/jpeg;base64,AAAA` → (`image/jpeg`, `AAAA`). Bare base64 is taken as PNG.
fn split_data_url(value: &str) -> (String, &str) {
    if let Some(rest) = value.strip_prefix("data:") {
        if let Some((header, payload)) = rest.split_once(',') {
            let mime = header.trim_end_matches(";base64");
            return (mime.to_string(), payload);
        }
    }
    ("image/png".to_string(), value)
}
