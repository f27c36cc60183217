//! Image descriptions through an OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::extract::{ExtractError, ImageDescriber};
use crate::retry::RetryPolicy;

const PROMPT: &str = "Describe this image. Complex, textual or schematic images should have \
more details to reflect their full content. Do not output anything other than the description.";

pub struct VisionDescriber {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

impl VisionDescriber {
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

    async fn request(&self, body: &serde_json::Value) -> Result<String, ExtractError> {
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

        let chat: ChatResponse = resp.json().await.map_err(ExtractError::from_request)?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ExtractError::InvalidResponse("empty description".to_string()))
    }
}

#[async_trait]
impl ImageDescriber for VisionDescriber {
    async fn describe(&self, data: Bytes, mime_type: &str) -> Result<String, ExtractError> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{mime_type};base64,{}", STANDARD.encode(&data))
                        }
                    }
                ]
            }]
        });

        self.retry.run("describe", || self.request(&body)).await
    }
}
