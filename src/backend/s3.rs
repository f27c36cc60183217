use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use ring::{digest, hmac};

use super::{request_error, status_error, BackendError, Locator};
use crate::checksum::hex_encode;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services. Defaults to AWS.
    pub endpoint: Option<String>,
    /// Key prefix under which objects are written.
    pub prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// S3-compatible object store, addressed path-style and signed with SigV4.
pub struct S3Store {
    config: S3Config,
    client: Client,
    endpoint: url::Url,
    retry: RetryPolicy,
}

impl S3Store {
    pub fn new(
        config: S3Config,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, anyhow::Error> {
        let endpoint = match config.endpoint.as_deref() {
            Some(e) => url::Url::parse(e)?,
            None => url::Url::parse(&format!("https://s3.{}.amazonaws.com", config.region))?,
        };
        if endpoint.host_str().is_none() {
            anyhow::bail!("S3 endpoint has no host: {endpoint}");
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            config,
            client,
            endpoint,
            retry,
        })
    }

    fn object_key(&self, name: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("files/{name}")
        } else {
            format!("{prefix}/files/{name}")
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let mut uri = format!("/{}", uri_encode(&self.config.bucket));
        for segment in key.split('/') {
            uri.push('/');
            uri.push_str(&uri_encode(segment));
        }
        uri
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<Response, BackendError> {
        let canonical_uri = self.canonical_uri(key);
        let url = format!(
            "{}{}",
            self.endpoint.as_str().trim_end_matches('/'),
            canonical_uri
        );

        let signed = sign_request(
            &SigningInput {
                method: method.as_str(),
                canonical_uri: &canonical_uri,
                host: &self.host_header(),
                payload: &body,
                region: &self.config.region,
                access_key_id: &self.config.access_key_id,
                secret_access_key: &self.config.secret_access_key,
                session_token: self.config.session_token.as_deref(),
            },
            Utc::now(),
        );

        let mut request = self
            .client
            .request(method, url)
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.payload_hash);
        if let Some(token) = &self.config.session_token {
            request = request.header("x-amz-security-token", token);
        }
        if let Some(ct) = content_type {
            request = request.header("content-type", ct);
        }

        request.body(body).send().await.map_err(request_error)
    }

    pub async fn put(&self, data: Bytes, content_type: &str) -> Result<Locator, BackendError> {
        let key = self.object_key(&uuid::Uuid::new_v4().simple().to_string());

        self.retry
            .run("s3.put", || async {
                let resp = self
                    .send(Method::PUT, &key, data.clone(), Some(content_type))
                    .await?;
                expect_success(resp, "S3 upload").await
            })
            .await?;

        Ok(Locator::new(key))
    }

    pub async fn get(&self, locator: &Locator) -> Result<Bytes, BackendError> {
        self.retry
            .run("s3.get", || async {
                let resp = self
                    .send(Method::GET, locator.as_str(), Bytes::new(), None)
                    .await?;
                let resp = expect_success(resp, "S3 download").await?;
                resp.bytes().await.map_err(request_error)
            })
            .await
    }

    pub async fn exists(&self, locator: &Locator) -> Result<bool, BackendError> {
        self.retry
            .run("s3.head", || async {
                let resp = self
                    .send(Method::HEAD, locator.as_str(), Bytes::new(), None)
                    .await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(false);
                }
                expect_success(resp, "S3 head").await?;
                Ok(true)
            })
            .await
    }

    /// S3 reports success for deletes of missing keys, so existence is checked first.
    pub async fn delete(&self, locator: &Locator) -> Result<bool, BackendError> {
        if !self.exists(locator).await? {
            return Ok(false);
        }

        self.retry
            .run("s3.delete", || async {
                let resp = self
                    .send(Method::DELETE, locator.as_str(), Bytes::new(), None)
                    .await?;
                expect_success(resp, "S3 delete").await?;
                Ok(true)
            })
            .await
    }
}

async fn expect_success(resp: Response, context: &str) -> Result<Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, context, &body))
}

// ============================================================================
// SigV4
// ============================================================================

pub(crate) struct SigningInput<'a> {
    pub method: &'a str,
    pub canonical_uri: &'a str,
    pub host: &'a str,
    pub payload: &'a [u8],
    pub region: &'a str,
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
}

#[derive(Debug)]
pub(crate) struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub payload_hash: String,
}

pub(crate) fn sign_request(input: &SigningInput<'_>, now: DateTime<Utc>) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(input.payload);

    let mut canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        input.host, payload_hash, amz_date
    );
    let mut signed_headers = String::from("host;x-amz-content-sha256;x-amz-date");
    if let Some(token) = input.session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{token}\n"));
        signed_headers.push_str(";x-amz-security-token");
    }

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        input.method, input.canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{date_stamp}/{}/s3/aws4_request", input.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(input.secret_access_key, &date_stamp, input.region, "s3");
    let signature = hex_encode(&hmac_sha256(&key, string_to_sign.as_bytes()));

    SignedHeaders {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            input.access_key_id
        ),
        amz_date,
        payload_hash,
    }
}

pub(crate) fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex_encode(digest::digest(&digest::SHA256, data).as_ref())
}

/// RFC 3986 unreserved characters pass through; everything else is percent-encoded.
fn uri_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
