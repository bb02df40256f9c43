//! # S3 object store client
//!
//! [`S3Client`] implements the core [`ObjectStore`] trait against the S3 REST API
//! (or any S3-compatible endpoint) using plain `reqwest` requests signed with
//! AWS Signature Version 4.
//!
//! ## Client Usage
//!
//! - Construct with [`S3Client::new_from_env`] (`AWS_ACCESS_KEY_ID`,
//!   `AWS_SECRET_ACCESS_KEY`, optional `AWS_SESSION_TOKEN`, `AWS_REGION` or
//!   `AWS_DEFAULT_REGION`, optional `S3_ENDPOINT_URL`).
//! - Requests use path-style addressing: `<endpoint>/<bucket>/<key>`.
//! - File bodies are streamed from disk and sent with `UNSIGNED-PAYLOAD`, so
//!   nothing is buffered or hashed up front.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::{Body, Method, Url};
use sha2::{Digest, Sha256};
use std::env;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use urlencoding::encode;

use seqrun_upload_core::contract::{BackendError, ObjectStore, PutObject, PutObjectOutput};

const DEFAULT_REGION: &str = "eu-west-2";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SERVICE: &str = "s3";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct S3Client {
    client: reqwest::Client,
    credentials: Credentials,
    region: String,
    endpoint: Url,
}

impl S3Client {
    pub fn new(
        credentials: Credentials,
        region: impl Into<String>,
        endpoint: Option<&str>,
    ) -> Result<Self, BackendError> {
        let region = region.into();
        let endpoint = match endpoint {
            Some(url) => Url::parse(url)?,
            None => Url::parse(&format!("https://s3.{region}.amazonaws.com"))?,
        };
        if endpoint.host_str().is_none() {
            return Err(format!("endpoint {endpoint} has no host").into());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        tracing::info!(
            region = %region,
            endpoint = %endpoint,
            access_key_id = %credentials.access_key_id,
            "Initialised S3 client"
        );
        Ok(Self {
            client,
            credentials,
            region,
            endpoint,
        })
    }

    pub fn new_from_env() -> Result<Self, BackendError> {
        dotenvy::dotenv().ok();
        let access_key_id = env::var("AWS_ACCESS_KEY_ID").map_err(|e| {
            tracing::error!(error = ?e, "AWS_ACCESS_KEY_ID missing in environment");
            format!("AWS_ACCESS_KEY_ID: {e}")
        })?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").map_err(|e| {
            tracing::error!(error = ?e, "AWS_SECRET_ACCESS_KEY missing in environment");
            format!("AWS_SECRET_ACCESS_KEY: {e}")
        })?;
        let region = env::var("AWS_REGION")
            .or_else(|_| env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| DEFAULT_REGION.to_string());
        let endpoint = env::var("S3_ENDPOINT_URL").ok();

        Self::new(
            Credentials {
                access_key_id,
                secret_access_key,
                session_token: env::var("AWS_SESSION_TOKEN").ok(),
            },
            region,
            endpoint.as_deref(),
        )
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn request(&self, method: Method, bucket: &str, key: Option<&str>) -> Result<reqwest::RequestBuilder, BackendError> {
        let path = canonical_uri(bucket, key);
        let url = self.endpoint.join(&path)?;
        let headers = sign(
            &self.credentials,
            &self.region,
            method.as_str(),
            &path,
            &self.host(),
            Utc::now(),
        )?;

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn check_bucket(&self, bucket: &str) -> Result<(), BackendError> {
        tracing::debug!(bucket, "Checking bucket access");
        let response = self
            .request(Method::HEAD, bucket, None)?
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            tracing::error!(bucket, %status, "Bucket check failed");
            return Err(format!("HEAD bucket returned {status}").into());
        }
        Ok(())
    }

    async fn put_object(&self, req: PutObject) -> Result<PutObjectOutput, BackendError> {
        let file = tokio::fs::File::open(&req.local_path).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .request(Method::PUT, &req.bucket, Some(&req.key))?
            .header(CONTENT_LENGTH, req.size)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(bucket = %req.bucket, key = %req.key, %status, "PUT object failed");
            return Err(format!("PUT {} returned {status}: {text}", req.key).into());
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_owned())
            .ok_or("response carried no ETag header")?;
        Ok(PutObjectOutput { etag })
    }
}

/// `/<bucket>[/<key>]` with every segment URI-encoded the way SigV4 expects.
pub fn canonical_uri(bucket: &str, key: Option<&str>) -> String {
    let mut uri = format!("/{}", encode(bucket));
    if let Some(key) = key {
        for segment in key.split('/') {
            uri.push('/');
            uri.push_str(&encode(segment));
        }
    }
    uri
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, BackendError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| format!("invalid signing key: {e}"))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 signing key for one day, region and service.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, BackendError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, service)?;
    hmac_sha256(&k_service, "aws4_request")
}

/// Headers that authenticate a request with no query string and an unsigned payload.
pub fn sign(
    credentials: &Credentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    host: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, BackendError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers = vec![
        ("host", host.to_string()),
        ("x-amz-content-sha256", UNSIGNED_PAYLOAD.to_string()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "{method}\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{UNSIGNED_PAYLOAD}"
    );

    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );
    let key = signing_key(&credentials.secret_access_key, &date, region, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, &string_to_sign)?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    // host is set by the transport from the URL
    headers.retain(|(name, _)| *name != "host");
    headers.push(("authorization", authorization));
    Ok(headers)
}
