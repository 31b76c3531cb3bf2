//! Minimal S3-compatible HTTP client for a single node.
//!
//! Speaks just the slice of the S3 REST API this engine needs: object
//! PUT/GET/DELETE/HEAD, ListObjectsV2, and bucket HEAD/PUT, with AWS
//! Signature V4 request signing. Path-style addressing throughout
//! (`{endpoint}/{bucket}/{key}`), since nodes are addressed by IP:port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use crate::catalog::{ListPage, ObjectStore};
use crate::config::NodeConfig;
use crate::error::{StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
const DEFAULT_REGION: &str = "us-east-1";

static LIST_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<Key>([^<]*)</Key>").expect("valid regex"));
static LIST_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>").expect("valid regex"));
static LIST_TRUNCATED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").expect("valid regex"));

/// SigV4-signing client bound to one node. The node name is the bucket.
pub struct S3CompatClient {
    http: reqwest::Client,
    endpoint: Url,
    host_header: String,
    /// Externally reachable base URL and host header for presigned URLs,
    /// when the node endpoint is not reachable from clients.
    external: Option<(Url, String)>,
    bucket: String,
    access_key: String,
    secret_key: String,
    region: String,
    timeout: Duration,
    bucket_ready: AtomicBool,
}

fn host_header_of(url: &Url) -> StoreResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| StoreError::Config(format!("endpoint '{}' has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

impl S3CompatClient {
    pub fn new(node: &NodeConfig, timeout: Duration) -> StoreResult<Self> {
        let endpoint = Url::parse(node.endpoint.trim_end_matches('/'))?;
        let host_header = host_header_of(&endpoint)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StoreError::Http)?;

        Ok(Self {
            http,
            endpoint,
            host_header,
            external: None,
            bucket: node.name.clone(),
            access_key: node.access_key.clone(),
            secret_key: node.secret_key.clone(),
            region: DEFAULT_REGION.to_string(),
            timeout,
            bucket_ready: AtomicBool::new(false),
        })
    }

    /// Presigned URLs are signed against this base instead of the node
    /// endpoint, so clients outside the storage network can use them.
    pub fn with_external_endpoint(mut self, external: Option<&str>) -> StoreResult<Self> {
        self.external = match external {
            Some(base) => {
                let url = Url::parse(base.trim_end_matches('/'))?;
                let host = host_header_of(&url)?;
                Some((url, host))
            }
            None => None,
        };
        Ok(self)
    }

    fn node_err(&self, message: impl Into<String>) -> StoreError {
        StoreError::Client {
            node: self.bucket.clone(),
            message: message.into(),
        }
    }

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{}", uri_encode(&self.bucket, false), uri_encode(key, false))
    }

    fn bucket_path(&self) -> String {
        format!("/{}", uri_encode(&self.bucket, false))
    }

    /// Sign and send one request. `canonical_uri` must already be
    /// percent-encoded; `query` is canonicalized here.
    async fn send(
        &self,
        method: Method,
        canonical_uri: &str,
        query: &[(String, String)],
        body: Bytes,
    ) -> StoreResult<reqwest::Response> {
        let payload_hash = sha256_hex(&body);
        let now = Utc::now();
        let (amz_date, authorization) =
            self.sign(&method, canonical_uri, query, &payload_hash, now)?;

        let mut url = self
            .endpoint
            .join(canonical_uri)
            .map_err(|e| self.node_err(format!("invalid request path: {}", e)))?;
        if !query.is_empty() {
            url.set_query(Some(&canonical_query(query)));
        }

        let request = self
            .http
            .request(method, url)
            .header("host", &self.host_header)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization)
            .body(body);

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout {
                    operation: format!("{} {}", self.bucket, canonical_uri),
                    duration: self.timeout,
                }
            } else {
                self.node_err(e.to_string())
            }
        })
    }

    /// SigV4: canonical request -> string to sign -> HMAC chain.
    fn sign(
        &self,
        method: &Method,
        canonical_uri: &str,
        query: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host_header, payload_hash, amz_date
        );
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query(query),
            canonical_headers,
            SIGNED_HEADERS,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", datestamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&datestamp)?,
            string_to_sign.as_bytes(),
        )?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, SIGNED_HEADERS, signature
        );
        Ok((amz_date, authorization))
    }

    /// SigV4 derived signing key for one date.
    fn signing_key(&self, datestamp: &str) -> StoreResult<Vec<u8>> {
        let mut key =
            hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), datestamp.as_bytes())?;
        key = hmac_sha256(&key, self.region.as_bytes())?;
        key = hmac_sha256(&key, b"s3")?;
        key = hmac_sha256(&key, b"aws4_request")?;
        Ok(key)
    }

    /// SigV4 query-string presigning for a GET, valid for `expires_in`.
    fn presign_get(&self, key: &str, expires_in: Duration, now: DateTime<Utc>) -> StoreResult<String> {
        let (base, host_header) = match &self.external {
            Some((url, host)) => (url, host.as_str()),
            None => (&self.endpoint, self.host_header.as_str()),
        };
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", datestamp, self.region);

        let query = vec![
            (
                "X-Amz-Algorithm".to_string(),
                "AWS4-HMAC-SHA256".to_string(),
            ),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.access_key, scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            (
                "X-Amz-Expires".to_string(),
                expires_in.as_secs().max(1).to_string(),
            ),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];

        let canonical_uri = self.object_path(key);
        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            canonical_uri,
            canonical_query(&query),
            host_header
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&datestamp)?,
            string_to_sign.as_bytes(),
        )?);

        let mut url = base
            .join(&canonical_uri)
            .map_err(|e| self.node_err(format!("invalid presign path: {}", e)))?;
        url.set_query(Some(&format!(
            "{}&X-Amz-Signature={}",
            canonical_query(&query),
            signature
        )));
        Ok(url.to_string())
    }

    async fn status_error(&self, operation: &str, response: reqwest::Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        self.node_err(format!("{} returned {}: {}", operation, status, snippet))
    }
}

#[async_trait]
impl ObjectStore for S3CompatClient {
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let response = self
            .send(Method::PUT, &self.object_path(key), &[], data)
            .await?;
        if response.status().is_success() {
            debug!(node = self.bucket.as_str(), key, "object stored");
            Ok(())
        } else {
            Err(self.status_error("put object", response).await)
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let response = self
            .send(Method::GET, &self.object_path(key), &[], Bytes::new())
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.to_string())),
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|e| self.node_err(e.to_string())),
            _ => Err(self.status_error("get object", response).await),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let response = self
            .send(Method::DELETE, &self.object_path(key), &[], Bytes::new())
            .await?;
        // Deleting an absent object is not an error.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.status_error("delete object", response).await)
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let response = self
            .send(Method::HEAD, &self.object_path(key), &[], Bytes::new())
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(self.status_error("head object", response).await),
        }
    }

    async fn list_page(&self, token: Option<&str>) -> StoreResult<ListPage> {
        let mut query = vec![("list-type".to_string(), "2".to_string())];
        if let Some(token) = token {
            query.push(("continuation-token".to_string(), token.to_string()));
        }

        let response = self
            .send(Method::GET, &self.bucket_path(), &query, Bytes::new())
            .await?;
        match response.status() {
            // A node with no bucket yet simply has no objects.
            StatusCode::NOT_FOUND => Ok(ListPage::default()),
            status if status.is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| self.node_err(e.to_string()))?;
                Ok(parse_list_response(&body))
            }
            _ => Err(self.status_error("list objects", response).await),
        }
    }

    async fn bucket_exists(&self) -> StoreResult<bool> {
        let response = self
            .send(Method::HEAD, &self.bucket_path(), &[], Bytes::new())
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(self.status_error("head bucket", response).await),
        }
    }

    async fn presigned_get_url(&self, key: &str, expires_in: Duration) -> StoreResult<String> {
        self.presign_get(key, expires_in, Utc::now())
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        if self.bucket_ready.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.bucket_exists().await? {
            self.bucket_ready.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let response = self
            .send(Method::PUT, &self.bucket_path(), &[], Bytes::new())
            .await?;
        // 409 means another writer created it first; that is fine.
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            info!(node = self.bucket.as_str(), "created bucket");
            self.bucket_ready.store(true, Ordering::Relaxed);
            Ok(())
        } else {
            Err(self.status_error("create bucket", response).await)
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| StoreError::Internal {
        message: format!("HMAC init failed: {}", e),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 percent-encoding as SigV4 requires; slashes in object keys stay
/// literal in the canonical URI.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

fn parse_list_response(body: &str) -> ListPage {
    let keys = LIST_KEY_RE
        .captures_iter(body)
        .map(|c| xml_unescape(&c[1]))
        .filter(|k| !k.ends_with('/'))
        .collect();
    let next_token = if LIST_TRUNCATED_RE.is_match(body) {
        LIST_TOKEN_RE
            .captures(body)
            .map(|c| xml_unescape(&c[1]))
    } else {
        None
    };
    ListPage { keys, next_token }
}

fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
