//! Google Drive v2 REST backend
//!
//! Token acquisition is not handled here: the caller supplies a bearer
//! access token that stays valid for the life of the process.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChildPage, CreateObject, RemoteObject, RemoteStore, Upload, VersionMetadata};
use crate::error::{MirrorError, Result};

/// Drive connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub api_url: String,
    pub upload_url: String,
    pub access_token: String,
    pub timeout_secs: u64,
}

impl DriveConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            api_url: "https://www.googleapis.com/drive/v2".to_string(),
            upload_url: "https://www.googleapis.com/upload/drive/v2".to_string(),
            access_token: access_token.into(),
            timeout_secs: 120,
        }
    }
}

/// Escape a value for a `title='...'` query
pub fn escape_query_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Map a failed response to the transient/permanent taxonomy
pub fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> MirrorError {
    match status {
        429 => MirrorError::RateLimited(retry_after.unwrap_or(1)),
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            MirrorError::RateLimited(retry_after.unwrap_or(1))
        }
        500..=599 => MirrorError::Remote(format!("Drive status {}: {}", status, body)),
        _ => MirrorError::RemoteRejected(format!("Drive status {}: {}", status, body)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildList {
    #[serde(default)]
    items: Vec<ChildReference>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ChildReference {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    id: String,
    head_revision_id: Option<String>,
}

#[derive(Serialize)]
struct ParentReference<'a> {
    id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    title: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<Vec<ParentReference<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
}

impl<'a> FileMetadata<'a> {
    fn with_version(mut self, metadata: &'a VersionMetadata) -> Self {
        self.description = metadata.description.as_deref();
        self.modified_date = metadata
            .modified
            .map(|at| at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string());
        self.version = Some(metadata.version);
        self
    }
}

/// Build a `multipart/related` body: JSON metadata, then the media part
fn multipart_body(boundary: &str, metadata: &[u8], mime_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + bytes.len() + 256);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{}\r\nContent-Type: {}\r\n\r\n", boundary, mime_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

/// Drive v2 client
pub struct DriveRemote {
    client: reqwest::Client,
    config: DriveConfig,
}

impl DriveRemote {
    pub fn new(config: DriveConfig) -> Result<Self> {
        if config.access_token.trim().is_empty() {
            return Err(MirrorError::Config("Drive access token is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.access_token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_after, &body))
    }

    async fn send_multipart(
        &self,
        request: reqwest::RequestBuilder,
        metadata: &FileMetadata<'_>,
        upload: &Upload,
    ) -> Result<FileResource> {
        let boundary = format!("treemirror-{}", uuid::Uuid::new_v4().simple());
        let metadata = serde_json::to_vec(metadata)?;
        let body = multipart_body(&boundary, &metadata, &upload.mime_type, &upload.bytes);
        let response = request
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;
        let file: FileResource = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MirrorError::RemoteRejected(format!("Malformed Drive reply: {}", e)))?;
        Ok(file)
    }
}

#[async_trait]
impl RemoteStore for DriveRemote {
    async fn list_children(
        &self,
        parent_id: &str,
        name: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage> {
        let url = format!("{}/files/{}/children", self.config.api_url, parent_id);
        let mut query = vec![("q", format!("title='{}'", escape_query_value(name)))];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .query(&query)
            .send()
            .await?;
        let list: ChildList = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MirrorError::RemoteRejected(format!("Malformed Drive listing: {}", e)))?;

        // Child references carry only ids; the title matched by the query
        Ok(ChildPage {
            items: list
                .items
                .into_iter()
                .map(|child| RemoteObject {
                    id: child.id,
                    name: name.to_string(),
                    mime_type: String::new(),
                })
                .collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn create_object(&self, request: CreateObject) -> Result<String> {
        let metadata = FileMetadata {
            title: &request.name,
            mime_type: &request.mime_type,
            parents: Some(vec![ParentReference {
                id: &request.parent_id,
            }]),
            description: None,
            modified_date: None,
            version: None,
        };

        match &request.upload {
            None => {
                let response = self
                    .client
                    .post(format!("{}/files", self.config.api_url))
                    .header(reqwest::header::AUTHORIZATION, self.bearer())
                    .json(&metadata)
                    .send()
                    .await?;
                let file: FileResource = Self::check(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| MirrorError::RemoteRejected(format!("Malformed Drive reply: {}", e)))?;
                Ok(file.id)
            }
            Some(upload) => {
                let metadata = metadata.with_version(&upload.metadata);
                let request = self
                    .client
                    .post(format!("{}/files", self.config.upload_url))
                    .query(&[
                        ("uploadType", "multipart"),
                        ("pinned", "true"),
                        ("useContentAsIndexableText", "true"),
                    ]);
                let file = self.send_multipart(request, &metadata, upload).await?;
                Ok(file.id)
            }
        }
    }

    async fn update_object_content(&self, object_id: &str, upload: Upload) -> Result<String> {
        let metadata = FileMetadata {
            title: "",
            mime_type: &upload.mime_type,
            parents: None,
            description: None,
            modified_date: None,
            version: None,
        }
        .with_version(&upload.metadata);
        // An empty title would rename the file; Drive keeps the title when omitted
        let mut value = serde_json::to_value(&metadata)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("title");
        }

        let boundary = format!("treemirror-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(
            &boundary,
            &serde_json::to_vec(&value)?,
            &upload.mime_type,
            &upload.bytes,
        );
        let response = self
            .client
            .put(format!("{}/files/{}", self.config.upload_url, object_id))
            .query(&[
                ("uploadType", "multipart"),
                ("newRevision", "true"),
                ("pinned", "true"),
                ("useContentAsIndexableText", "true"),
            ])
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;
        let file: FileResource = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MirrorError::RemoteRejected(format!("Malformed Drive reply: {}", e)))?;

        file.head_revision_id.ok_or_else(|| {
            MirrorError::RemoteRejected(format!("No headRevisionId for {}", object_id))
        })
    }
}
