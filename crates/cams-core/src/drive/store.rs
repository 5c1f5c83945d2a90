//! Google Drive remote store
//!
//! Drive v3 REST API restricted to the `appDataFolder` space, which is
//! private to this application and invisible in the user's Drive UI.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::sync::{RemoteError, RemoteFileHandle, RemoteStore};

/// Default API host
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";

const APP_DATA_FOLDER: &str = "appDataFolder";

/// Drive adapter for the remote store
pub struct DriveStore {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
}

impl DriveStore {
    /// Create a store talking to the public Drive API
    pub fn new() -> Result<Self, RemoteError> {
        Self::with_base_url(DRIVE_API_BASE)
    }

    /// Create a store talking to another host (used by tests)
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.base_url)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.base_url)
    }
}

/// Drive query literal for a file name
fn name_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!("name = '{}' and trashed = false", escaped)
}

fn network(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

/// Map a non-success response to a remote error
async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
        StatusCode::FORBIDDEN => Err(RemoteError::Forbidden),
        StatusCode::UNAUTHORIZED => Err(RemoteError::Unauthorized),
        _ => {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(200).collect();
            Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Body for a multipart/related upload: JSON metadata, then the content
fn multipart_related(boundary: &str, metadata: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());
    body
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn list_files(
        &self,
        token: &str,
        name: &str,
    ) -> Result<Vec<RemoteFileHandle>, RemoteError> {
        let query = name_query(name);
        let response = self
            .http
            .get(self.files_url())
            .bearer_auth(token)
            .query(&[
                ("spaces", APP_DATA_FOLDER),
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("pageSize", "100"),
            ])
            .send()
            .await
            .map_err(network)?;

        let list: FileList = check(response).await?.json().await.map_err(network)?;
        debug!(count = list.files.len(), "Listed Drive files");
        Ok(list
            .files
            .into_iter()
            .map(|f| RemoteFileHandle {
                id: f.id,
                name: f.name,
            })
            .collect())
    }

    async fn get_content(&self, token: &str, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .http
            .get(format!("{}/{}", self.files_url(), file_id))
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(network)?;

        let bytes = check(response).await?.bytes().await.map_err(network)?;
        Ok(bytes.to_vec())
    }

    async fn create_file(
        &self,
        token: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<String, RemoteError> {
        let boundary = format!("cams-{}", uuid::Uuid::new_v4().simple());
        let metadata = json!({
            "name": name,
            "parents": [APP_DATA_FOLDER],
            "mimeType": "application/json",
        });
        let body = multipart_related(&boundary, &metadata, &content);

        let response = self
            .http
            .post(self.upload_url())
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id,name")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(network)?;

        let created: DriveFile = check(response).await?.json().await.map_err(network)?;
        debug!(file_id = %created.id, "Created Drive file");
        Ok(created.id)
    }

    async fn update_content(
        &self,
        token: &str,
        file_id: &str,
        content: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let response = self
            .http
            .patch(format!("{}/{}", self.upload_url(), file_id))
            .bearer_auth(token)
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(content)
            .send()
            .await
            .map_err(network)?;

        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store(server: &MockServer) -> DriveStore {
        DriveStore::with_base_url(server.uri()).unwrap()
    }

    #[test]
    fn test_name_query_escapes_quotes() {
        assert_eq!(
            name_query("it's.json"),
            "name = 'it\\'s.json' and trashed = false"
        );
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_related("b", &json!({"name": "data.json"}), b"[]");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--b\r\n"));
        assert!(text.contains("{\"name\":\"data.json\"}"));
        assert!(text.contains("\r\n\r\n[]\r\n--b--"));
    }

    #[tokio::test]
    async fn test_list_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(bearer_token("tok"))
            .and(query_param("spaces", "appDataFolder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    {"id": "b", "name": "data.json"},
                    {"id": "a", "name": "data.json"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let files = store(&server).await.list_files("tok", "data.json").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].id, "a");
    }

    #[tokio::test]
    async fn test_list_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let files = store(&server).await.list_files("tok", "data.json").await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_get_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[{\"id\":1}]"))
            .mount(&server)
            .await;

        let content = store(&server).await.get_content("tok", "f1").await.unwrap();
        assert_eq!(content, b"[{\"id\":1}]");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        for (id, status) in [("gone", 404u16), ("locked", 403), ("expired", 401), ("broken", 503)] {
            Mock::given(method("GET"))
                .and(path(format!("/drive/v3/files/{}", id)))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;
        }
        let store = store(&server).await;

        assert_eq!(
            store.get_content("tok", "gone").await.unwrap_err(),
            RemoteError::NotFound
        );
        assert_eq!(
            store.get_content("tok", "locked").await.unwrap_err(),
            RemoteError::Forbidden
        );
        assert_eq!(
            store.get_content("tok", "expired").await.unwrap_err(),
            RemoteError::Unauthorized
        );
        assert_eq!(
            store.get_content("tok", "broken").await.unwrap_err(),
            RemoteError::Status {
                status: 503,
                message: "nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_create_file_in_app_folder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("appDataFolder"))
            .and(body_string_contains("[{\"id\":1}]"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "new-id", "name": "data.json"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = store(&server)
            .await
            .create_file("tok", "data.json", b"[{\"id\":1}]".to_vec())
            .await
            .unwrap();
        assert_eq!(id, "new-id");
    }

    #[tokio::test]
    async fn test_update_content() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/upload/drive/v3/files/f1"))
            .and(query_param("uploadType", "media"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "f1"})))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .await
            .update_content("tok", "f1", b"[]".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_file() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/upload/drive/v3/files/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = store(&server)
            .await
            .update_content("tok", "gone", b"[]".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_stale_handle());
    }
}
