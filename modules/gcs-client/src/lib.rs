//! Thin object store client over `google-cloud-storage`.
//!
//! Credentials resolve through the auth layer (ADC, a service account key file,
//! or key JSON), which mints and refreshes access tokens for the life of the
//! client.

pub mod error;

pub use error::{GcsError, Result};
pub use google_cloud_storage::http::objects::Object;

use std::path::PathBuf;

use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as HttpError;

/// Where the client gets its identity from.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// Application Default Credentials: `GOOGLE_APPLICATION_CREDENTIALS`, the
    /// gcloud user config, or the metadata server.
    #[default]
    Default,
    /// Service account key file.
    File(PathBuf),
    /// Service account key JSON, e.g. from a secrets manager.
    Json(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Default => f.write_str("Default"),
            Credentials::File(path) => f.debug_tuple("File").field(path).finish(),
            Credentials::Json(_) => f.write_str("Json(<redacted>)"),
        }
    }
}

fn auth_error(err: impl std::fmt::Display) -> GcsError {
    GcsError::Auth(err.to_string())
}

pub struct GcsClient {
    client: Client,
    bucket: String,
}

impl GcsClient {
    /// Resolve credentials and build a client for `bucket`.
    pub async fn connect(bucket: &str, credentials: &Credentials) -> Result<Self> {
        let config = match credentials {
            Credentials::Default => ClientConfig::default().with_auth().await.map_err(auth_error)?,
            Credentials::File(path) => {
                let file = CredentialsFile::new_from_file(path.display().to_string())
                    .await
                    .map_err(auth_error)?;
                ClientConfig::default()
                    .with_credentials(file)
                    .await
                    .map_err(auth_error)?
            }
            Credentials::Json(json) => {
                let file: CredentialsFile = serde_json::from_str(json)?;
                ClientConfig::default()
                    .with_credentials(file)
                    .await
                    .map_err(auth_error)?
            }
        };

        tracing::info!(bucket, credentials = ?credentials, "Object store client ready");
        Ok(Self {
            client: Client::new(config),
            bucket: bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `gs://bucket/name` locator for an object in this bucket.
    pub fn locator(&self, name: &str) -> String {
        locator(&self.bucket, name)
    }

    /// Upload `bytes` in a single request, replacing any object with the same name.
    pub async fn upload(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<Object> {
        let size = bytes.len();
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let object = self
            .client
            .upload_object(&request, bytes, &UploadType::Simple(media(name, content_type)))
            .await?;
        tracing::debug!(name, bytes = size, "Uploaded object");
        Ok(object)
    }

    /// List every object whose name starts with `prefix`, following page tokens.
    pub async fn list(&self, prefix: &str) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        let mut page_token = None;

        loop {
            let page = self
                .client
                .list_objects(&list_request(&self.bucket, prefix, page_token))
                .await?;
            objects.extend(page.items.unwrap_or_default());
            match next_page(page.next_page_token) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    /// Delete one object. A missing object counts as already deleted.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.client.delete_object(&delete_request(&self.bucket, name)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn locator(bucket: &str, name: &str) -> String {
    format!("gs://{bucket}/{name}")
}

fn media(name: &str, content_type: &str) -> Media {
    let mut media = Media::new(name.to_string());
    media.content_type = content_type.to_string().into();
    media
}

fn list_request(bucket: &str, prefix: &str, page_token: Option<String>) -> ListObjectsRequest {
    ListObjectsRequest {
        bucket: bucket.to_string(),
        prefix: Some(prefix.to_string()),
        page_token,
        ..Default::default()
    }
}

/// Object names go in unencoded; the HTTP layer escapes `/` and `=` as one
/// path segment.
fn delete_request(bucket: &str, name: &str) -> DeleteObjectRequest {
    DeleteObjectRequest {
        bucket: bucket.to_string(),
        object: name.to_string(),
        ..Default::default()
    }
}

/// An absent or empty token ends the listing.
fn next_page(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}

fn is_not_found(err: &HttpError) -> bool {
    matches!(err, HttpError::Response(resp) if resp.code == 404)
}
