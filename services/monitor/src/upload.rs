//! Image upload intake: multipart parsing, temporary spooling, and
//! conversion into a stored detection.

use crate::document_store::{DocumentStore, StoreError};
use crate::models::DetectionFields;
use axum::extract::multipart::{Multipart, MultipartError};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Errors raised while accepting an upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No image file provided")]
    MissingImage,

    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Failed to spool upload: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A temporary file holding an uploaded image.
///
/// Removed by [`SpooledFile::remove`], or on drop if that never ran.
#[derive(Debug)]
pub struct SpooledFile {
    path: Option<PathBuf>,
    size: u64,
}

impl SpooledFile {
    async fn create(dir: &Path) -> std::io::Result<(Self, tokio::fs::File)> {
        let path = dir.join(format!("iot-monitor-upload-{}", Uuid::new_v4()));
        let file = tokio::fs::File::create(&path).await?;
        Ok((
            Self {
                path: Some(path),
                size: 0,
            },
            file,
        ))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match &self.path {
            Some(path) => tokio::fs::read(path).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn remove(mut self) -> std::io::Result<()> {
        match self.path.take() {
            Some(path) => tokio::fs::remove_file(path).await,
            None => Ok(()),
        }
    }
}

impl Drop for SpooledFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(error = %e, path = %path.display(), "Failed to remove spooled upload");
            }
        }
    }
}

/// A parsed upload: the spooled image plus the raw form fields
#[derive(Debug)]
pub struct DetectionUpload {
    pub image: SpooledFile,
    pub fields: DetectionFields,
}

/// Read a multipart body, streaming the first `image` field to disk.
///
/// Unknown fields are skipped. Fails with [`UploadError::MissingImage`]
/// when no image part is present.
pub async fn read_upload(
    mut multipart: Multipart,
    upload_dir: &Path,
) -> Result<DetectionUpload, UploadError> {
    let mut image: Option<SpooledFile> = None;
    let mut fields = DetectionFields::default();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "image" if image.is_none() => {
                let (mut spooled, mut file) = SpooledFile::create(upload_dir).await?;
                while let Some(chunk) = field.chunk().await? {
                    file.write_all(&chunk).await?;
                    spooled.size += chunk.len() as u64;
                }
                file.flush().await?;
                image = Some(spooled);
            }
            "location" => fields.location = Some(field.text().await?),
            "latitude" => fields.latitude = Some(field.text().await?),
            "longitude" => fields.longitude = Some(field.text().await?),
            "confidence" => fields.confidence = Some(field.text().await?),
            other => debug!(field = %other, "Ignoring multipart field"),
        }
    }

    let image = image.ok_or(UploadError::MissingImage)?;
    Ok(DetectionUpload { image, fields })
}

/// Encode the spooled image, store the detection, and delete the spool file.
#[instrument(skip(store, upload), fields(size_bytes = upload.image.size()))]
pub async fn store_upload(
    store: &dyn DocumentStore,
    upload: DetectionUpload,
) -> Result<Uuid, UploadError> {
    let DetectionUpload { image, fields } = upload;

    let bytes = image.read().await?;
    let detection = fields.into_new_detection(STANDARD.encode(&bytes));

    let result = store.insert_detection(detection).await;

    if let Err(e) = image.remove().await {
        warn!(error = %e, "Failed to remove spooled upload");
    }

    let id = result?;
    debug!(detection_id = %id, "Upload stored");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::MockDocumentStore;
    use crate::models::NewDetection;

    #[tokio::test]
    async fn test_spooled_file_removed_on_drop() {
        let dir = std::env::temp_dir();
        let (spooled, mut file) = SpooledFile::create(&dir).await.unwrap();
        file.write_all(b"jpeg").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let path = spooled.path().unwrap().to_path_buf();
        assert!(path.exists());

        drop(spooled);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_store_upload_encodes_and_cleans_up() {
        let dir = std::env::temp_dir();
        let (spooled, mut file) = SpooledFile::create(&dir).await.unwrap();
        file.write_all(b"Hello World").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        let path = spooled.path().unwrap().to_path_buf();

        let mut store = MockDocumentStore::new();
        store
            .expect_insert_detection()
            .withf(|d: &NewDetection| {
                d.image == "SGVsbG8gV29ybGQ="
                    && d.location == "MainSt"
                    && d.confidence == 0.92
            })
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));

        let upload = DetectionUpload {
            image: spooled,
            fields: DetectionFields {
                location: Some("MainSt".to_string()),
                latitude: Some("13.75".to_string()),
                longitude: Some("100.50".to_string()),
                confidence: Some("0.92".to_string()),
            },
        };

        store_upload(&store, upload).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_store_failure_still_cleans_up() {
        let dir = std::env::temp_dir();
        let (spooled, file) = SpooledFile::create(&dir).await.unwrap();
        drop(file);
        let path = spooled.path().unwrap().to_path_buf();

        let mut store = MockDocumentStore::new();
        store
            .expect_insert_detection()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("down".to_string())));

        let upload = DetectionUpload {
            image: spooled,
            fields: DetectionFields::default(),
        };

        let err = store_upload(&store, upload).await.unwrap_err();
        assert!(matches!(err, UploadError::Store(StoreError::Unavailable(_))));
        assert!(!path.exists());
    }
}
