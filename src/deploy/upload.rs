use crate::api::UploadDestination;
use crate::store::PackedArchive;
use hyper::ext::ReasonPhrase;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::io;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("fail to read archive")]
    Read(#[source] io::Error),

    #[error("fail to upload archive")]
    Write(#[source] reqwest::Error),

    #[error("wrong status code after upload {0}")]
    Status(String),
}

/// Writes the archive to the destination upload address with its exact length.
pub async fn upload_archive(
    client: &Client,
    destination: &UploadDestination,
    archive: &PackedArchive,
) -> Result<(), UploadError> {
    info!("uploading archive: {} bytes", archive.size());

    let body = archive.body().await.map_err(UploadError::Read)?;

    let response = client
        .put(&destination.upload_url)
        .header(CONTENT_TYPE, "application/x-gzip")
        .header(CONTENT_LENGTH, archive.size())
        .body(body)
        .send()
        .await
        .map_err(UploadError::Write)?;

    let status = response.status();

    if status != StatusCode::OK {
        return Err(UploadError::Status(status_line(&response)));
    }

    debug!("upload response -> {}", status);

    Ok(())
}

/// Status code and reason phrase as sent by the server, e.g. `520 Storage Backend Down`.
fn status_line(response: &Response) -> String {
    let status = response.status();

    let reason = match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => Some(String::from_utf8_lossy(reason.as_bytes()).into_owned()),
        None => status.canonical_reason().map(str::to_string),
    };

    match reason {
        Some(reason) => format!("{} {}", status.as_str(), reason),
        None => status.as_str().to_string(),
    }
}
