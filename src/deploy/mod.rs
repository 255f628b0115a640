use crate::api::{
    ApiError, Deployment, DeploymentParams, DeploymentsApi, SourcesApi, UploadDestination,
};
use crate::source::{ArtifactSource, SourceError};
use crate::store::{ArchiveEntry, ArchiveError, ArchiveSpool, PackedArchive};
use reqwest::Client;
use thiserror::Error;
use tracing::info;

pub mod upload;

pub use upload::{upload_archive, UploadError};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("fail to resolve artifact")]
    Resolve(#[source] SourceError),

    #[error("fail to create tarball")]
    Package(#[source] ArchiveError),

    #[error("fail to get upload destination")]
    Negotiate(#[source] ApiError),

    #[error("fail to upload archive")]
    Upload(#[source] UploadError),

    #[error("fail to start deployment")]
    Trigger(#[source] ApiError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub follow: bool,
}

#[derive(Clone, Debug)]
pub struct DeployRequest {
    pub app: String,
    pub location: String,
    pub git_ref: Option<String>,
    pub spool: ArchiveSpool,
    pub options: DeployOptions,
}

/// Resolves the artifact at `location` and packs it for `app`.
pub async fn package(
    client: &Client,
    app: &str,
    location: &str,
    spool: ArchiveSpool,
) -> Result<PackedArchive, DeployError> {
    let source = ArtifactSource::parse(location).map_err(DeployError::Resolve)?;
    let resolved = source
        .open(client, app)
        .await
        .map_err(DeployError::Resolve)?;

    let entry = ArchiveEntry::new(app, &resolved.file_name, resolved.size);

    info!("packing archive entry: {}", entry.name);

    spool
        .pack(&entry, resolved.reader)
        .await
        .map_err(DeployError::Package)
}

/// Starts a deployment of `app` from an uploaded archive.
pub async fn trigger<P>(
    platform: &P,
    app: &str,
    destination: &UploadDestination,
    git_ref: Option<&str>,
    options: &DeployOptions,
) -> Result<Deployment, ApiError>
where
    P: DeploymentsApi + ?Sized,
{
    let params = DeploymentParams {
        source_url: destination.download_url.clone(),
        git_ref: git_ref.map(str::to_string),
    };

    let deployment = platform.create_deployment(app, &params).await?;

    if options.follow {
        if let Some(output) = &deployment.links.output {
            info!("deployment output: {}", output);
        }
    }

    Ok(deployment)
}

/// Packs, uploads and deploys a WAR artifact.
///
/// Nothing is sent to the platform when the artifact cannot be packed, and the
/// deployment is only started once the upload has been accepted.
pub async fn deploy_war<P>(
    platform: &P,
    client: &Client,
    request: &DeployRequest,
) -> Result<Deployment, DeployError>
where
    P: SourcesApi + DeploymentsApi,
{
    let archive = package(client, &request.app, &request.location, request.spool).await?;

    let destination = platform
        .create_source()
        .await
        .map_err(DeployError::Negotiate)?;

    upload_archive(client, &destination, &archive)
        .await
        .map_err(DeployError::Upload)?;

    info!("archive uploaded, starting deployment of {}", request.app);

    trigger(
        platform,
        &request.app,
        &destination,
        request.git_ref.as_deref(),
        &request.options,
    )
    .await
    .map_err(DeployError::Trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{mint_access_token, mock_token_exchange, test_client};
    use crate::store::unpack_tar_gz;
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use serde_json::json;
    use std::io::Write;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    const DOWNLOAD_URL: &str = "https://storage.example.com/download/1";

    fn write_war(dir: &Path, len: usize) -> (String, Vec<u8>) {
        let path = dir.join("app.war");
        let data = (0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>();
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        (path.to_string_lossy().into_owned(), data)
    }

    fn request(location: &str) -> DeployRequest {
        DeployRequest {
            app: "myapp".to_string(),
            location: location.to_string(),
            git_ref: Some("v1.0.0".to_string()),
            spool: ArchiveSpool::Memory,
            options: DeployOptions::default(),
        }
    }

    async fn mock_sources(server: &mut ServerGuard, hits: usize) -> Mock {
        let upload_url = format!("{}/upload/1", server.url());

        server
            .mock("POST", "/v1/sources")
            .with_status(201)
            .with_body(
                json!({
                    "source": { "upload_url": upload_url, "download_url": DOWNLOAD_URL }
                })
                .to_string(),
            )
            .expect(hits)
            .create_async()
            .await
    }

    async fn mock_upload(server: &mut ServerGuard, status: usize, hits: usize) -> Mock {
        server
            .mock("PUT", "/upload/1")
            .match_header("content-type", "application/x-gzip")
            .with_status(status)
            .expect(hits)
            .create_async()
            .await
    }

    /// Accepts the upload and records its body when the declared length matches it.
    async fn mock_recorded_upload(
        server: &mut ServerGuard,
        uploaded: Arc<Mutex<Vec<u8>>>,
    ) -> Mock {
        server
            .mock("PUT", "/upload/1")
            .match_header("content-type", "application/x-gzip")
            .match_request(move |request| {
                let Ok(body) = request.body() else {
                    return false;
                };

                let declared = request
                    .header("content-length")
                    .first()
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<usize>().ok());

                if declared != Some(body.len()) {
                    return false;
                }

                *uploaded.lock().unwrap() = body.clone();
                true
            })
            .with_status(200)
            .expect(1)
            .create_async()
            .await
    }

    async fn mock_deployments(server: &mut ServerGuard, hits: usize) -> Mock {
        server
            .mock("POST", "/v1/apps/myapp/deployments")
            .match_body(Matcher::PartialJson(json!({
                "deployment": { "source_url": DOWNLOAD_URL, "git_ref": "v1.0.0" }
            })))
            .with_status(201)
            .with_body(
                json!({
                    "deployment": {
                        "id": "deploy-1",
                        "status": "queued",
                        "links": { "output": "https://dashboard.example.com/deploy-1" }
                    }
                })
                .to_string(),
            )
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn package_local_war() {
        let dir = tempfile::tempdir().unwrap();
        let (location, data) = write_war(dir.path(), 10_000);

        let archive = package(&Client::new(), "myapp", &location, ArchiveSpool::Memory)
            .await
            .unwrap();

        let entries = unpack_tar_gz(&archive.read().await.unwrap()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "myapp/app.war");
        assert_eq!(entries[0].size, data.len() as u64);
        assert_eq!(entries[0].data, data);
    }

    #[tokio::test]
    async fn package_remote_war() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/releases/latest")
            .with_status(200)
            .with_body(b"remote war content")
            .create_async()
            .await;

        let location = format!("{}/releases/latest", server.url());
        let archive = package(&Client::new(), "myapp", &location, ArchiveSpool::Memory)
            .await
            .unwrap();

        let entries = unpack_tar_gz(&archive.read().await.unwrap()).await.unwrap();
        assert_eq!(entries[0].path, "myapp/myapp.war");
        assert_eq!(entries[0].data, b"remote war content");
    }

    #[tokio::test]
    async fn deploy_local_war() {
        let dir = tempfile::tempdir().unwrap();
        let (location, data) = write_war(dir.path(), 4096);

        let mut server = Server::new_async().await;
        let token = mint_access_token(60);
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let exchange = mock_token_exchange(&mut server, &token, 1).await;
        let sources = mock_sources(&mut server, 1).await;
        let upload = mock_recorded_upload(&mut server, uploaded.clone()).await;
        let deployments = mock_deployments(&mut server, 1).await;

        let platform = test_client(&server);
        let mut request = request(&location);
        request.options.follow = true;

        let deployment = deploy_war(&platform, platform.http(), &request)
            .await
            .unwrap();

        assert_eq!(deployment.id, "deploy-1");
        assert_eq!(
            deployment.links.output.as_deref(),
            Some("https://dashboard.example.com/deploy-1")
        );

        exchange.assert_async().await;
        sources.assert_async().await;
        upload.assert_async().await;
        deployments.assert_async().await;

        let body = uploaded.lock().unwrap().clone();
        let entries = unpack_tar_gz(&body).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "myapp/app.war");
        assert_eq!(entries[0].mode, 0o640);
        assert_eq!(entries[0].data, data);
    }

    #[tokio::test]
    async fn unknown_remote_size_stops_before_platform() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/app.war")
            .with_status(200)
            .with_chunked_body(|w| w.write_all(b"war without length"))
            .create_async()
            .await;

        let exchange = mock_token_exchange(&mut server, "unused", 0).await;
        let sources = mock_sources(&mut server, 0).await;
        let upload = mock_upload(&mut server, 200, 0).await;

        let platform = test_client(&server);
        let location = format!("{}/app.war", server.url());

        let err = deploy_war(&platform, platform.http(), &request(&location))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Package(ArchiveError::UnknownSize)
        ));

        exchange.assert_async().await;
        sources.assert_async().await;
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_upload_skips_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let (location, _) = write_war(dir.path(), 1024);

        let mut server = Server::new_async().await;
        let token = mint_access_token(60);
        mock_token_exchange(&mut server, &token, 1).await;
        let sources = mock_sources(&mut server, 1).await;
        let upload = mock_upload(&mut server, 500, 1).await;
        let deployments = mock_deployments(&mut server, 0).await;

        let platform = test_client(&server);

        let err = deploy_war(&platform, platform.http(), &request(&location))
            .await
            .unwrap_err();

        match err {
            DeployError::Upload(UploadError::Status(status)) => {
                assert_eq!(status, "500 Internal Server Error");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        sources.assert_async().await;
        upload.assert_async().await;
        deployments.assert_async().await;
    }

    #[tokio::test]
    async fn failed_negotiation_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (location, _) = write_war(dir.path(), 1024);

        let mut server = Server::new_async().await;
        let token = mint_access_token(60);
        mock_token_exchange(&mut server, &token, 1).await;
        server
            .mock("POST", "/v1/sources")
            .with_status(503)
            .create_async()
            .await;
        let upload = mock_upload(&mut server, 200, 0).await;
        let deployments = mock_deployments(&mut server, 0).await;

        let platform = test_client(&server);

        let err = deploy_war(&platform, platform.http(), &request(&location))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Negotiate(ApiError::Status { .. })
        ));

        upload.assert_async().await;
        deployments.assert_async().await;
    }

    #[tokio::test]
    async fn missing_local_war() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("missing.war");

        let err = package(
            &Client::new(),
            "myapp",
            location.to_str().unwrap(),
            ArchiveSpool::Memory,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Resolve(SourceError::Open { .. })
        ));
    }
}
