use futures_lite::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid artifact url: {url}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("fail to download artifact")]
    Fetch(#[source] reqwest::Error),

    #[error("fail to download artifact: unexpected status code {0}")]
    FetchStatus(StatusCode),

    #[error("fail to open artifact {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Location of a deployable artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactSource {
    Remote(Url),
    Local(PathBuf),
}

/// An opened artifact, ready to be packed.
pub struct ResolvedSource {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Zero when the source did not report its size.
    pub size: u64,
    pub file_name: String,
}

impl fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSource")
            .field("size", &self.size)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

impl ArtifactSource {
    pub fn parse(location: &str) -> Result<Self, SourceError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let url = Url::parse(location).map_err(|source| SourceError::InvalidUrl {
                url: location.to_string(),
                source,
            })?;

            return Ok(ArtifactSource::Remote(url));
        }

        Ok(ArtifactSource::Local(PathBuf::from(location)))
    }

    pub async fn open(
        self,
        client: &Client,
        app_name: &str,
    ) -> Result<ResolvedSource, SourceError> {
        match self {
            ArtifactSource::Remote(url) => open_remote(client, url, app_name).await,
            ArtifactSource::Local(path) => open_local(&path).await,
        }
    }
}

async fn open_remote(
    client: &Client,
    url: Url,
    app_name: &str,
) -> Result<ResolvedSource, SourceError> {
    info!("downloading artifact: {}", url);

    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(SourceError::Fetch)?;

    if !response.status().is_success() {
        return Err(SourceError::FetchStatus(response.status()));
    }

    let size = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_default();

    debug!("artifact content length: {}", size);

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    Ok(ResolvedSource {
        reader: Box::new(StreamReader::new(Box::pin(stream))),
        size,
        file_name: format!("{}.war", app_name),
    })
}

async fn open_local(path: &Path) -> Result<ResolvedSource, SourceError> {
    info!("reading artifact: {}", path.display());

    let file = File::open(path).await.map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let size = match fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            debug!("fail to stat artifact {}: {}", path.display(), err);
            0
        }
    };

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(ResolvedSource {
        reader: Box::new(file),
        size,
        file_name,
    })
}
