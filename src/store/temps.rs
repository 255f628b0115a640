use crate::store::paths;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{debug, warn};

/// A temporary file that is removed from disk when dropped.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed temp file: {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove temp file {}: {}", self.path.display(), err),
        }
    }
}

pub async fn create_file() -> io::Result<(TempFile, File)> {
    let path = paths::get_spool_archive();
    let file = File::create(&path).await?;
    Ok((TempFile { path }, file))
}
