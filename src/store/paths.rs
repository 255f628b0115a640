use std::env;
use std::path::PathBuf;
use uuid::Uuid;

pub fn get_temp() -> PathBuf {
    env::temp_dir().join(format!("warship-{}", Uuid::now_v7()))
}

pub fn get_spool_archive() -> PathBuf {
    get_temp().with_extension("tar.gz")
}

pub fn get_archive_entry(app_name: &str, file_name: &str) -> String {
    format!("{}/{}", app_name, file_name)
}
