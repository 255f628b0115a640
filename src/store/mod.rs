pub mod archives;
pub mod paths;
pub mod temps;

pub use archives::{
    compress_tar_gz, unpack_tar_gz, ArchiveEntry, ArchiveError, ArchiveSpool, PackedArchive,
};
