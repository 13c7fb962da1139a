//! Error taxonomy shared by every layer of the container.
//!
//! The block-stream layer speaks `std::io` (it implements `Read`/`Write`/
//! `Seek`), everything above it speaks [`MediaError`].  The two conversions
//! below keep a `MediaError` intact when it travels through an `io::Error`,
//! so a `Corrupted` raised deep inside a chain walk still surfaces as
//! `Corrupted` at the container API.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MediaError>;

#[derive(Error, Debug)]
pub enum MediaError {
    /// A structural read failed mid-parse: short read, bad chaining tag,
    /// record body without `=`.
    #[error("The media file is corrupted: {0}")]
    Corrupted(String),

    /// Description or metadata entry too long, or sector indices would
    /// overflow 32 bits.
    #[error("A format limit was exceeded: {0}")]
    LimitExceeded(String),

    #[error("The file is read-only.")]
    ReadOnly,

    /// The underlying write came up short (disk full?).
    #[error("Failed to write data: {0}")]
    WriteFailed(String),

    #[error("Not a Zombie media file.")]
    NotAMediaFile,

    #[error("Unrecognized bitstream type/version: {0:#010x}")]
    UnsupportedBitstream(u32),

    #[error("Invalid sector size: {0}")]
    InvalidSectorSize(String),

    #[error("Sector size cannot be changed once data has been written.")]
    SectorSizeLocked,

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Failed to open file: {0}")]
    OpenFailed(String),

    /// Returned by every operation after a `Corrupted` result.
    #[error("The container was poisoned by an earlier corruption error.")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl MediaError {
    pub fn corrupted(what: impl Into<String>) -> Self {
        MediaError::Corrupted(what.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, MediaError::Corrupted(_))
    }
}

impl From<io::Error> for MediaError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<MediaError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(media) = inner.downcast::<MediaError>() {
                    return *media;
                }
            }
            return MediaError::corrupted("unrecoverable nested error");
        }
        match err.kind() {
            io::ErrorKind::WriteZero => MediaError::WriteFailed(err.to_string()),
            _                        => MediaError::Io(err),
        }
    }
}

impl From<MediaError> for io::Error {
    fn from(err: MediaError) -> Self {
        let kind = match err {
            MediaError::Io(e)               => return e,
            MediaError::Corrupted(_)        => io::ErrorKind::InvalidData,
            MediaError::ReadOnly            => io::ErrorKind::PermissionDenied,
            MediaError::WriteFailed(_)      => io::ErrorKind::WriteZero,
            MediaError::InvalidName(_)
            | MediaError::InvalidSectorSize(_) => io::ErrorKind::InvalidInput,
            _                               => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_error_survives_io_round_trip() {
        let io_err: io::Error = MediaError::corrupted("bad tag").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let back = MediaError::from(io_err);
        assert!(back.is_corruption());
        assert!(back.to_string().contains("bad tag"));
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let err = MediaError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, MediaError::Io(_)));

        let short = MediaError::from(io::Error::new(io::ErrorKind::WriteZero, "disk full"));
        assert!(matches!(short, MediaError::WriteFailed(_)));
    }
}
