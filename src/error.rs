use std::fmt::Display;

/// zerokv errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The key is empty.
    EmptyKey,
    /// The key exceeds the configured maximum length.
    KeyTooLarge,
    /// The value exceeds the configured maximum length.
    ValueTooLarge,
    /// The key does not exist.
    KeyNotExist,
    /// The key exists but its deadline has passed. Lazy cleanup has been
    /// performed as part of the failing call.
    KeyExpired,
    /// A non-positive duration was passed to an expire call.
    InvalidTTL,
    /// The entry cannot be encoded (empty key or empty record).
    InvalidEntry,
    /// An empty entry was handed to a segment write.
    EmptyEntry,
    /// The checksum stored with an entry does not match its value bytes.
    InvalidCrc,
    /// A pivot or value contains the reserved extra-field separator.
    ExtraContainsSeparator,
    /// Reclaim was requested below the archived-segment threshold.
    ReclaimUnreached,
    /// The engine has been closed; reopen it.
    DBIsClosed,
    /// No active segment exists for a value type.
    ActiveFileIsNil,
    /// The transaction has already committed or rolled back.
    TxFinished,
    /// A string index record points at missing data. This indicates index
    /// corruption and is fatal.
    NilStrData,
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::EmptyKey => write!(f, "zerokv: the key is empty"),
            Error::KeyTooLarge => write!(f, "zerokv: key exceeded the max length"),
            Error::ValueTooLarge => write!(f, "zerokv: value exceeded the max length"),
            Error::KeyNotExist => write!(f, "zerokv: key not exist"),
            Error::KeyExpired => write!(f, "zerokv: key is expired"),
            Error::InvalidTTL => write!(f, "zerokv: invalid ttl"),
            Error::InvalidEntry => write!(f, "storage/entry: invalid entry"),
            Error::EmptyEntry => write!(f, "storage/segment: entry or the key of entry is empty"),
            Error::InvalidCrc => write!(f, "storage/segment: invalid crc"),
            Error::ExtraContainsSeparator => {
                write!(f, "zerokv: extra contains separator \\0")
            }
            Error::ReclaimUnreached => {
                write!(f, "zerokv: unused space not reach the threshold")
            }
            Error::DBIsClosed => write!(f, "zerokv: db is closed, reopen it"),
            Error::ActiveFileIsNil => write!(f, "zerokv: active file is nil"),
            Error::TxFinished => write!(f, "zerokv: transaction is finished, create a new one"),
            Error::NilStrData => write!(f, "zerokv: string index record is nil"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A zerokv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::EmptyKey.to_string(), "zerokv: the key is empty");
        assert_eq!(Error::InvalidCrc.to_string(), "storage/segment: invalid crc");
        assert_eq!(
            Error::TxFinished.to_string(),
            "zerokv: transaction is finished, create a new one"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::IO(_)));
    }
}
