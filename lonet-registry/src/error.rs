use lonet_types::VirtnetError;

/// Errors a registry operation can hit before they are annotated into a
/// [`RegistryError`](crate::RegistryError).
#[derive(Debug, thiserror::Error)]
pub enum RegistryInnerError {
    #[error("schema version mismatch: want {want:?}; have {have:?}")]
    SchemaVersionMismatch { want: String, have: String },
    #[error("network name mismatch: want {want:?}; have {have:?}")]
    NetworkNameMismatch { want: String, have: String },
    #[error("registry broken: duplicate {0} entries")]
    Corrupt(&'static str),
    #[error(transparent)]
    HostAlreadyRegistered(VirtnetError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite: pool: get on closed pool")]
    PoolClosed,
}

/// The error raised by registry operations: every public [`crate::Registry`]
/// method wraps its failure with the URI it was called against, the
/// operation name, and the arguments — matching the reference
/// implementation's `RegistryError(err, registry, op, *argv)`.
#[derive(Debug, thiserror::Error)]
#[error("{uri}: {op} {args:?}: {err}")]
pub struct RegistryError {
    pub uri: String,
    pub op: &'static str,
    pub args: Vec<String>,
    #[source]
    pub err: RegistryInnerError,
}

pub(crate) fn wrap<T>(
    uri: &str,
    op: &'static str,
    args: Vec<String>,
    result: Result<T, RegistryInnerError>,
) -> Result<T, RegistryError> {
    result.map_err(|err| RegistryError {
        uri: uri.to_string(),
        op,
        args,
        err,
    })
}

