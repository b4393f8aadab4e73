#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("{source}")]
    Params {
        #[from]
        source: sweep_types::ParamsError,
    },
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },
    #[error("snapshot blob corrupt: {reason}")]
    SnapshotCorrupt { reason: String },
    #[error("transient persistence failure: {msg}")]
    PersistenceTransient { msg: String },
    #[error("fatal persistence failure: {msg}")]
    PersistenceFatal { msg: String },
    #[error("no analysis run is active")]
    NoActiveRun,
    #[error("an analysis run is already active: {run_id}")]
    RunAlreadyActive { run_id: sweep_types::RunId },
}

impl Error {
    pub(crate) fn malformed_frame(reason: impl Into<String>) -> Self {
        Error::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub(crate) fn snapshot_corrupt(reason: impl Into<String>) -> Self {
        Error::SnapshotCorrupt {
            reason: reason.into(),
        }
    }

    /// Transient persistence failures may be retried; fatal ones mark the
    /// run failed.
    pub fn is_fatal_persistence(&self) -> bool {
        matches!(self, Error::PersistenceFatal { .. })
    }
}
