use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeamError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML Parsing Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lattice Error: {0}")]
    Lattice(String),

    #[error("Simulator Error: {0}")]
    Simulator(String),

    #[error("Output Table Error: {0}")]
    TableParse(String),
}

impl BeamError {
    /// Only a completed run whose output could not be read may be skipped.
    /// Everything else aborts the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BeamError::TableParse(_))
    }
}

pub type BfResult<T> = Result<T, BeamError>;
