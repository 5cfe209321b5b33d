use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovmergeError {
    /// No parser in any candidate family was willing to claim the upload.
    #[error("no parser recognized the uploaded report")]
    UnusableReport,

    /// A parser claimed the document but recovered zero files from it.
    #[error("{parser} parser found no usable coverage data")]
    MalformedReport { parser: &'static str },

    /// A fold was attempted against a report already marked read-only.
    #[error("report is finalized and read-only")]
    ReportFinalized,

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, CovmergeError>;
