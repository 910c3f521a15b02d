use std::path::PathBuf;

use plotters::drawing::DrawingAreaErrorKind;

/// クレート全体で使用するエラー型。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid sampler domain: {0}")]
    Domain(String),
    #[error("invalid uniform range: {0}")]
    Uniform(#[from] rand::distr::uniform::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recorder error: {0}")]
    Recorder(#[from] burn::record::RecorderError),
    #[error("failed to load config: {0}")]
    Config(String),
    #[error("plotting failed: {0}")]
    Plot(String),
    #[error("model file '{}' not found, run the 'train' command first", .0.display())]
    MissingModel(PathBuf),
    #[error("hyperparameter search failed: {0}")]
    Search(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl<E> From<DrawingAreaErrorKind<E>> for Error
where
    E: std::error::Error + Send + Sync,
{
    fn from(err: DrawingAreaErrorKind<E>) -> Self {
        Error::Plot(err.to_string())
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(err: burn::config::ConfigError) -> Self {
        Error::Config(format!("{err:?}"))
    }
}
