use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowerClassError {
	#[error("{0} is unsupported by current application")]
	UnsupportedArch(String),
	#[error("no class folders found under {}", .0.display())]
	EmptyDataDir(PathBuf),
	#[error("requested GPU but could not detect a valid CUDA configuration")]
	CudaUnavailable,
	#[error("no display name for class code {0}")]
	UnknownCategory(String),
	#[error("image error: {0}")]
	Image(#[from] image::ImageError),
	#[error("std IO error: {0}")]
	StdIoError(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("record error: {0}")]
	Record(#[from] burn::record::RecorderError),
}
