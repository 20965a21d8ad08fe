use std::fs;
use std::path::Path;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{CompactRecorder, Recorder};
use serde::{Deserialize, Serialize};
use crate::error::FlowerClassError;
use crate::model::{Arch, FlowerClassConfig, FlowerClassModel};

pub const META_FILE: &str = "checkpoint.json";
pub const MODEL_FILE: &str = "model";

/// Everything needed to rebuild the trained model, next to the weight
/// record itself: which backbone, the head shape, and the class index
/// to class code mapping derived from the training folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
	pub arch: String,
	pub input_size: usize,
	pub hidden_size: usize,
	pub epochs: usize,
	pub learning_rate: f64,
	pub classes: Vec<String>,
}

impl CheckpointMeta {
	pub fn arch(&self) -> Result<Arch, FlowerClassError> {
		self.arch.parse()
	}

	pub fn save(&self, dir: &Path) -> Result<(), FlowerClassError> {
		fs::write(dir.join(META_FILE), serde_json::to_string_pretty(self)?)?;
		Ok(())
	}

	pub fn load(dir: &Path) -> Result<Self, FlowerClassError> {
		Ok(serde_json::from_str(&fs::read_to_string(dir.join(META_FILE))?)?)
	}
}

pub fn save_model<B: Backend>(model: &FlowerClassModel<B>, dir: &Path) -> Result<(), FlowerClassError> {
	model
		.clone()
		.save_file(dir.join(MODEL_FILE), &CompactRecorder::new())?;
	Ok(())
}

/// Rebuild the model skeleton described by `meta` and load the saved
/// record into it. No network access: the record already holds every
/// tensor, frozen backbone included.
pub fn load_model<B: Backend>(
	meta: &CheckpointMeta,
	dir: &Path,
	device: &B::Device,
) -> Result<FlowerClassModel<B>, FlowerClassError> {
	let record = CompactRecorder::new().load(dir.join(MODEL_FILE), device)?;

	let config = FlowerClassConfig::new(meta.arch()?, meta.hidden_size, meta.classes.len());
	Ok(config.init(device).load_record(record))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn scratch_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir()
			.join("flower-classification-tests")
			.join(format!("{name}-{}", std::process::id()));
		fs::remove_dir_all(&dir).ok();
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	fn sample_meta() -> CheckpointMeta {
		CheckpointMeta {
			arch: "densenet121".to_string(),
			input_size: 1024,
			hidden_size: 512,
			epochs: 3,
			learning_rate: 1e-3,
			classes: vec!["1".to_string(), "10".to_string(), "2".to_string()],
		}
	}

	#[test]
	fn meta_round_trips_through_json() {
		let dir = scratch_dir("meta-round-trip");
		let meta = sample_meta();
		meta.save(&dir).unwrap();

		let loaded = CheckpointMeta::load(&dir).unwrap();
		assert_eq!(loaded.arch, meta.arch);
		assert_eq!(loaded.input_size, meta.input_size);
		assert_eq!(loaded.hidden_size, meta.hidden_size);
		assert_eq!(loaded.epochs, meta.epochs);
		assert_eq!(loaded.classes, meta.classes);
	}

	#[test]
	fn meta_resolves_supported_arch() {
		assert_eq!(sample_meta().arch().unwrap(), Arch::DenseNet121);
	}

	#[test]
	fn meta_rejects_unknown_arch() {
		let mut meta = sample_meta();
		meta.arch = "resnet50".to_string();
		assert!(matches!(
			meta.arch(),
			Err(FlowerClassError::UnsupportedArch(_))
		));
	}

	#[test]
	fn missing_checkpoint_is_an_io_error() {
		let dir = scratch_dir("missing-meta");
		assert!(matches!(
			CheckpointMeta::load(&dir.join("nowhere")),
			Err(FlowerClassError::StdIoError(_))
		));
	}
}
