use std::collections::HashMap;
use std::fs;
use std::path::Path;
use burn::prelude::Backend;
use burn::tensor::activation::softmax;
use burn::tensor::Tensor;
use crate::checkpoint::{self, CheckpointMeta};
use crate::data;
use crate::error::FlowerClassError;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
	pub probability: f32,
	pub class_code: String,
	pub name: String,
}

pub fn predict<B: Backend>(
	image_path: &Path,
	checkpoint_dir: &Path,
	top_k: usize,
	category_names: &Path,
	device: B::Device,
) -> Result<Vec<Prediction>, FlowerClassError> {
	let meta = CheckpointMeta::load(checkpoint_dir)?;
	let model = checkpoint::load_model::<B>(&meta, checkpoint_dir, &device)?;
	let cat_to_name = load_category_names(category_names)?;

	let input = data::preprocess::<B>(image_path, &device)?;
	let output = model.forward(input);

	let ranked = top_k_probabilities(output, top_k.clamp(1, meta.classes.len()));

	ranked
		.into_iter()
		.map(|(probability, index)| {
			let class_code = meta.classes[index].clone();
			let name = cat_to_name
				.get(&class_code)
				.cloned()
				.ok_or_else(|| FlowerClassError::UnknownCategory(class_code.clone()))?;

			Ok(Prediction {
				probability,
				class_code,
				name,
			})
		})
		.collect()
}

/// Softmax over the class dimension, then the `k` most probable
/// (probability, class index) pairs, most probable first.
pub(crate) fn top_k_probabilities<B: Backend>(logits: Tensor<B, 2>, k: usize) -> Vec<(f32, usize)> {
	let probabilities = softmax(logits, 1);
	let (probabilities, indices) = probabilities.topk_with_indices(k, 1);

	probabilities
		.into_data()
		.iter::<f32>()
		.zip(indices.into_data().iter::<i64>())
		.map(|(probability, index)| (probability, index as usize))
		.collect()
}

pub fn load_category_names(path: &Path) -> Result<HashMap<String, String>, FlowerClassError> {
	Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	type TestBackend = burn::backend::NdArray;

	fn scratch_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir()
			.join("flower-classification-tests")
			.join(format!("{name}-{}", std::process::id()));
		fs::remove_dir_all(&dir).ok();
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[test]
	fn top_k_orders_by_probability() {
		let device = Default::default();
		let logits = Tensor::<TestBackend, 2>::from_floats([[0.1, 3.0, 2.0, 0.5]], &device);

		let ranked = top_k_probabilities(logits, 2);

		assert_eq!(ranked.len(), 2);
		assert_eq!(ranked[0].1, 1);
		assert_eq!(ranked[1].1, 2);
		assert!(ranked[0].0 > ranked[1].0);
		assert!(ranked[0].0 > 0.0 && ranked[0].0 < 1.0);
	}

	#[test]
	fn top_k_over_full_width_sums_to_one() {
		let device = Default::default();
		let logits = Tensor::<TestBackend, 2>::from_floats([[1.0, -1.0, 0.25]], &device);

		let total: f32 = top_k_probabilities(logits, 3)
			.iter()
			.map(|(probability, _)| probability)
			.sum();

		assert!((total - 1.0).abs() < 1e-5);
	}

	#[test]
	fn category_names_load_from_json() {
		let dir = scratch_dir("category-names");
		let path = dir.join("cat_to_name.json");
		fs::write(&path, r#"{"21": "fire lily", "3": "canterbury bells"}"#).unwrap();

		let names = load_category_names(&path).unwrap();
		assert_eq!(names.len(), 2);
		assert_eq!(names["21"], "fire lily");
		assert_eq!(names["3"], "canterbury bells");
	}

	#[test]
	fn malformed_category_file_is_a_json_error() {
		let dir = scratch_dir("bad-category-names");
		let path = dir.join("cat_to_name.json");
		fs::write(&path, "not json").unwrap();

		assert!(matches!(
			load_category_names(&path),
			Err(FlowerClassError::Json(_))
		));
	}
}
