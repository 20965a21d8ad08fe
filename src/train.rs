use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use burn::train::metric::{AccuracyMetric, CpuUse, CudaMetric, LossMetric};
use burn::train::LearnerBuilder;
use burn::prelude::Backend;
use crate::checkpoint::{self, CheckpointMeta};
use crate::data::{ClassificationBatch, ClassificationBatcher, FlowerDataset};
use crate::error::FlowerClassError;
use crate::model::{Arch, FlowerClassConfig, FlowerClassModel};

#[derive(Config)]
pub struct TrainingConfig {
	pub optimizer: AdamConfig,
	#[config(default = 1)]
	pub num_epochs: usize,
	#[config(default = 64)]
	pub batch_size: usize,
	#[config(default = 4)]
	pub num_workers: usize,
	#[config(default = 42)]
	pub seed: u64,
	#[config(default = 1.0e-3)]
	pub learning_rate: f64,
	#[config(default = 1024)]
	pub hidden_units: usize,
}

fn create_artifact_dir(artifact_dir: &Path) {
	// Remove existing artifacts before to get an accurate learner summary
	std::fs::remove_dir_all(artifact_dir).ok();
	std::fs::create_dir_all(artifact_dir).ok();
}

pub fn train<B: AutodiffBackend>(
	data_dir: &Path,
	arch: Arch,
	config: TrainingConfig,
	save_dir: &Path,
	device: B::Device,
) -> Result<(), FlowerClassError> {
	create_artifact_dir(save_dir);

	config.save(save_dir.join("config.json"))?;

	B::seed(config.seed);

	let train_dataset = FlowerDataset::from_split(data_dir.join("train"), true)?;
	let valid_dataset = FlowerDataset::from_split(data_dir.join("valid"), false)?;
	let test_dataset = FlowerDataset::from_split(data_dir.join("test"), false)?;

	let classes = train_dataset.classes().to_vec();
	log::info!(
		"{} classes, {} train / {} valid / {} test images",
		classes.len(),
		train_dataset.len(),
		valid_dataset.len(),
		test_dataset.len(),
	);

	// Dataloaders
	let batcher_train = ClassificationBatcher::<B>::new(device.clone());
	let batcher_valid = ClassificationBatcher::<B::InnerBackend>::new(device.clone());
	let batcher_test = ClassificationBatcher::<B::InnerBackend>::new(device.clone());

	let dataloader_train = DataLoaderBuilder::new(batcher_train)
		.batch_size(config.batch_size)
		.shuffle(config.seed)
		.num_workers(config.num_workers)
		.build(train_dataset);

	let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
		.batch_size(config.batch_size)
		.num_workers(config.num_workers)
		.build(valid_dataset);

	let dataloader_test = DataLoaderBuilder::new(batcher_test)
		.batch_size(config.batch_size)
		.num_workers(config.num_workers)
		.build(test_dataset);

	log::info!("loading pretrained {} backbone", arch);
	let model = FlowerClassConfig::new(arch, config.hidden_units, classes.len())
		.init_pretrained::<B>(&device)?;

	let artifact_dir = save_dir.to_string_lossy().into_owned();

	// Learner config
	let learner = LearnerBuilder::new(&artifact_dir)
		.metric_train_numeric(AccuracyMetric::new())
		.metric_valid_numeric(AccuracyMetric::new())
		.metric_train_numeric(LossMetric::new())
		.metric_valid_numeric(LossMetric::new())
		.metric_train(CudaMetric::new())
		.metric_train(CpuUse::new())
		.with_file_checkpointer(CompactRecorder::new())
		.devices(vec![device.clone()])
		.num_epochs(config.num_epochs)
		.summary()
		.build(model, config.optimizer.init(), config.learning_rate);

	// Training
	let now = Instant::now();
	let model_trained = learner.fit(dataloader_train, dataloader_valid);
	let elapsed = now.elapsed().as_secs();
	println!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

	let test_accuracy = evaluate(&model_trained.valid(), dataloader_test);
	println!("Test accuracy: {:.3}", test_accuracy);

	let meta = CheckpointMeta {
		arch: arch.to_string(),
		input_size: arch.feature_size(),
		hidden_size: config.hidden_units,
		epochs: config.num_epochs,
		learning_rate: config.learning_rate,
		classes,
	};
	meta.save(save_dir)?;
	checkpoint::save_model(&model_trained, save_dir)?;

	log::info!("checkpoint written to {}", save_dir.display());

	Ok(())
}

fn evaluate<B: Backend>(
	model: &FlowerClassModel<B>,
	loader: Arc<dyn DataLoader<ClassificationBatch<B>>>,
) -> f64 {
	let mut correct = 0i64;
	let mut total = 0usize;

	for batch in loader.iter() {
		total += batch.targets.dims()[0];
		let predicted = model.forward(batch.images).argmax(1).flatten::<1>(0, 1);
		correct += predicted.equal(batch.targets).int().sum().into_scalar().elem::<i64>();
	}

	if total == 0 {
		return 0.0;
	}

	correct as f64 / total as f64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn training_defaults_match_cli_defaults() {
		let config = TrainingConfig::new(AdamConfig::new());
		assert_eq!(config.num_epochs, 1);
		assert_eq!(config.batch_size, 64);
		assert_eq!(config.hidden_units, 1024);
		assert!((config.learning_rate - 1.0e-3).abs() < f64::EPSILON);
	}

	#[test]
	fn training_config_builder_overrides() {
		let config = TrainingConfig::new(AdamConfig::new())
			.with_num_epochs(5)
			.with_hidden_units(512)
			.with_learning_rate(3.0e-4);
		assert_eq!(config.num_epochs, 5);
		assert_eq!(config.hidden_units, 512);
		assert!((config.learning_rate - 3.0e-4).abs() < f64::EPSILON);
	}
}
