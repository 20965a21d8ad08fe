use std::path::PathBuf;
use anyhow::Result;
use burn::backend::Autodiff;
use burn::optim::AdamConfig;
use burn_tch::{LibTorch, LibTorchDevice};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use crate::error::FlowerClassError;
use crate::model::Arch;
use crate::train::TrainingConfig;

mod checkpoint;
mod data;
mod densenet;
mod error;
mod infer;
mod model;
mod train;
mod vgg;
mod weights;

#[derive(Parser, Debug)]
#[command(version, about = "Fine-tune a pretrained CNN on a flower image directory and predict flower names")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Fine-tune a pretrained backbone on a labeled image directory
	Train(TrainArgs),
	/// Predict the most likely classes for a single image
	Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
	/// Data directory with train, valid and test sub-folders
	data_dir: PathBuf,

	/// Pre-trained backbone: vgg19 or densenet121
	#[arg(long, default_value = "vgg19")]
	arch: String,

	/// Use GPU
	#[arg(long)]
	gpu: bool,

	/// Number of epochs to train the classifier head
	#[arg(long, default_value_t = 1)]
	epochs: usize,

	/// Hidden units in the classifier head
	#[arg(long, default_value_t = 1024)]
	hidden_units: usize,

	/// Learning rate
	#[arg(long, default_value_t = 1e-3)]
	learning_rate: f64,

	/// Directory for the saved checkpoint
	#[arg(long, default_value = "checkpoint")]
	save_dir: PathBuf,
}

#[derive(Args, Debug)]
struct PredictArgs {
	/// Path to the image to classify
	image_path: PathBuf,

	/// Checkpoint directory written by `train`
	checkpoint: PathBuf,

	/// Number of classes to report
	#[arg(long, default_value_t = 5)]
	top_k: usize,

	/// JSON file mapping class codes to display names
	#[arg(long, default_value = "cat_to_name.json")]
	category_names: PathBuf,

	/// Use GPU
	#[arg(long)]
	gpu: bool,
}

fn main() -> Result<()> {
	SimpleLogger::new()
		.with_level(LevelFilter::Info)
		.env()
		.init()?;

	let cli = Cli::parse();
	match cli.command {
		Commands::Train(args) => run_train(args),
		Commands::Predict(args) => run_predict(args),
	}
}

fn run_train(args: TrainArgs) -> Result<()> {
	let arch: Arch = args.arch.parse()?;
	let device = device_for(args.gpu)?;

	let config = TrainingConfig::new(AdamConfig::new())
		.with_num_epochs(args.epochs)
		.with_hidden_units(args.hidden_units)
		.with_learning_rate(args.learning_rate);

	train::train::<Autodiff<LibTorch>>(&args.data_dir, arch, config, &args.save_dir, device)?;

	Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
	let device = device_for(args.gpu)?;

	let predictions = infer::predict::<LibTorch>(
		&args.image_path,
		&args.checkpoint,
		args.top_k,
		&args.category_names,
		device,
	)?;

	for prediction in &predictions {
		println!(
			"{} with a probability of {:.4}",
			prediction.name, prediction.probability
		);
	}

	Ok(())
}

fn device_for(gpu: bool) -> Result<LibTorchDevice, FlowerClassError> {
	if gpu {
		if !tch::utils::has_cuda() {
			return Err(FlowerClassError::CudaUnavailable);
		}
		log::info!("using CUDA device 0");
		Ok(LibTorchDevice::Cuda(0))
	} else {
		log::info!("using CPU");
		Ok(LibTorchDevice::Cpu)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn train_defaults_mirror_script_defaults() {
		let cli = Cli::try_parse_from(["flower-classification", "train", "flowers"]).unwrap();
		let Commands::Train(args) = cli.command else {
			panic!("expected train subcommand");
		};

		assert_eq!(args.data_dir, PathBuf::from("flowers"));
		assert_eq!(args.arch, "vgg19");
		assert_eq!(args.epochs, 1);
		assert_eq!(args.hidden_units, 1024);
		assert!((args.learning_rate - 1e-3).abs() < f64::EPSILON);
		assert_eq!(args.save_dir, PathBuf::from("checkpoint"));
		assert!(!args.gpu);
	}

	#[test]
	fn predict_defaults_mirror_script_defaults() {
		let cli = Cli::try_parse_from([
			"flower-classification",
			"predict",
			"flowers/test/1/image.jpg",
			"checkpoint",
		])
		.unwrap();
		let Commands::Predict(args) = cli.command else {
			panic!("expected predict subcommand");
		};

		assert_eq!(args.top_k, 5);
		assert_eq!(args.category_names, PathBuf::from("cat_to_name.json"));
		assert!(!args.gpu);
	}

	#[test]
	fn missing_positional_args_are_rejected() {
		assert!(Cli::try_parse_from(["flower-classification", "train"]).is_err());
		assert!(Cli::try_parse_from(["flower-classification", "predict", "image.jpg"]).is_err());
	}
}
