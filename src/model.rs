use std::fmt;
use std::str::FromStr;
use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu};
use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::backend::AutodiffBackend;
use burn::train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep};
use crate::data::ClassificationBatch;
use crate::densenet::DenseNet;
use crate::error::FlowerClassError;
use crate::vgg::Vgg;
use crate::weights::{self, WeightsMeta};

pub const DROPOUT: f64 = 0.3;

/// The two supported pretrained backbones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
	DenseNet121,
	Vgg19,
}

impl Arch {
	/// Width of the feature vector the backbone hands to the classifier head.
	pub fn feature_size(&self) -> usize {
		match self {
			Arch::DenseNet121 => 1024,
			Arch::Vgg19 => 512 * 7 * 7,
		}
	}
}

impl fmt::Display for Arch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Arch::DenseNet121 => write!(f, "densenet121"),
			Arch::Vgg19 => write!(f, "vgg19"),
		}
	}
}

impl FromStr for Arch {
	type Err = FlowerClassError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"densenet121" => Ok(Arch::DenseNet121),
			"vgg19" => Ok(Arch::Vgg19),
			other => Err(FlowerClassError::UnsupportedArch(other.to_string())),
		}
	}
}

#[derive(Debug, Module)]
pub enum Backbone<B: Backend> {
	DenseNet121(DenseNet<B>),
	Vgg19(Vgg<B>),
}

impl<B: Backend> Backbone<B> {
	pub fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
		match self {
			Backbone::DenseNet121(densenet) => densenet.forward_features(images),
			Backbone::Vgg19(vgg) => vgg.forward_features(images),
		}
	}
}

/// The trainable part: fc1 -> relu -> dropout -> fc2, emitting logits.
#[derive(Debug, Module)]
pub struct ClassifierHead<B: Backend> {
	pub(crate) fc1: Linear<B>,
	pub(crate) fc2: Linear<B>,
	pub(crate) dropout: Dropout,
	pub(crate) activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
	pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
		let x = self.fc1.forward(features);
		let x = self.activation.forward(x);
		let x = self.dropout.forward(x);

		self.fc2.forward(x)
	}
}

#[derive(Debug, Module)]
pub struct FlowerClassModel<B: Backend> {
	pub(crate) backbone: Backbone<B>,
	pub(crate) head: ClassifierHead<B>,
}

impl<B: Backend> FlowerClassModel<B> {
	pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
		let features = self.backbone.forward_features(images);
		self.head.forward(features)
	}

	pub fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
		let output = self.forward(images);

		let loss = CrossEntropyLossConfig::new().init(&output.device())
			.forward(output.clone(), targets.clone());

		ClassificationOutput::new(loss, output, targets)
	}
}

impl<B: AutodiffBackend> TrainStep<ClassificationBatch<B>, ClassificationOutput<B>> for FlowerClassModel<B> {
	fn step(&self, batch: ClassificationBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
		let item = self.forward_classification(batch.images, batch.targets);

		TrainOutput::new(self, item.loss.backward(), item)
	}
}

impl<B: Backend> ValidStep<ClassificationBatch<B>, ClassificationOutput<B>> for FlowerClassModel<B> {
	fn step(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
		self.forward_classification(batch.images, batch.targets)
	}
}

pub struct FlowerClassConfig {
	pub arch: Arch,
	pub hidden_size: usize,
	pub num_classes: usize,
	pub dropout: f64,
}

impl FlowerClassConfig {
	pub fn new(arch: Arch, hidden_size: usize, num_classes: usize) -> Self {
		Self {
			arch,
			hidden_size,
			num_classes,
			dropout: DROPOUT,
		}
	}

	/// Randomly initialized skeleton, used when loading a saved record.
	pub fn init<B: Backend>(&self, device: &B::Device) -> FlowerClassModel<B> {
		let backbone = match self.arch {
			Arch::DenseNet121 => Backbone::DenseNet121(DenseNet::densenet121(
				weights::DenseNet121::ImageNet1kV1.weights().num_classes,
				device,
			)),
			Arch::Vgg19 => Backbone::Vgg19(Vgg::vgg19(
				weights::Vgg19::ImageNet1kV1.weights().num_classes,
				device,
			)),
		};

		self.assemble(backbone, device)
	}

	/// Downloads the pretrained backbone weights and freezes the backbone;
	/// only the head stays trainable.
	pub fn init_pretrained<B: Backend>(&self, device: &B::Device) -> Result<FlowerClassModel<B>, FlowerClassError> {
		let backbone = match self.arch {
			Arch::DenseNet121 => Backbone::DenseNet121(DenseNet::densenet121_pretrained(
				weights::DenseNet121::ImageNet1kV1,
				device,
			)?),
			Arch::Vgg19 => Backbone::Vgg19(Vgg::vgg19_pretrained(
				weights::Vgg19::ImageNet1kV1,
				device,
			)?),
		};

		Ok(self.assemble(backbone.no_grad(), device))
	}

	fn assemble<B: Backend>(&self, backbone: Backbone<B>, device: &B::Device) -> FlowerClassModel<B> {
		let head = ClassifierHead {
			fc1: LinearConfig::new(self.arch.feature_size(), self.hidden_size).init(device),
			fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
			dropout: DropoutConfig::new(self.dropout).init(),
			activation: Relu::new(),
		};

		FlowerClassModel { backbone, head }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	type TestBackend = burn::backend::NdArray;

	#[test]
	fn arch_parses_supported_names() {
		assert_eq!("densenet121".parse::<Arch>().unwrap(), Arch::DenseNet121);
		assert_eq!("vgg19".parse::<Arch>().unwrap(), Arch::Vgg19);
	}

	#[test]
	fn arch_rejects_unknown_names() {
		let err = "vgg16".parse::<Arch>().unwrap_err();
		assert_eq!(err.to_string(), "vgg16 is unsupported by current application");
	}

	#[test]
	fn arch_display_round_trips() {
		for arch in [Arch::DenseNet121, Arch::Vgg19] {
			assert_eq!(arch.to_string().parse::<Arch>().unwrap(), arch);
		}
	}

	#[test]
	fn feature_sizes() {
		assert_eq!(Arch::DenseNet121.feature_size(), 1024);
		assert_eq!(Arch::Vgg19.feature_size(), 25088);
	}

	#[test]
	fn head_maps_features_to_class_logits() {
		let device = Default::default();
		let head = ClassifierHead::<TestBackend> {
			fc1: LinearConfig::new(16, 8).init(&device),
			fc2: LinearConfig::new(8, 5).init(&device),
			dropout: DropoutConfig::new(DROPOUT).init(),
			activation: Relu::new(),
		};

		let features = Tensor::zeros([2, 16], &device);
		assert_eq!(head.forward(features).dims(), [2, 5]);
	}
}
