use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Initializer, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::{Backend, Device};
use burn::record::{FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::Tensor;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::f64::consts::SQRT_2;
use crate::weights;
use crate::weights::{Weights, WeightsMeta};

/// Output channels of the 16 conv layers of configuration E.
const VGG19_CHANNELS: [usize; 16] = [
	64, 64, 128, 128, 256, 256, 256, 256, 512, 512, 512, 512, 512, 512, 512, 512,
];
/// Conv layers per stage; a 2x2 max-pool follows each stage.
const VGG19_BLOCKS: [usize; 5] = [2, 2, 4, 4, 4];
/// Positions of the conv layers inside the torch `features` sequential,
/// which interleaves ReLU and MaxPool entries.
const VGG19_CONV_INDICES: [usize; 16] = [0, 2, 5, 7, 10, 12, 14, 16, 19, 21, 23, 25, 28, 30, 32, 34];

const POOLED_SIDE: usize = 7;

#[derive(Debug, Module)]
pub struct Vgg<B: Backend> {
	pub(crate) convs: Vec<Conv2d<B>>,
	pub(crate) pool: MaxPool2d,
	pub(crate) avgpool: AdaptiveAvgPool2d,
	pub(crate) relu: Relu,
	// Original three-layer classifier, kept so the pretrained state dict
	// loads cleanly. The classifier head replaces it at forward time.
	pub(crate) fc1: Linear<B>,
	pub(crate) fc2: Linear<B>,
	pub(crate) fc3: Linear<B>,
}

impl<B: Backend> Vgg<B> {
	/// [N, 3, 224, 224] -> [N, 25088]
	pub fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
		let mut x = input;
		let mut conv = 0;

		for stage in VGG19_BLOCKS {
			for _ in 0..stage {
				x = self.convs[conv].forward(x);
				x = self.relu.forward(x);
				conv += 1;
			}
			x = self.pool.forward(x);
		}

		let x = self.avgpool.forward(x);

		x.flatten(1, 3)
	}

	pub fn vgg19(num_classes: usize, device: &Device<B>) -> Self {
		VggConfig::vgg19(num_classes).init(device)
	}

	pub fn vgg19_pretrained(weights: weights::Vgg19, device: &Device<B>) -> Result<Self, RecorderError> {
		let weights = weights.weights();
		let record = Self::load_weights_record(&weights, device)?;
		let model = Vgg::<B>::vgg19(weights.num_classes, device).load_record(record);

		Ok(model)
	}

	pub fn load_weights_record(weights: &Weights, device: &Device<B>) -> Result<VggRecord<B>, RecorderError> {
		let torch_weights = weights.download().map_err(|err| {
			RecorderError::Unknown(format!("Could not download weights.\nError: {err}"))
		})?;

		// Load weights from torch state_dict
		let mut load_args = LoadArgs::new(torch_weights)
			.with_key_remap("classifier\\.0\\.(.+)", "fc1.$1")
			.with_key_remap("classifier\\.3\\.(.+)", "fc2.$1")
			.with_key_remap("classifier\\.6\\.(.+)", "fc3.$1");

		for (i, torch_index) in VGG19_CONV_INDICES.iter().enumerate() {
			load_args = load_args.with_key_remap(
				&format!("features\\.{torch_index}\\.(.+)"),
				&format!("convs.{i}.$1"),
			);
		}

		let record = PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)?;

		Ok(record)
	}
}

pub struct VggConfig {
	pub channels: [usize; 16],
	pub num_classes: usize,
}

impl VggConfig {
	pub fn vgg19(num_classes: usize) -> Self {
		Self {
			channels: VGG19_CHANNELS,
			num_classes,
		}
	}

	pub fn init<B: Backend>(self, device: &Device<B>) -> Vgg<B> {
		let initializer = Initializer::KaimingNormal {
			gain: SQRT_2, // recommended value for ReLU
			fan_out_only: true,
		};

		let mut convs = Vec::with_capacity(self.channels.len());
		let mut in_channels = 3;
		for out_channels in self.channels {
			// conv3x3
			let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
				.with_stride([1, 1])
				.with_padding(PaddingConfig2d::Explicit(1, 1))
				.with_initializer(initializer.clone())
				.init(device);
			convs.push(conv);
			in_channels = out_channels;
		}

		let pooled = in_channels * POOLED_SIDE * POOLED_SIDE;

		Vgg {
			convs,
			pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
			avgpool: AdaptiveAvgPool2dConfig::new([POOLED_SIDE, POOLED_SIDE]).init(),
			relu: Relu::new(),
			fc1: LinearConfig::new(pooled, 4096).init(device),
			fc2: LinearConfig::new(4096, 4096).init(device),
			fc3: LinearConfig::new(4096, self.num_classes).init(device),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn vgg19_layer_tables_agree() {
		assert_eq!(VGG19_CONV_INDICES.len(), VGG19_CHANNELS.len());
		assert_eq!(VGG19_BLOCKS.iter().sum::<usize>(), VGG19_CHANNELS.len());
	}

	#[test]
	fn vgg19_conv_indices_skip_pool_positions() {
		// Consecutive convs inside a stage sit two slots apart (conv, relu);
		// a stage boundary adds one more slot for the pool.
		let mut expected = Vec::new();
		let mut index = 0;
		for stage in VGG19_BLOCKS {
			for _ in 0..stage {
				expected.push(index);
				index += 2;
			}
			index += 1;
		}
		assert_eq!(expected, VGG19_CONV_INDICES.to_vec());
	}
}
