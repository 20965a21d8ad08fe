use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::{Backend, Device};
use burn::record::{FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::Tensor;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::f64::consts::SQRT_2;
use crate::weights;
use crate::weights::{Weights, WeightsMeta};

const DENSENET121_BLOCKS: [usize; 4] = [6, 12, 24, 16];
const GROWTH_RATE: usize = 32;
const BN_SIZE: usize = 4;
const INIT_FEATURES: usize = 64;

/// One bottleneck layer of a dense block. Concatenates its input with the
/// `growth_rate` new feature maps it produces.
#[derive(Debug, Module)]
pub struct DenseLayer<B: Backend> {
	pub(crate) norm1: BatchNorm<B, 2>,
	pub(crate) conv1: Conv2d<B>,
	pub(crate) norm2: BatchNorm<B, 2>,
	pub(crate) conv2: Conv2d<B>,
	pub(crate) relu: Relu,
}

impl<B: Backend> DenseLayer<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = self.norm1.forward(input.clone());
		let x = self.relu.forward(x);
		let x = self.conv1.forward(x);

		let x = self.norm2.forward(x);
		let x = self.relu.forward(x);
		let x = self.conv2.forward(x);

		Tensor::cat(vec![input, x], 1)
	}
}

#[derive(Debug, Module)]
pub struct DenseBlock<B: Backend> {
	pub(crate) layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let mut x = input;
		for layer in &self.layers {
			x = layer.forward(x);
		}
		x
	}
}

/// Halves both the channel count and the spatial resolution between blocks.
#[derive(Debug, Module)]
pub struct Transition<B: Backend> {
	pub(crate) norm: BatchNorm<B, 2>,
	pub(crate) conv: Conv2d<B>,
	pub(crate) pool: AvgPool2d,
	pub(crate) relu: Relu,
}

impl<B: Backend> Transition<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = self.norm.forward(input);
		let x = self.relu.forward(x);
		let x = self.conv.forward(x);
		self.pool.forward(x)
	}
}

#[derive(Debug, Module)]
pub struct DenseNet<B: Backend> {
	pub(crate) conv0: Conv2d<B>,
	pub(crate) norm0: BatchNorm<B, 2>,
	pub(crate) pool0: MaxPool2d,
	pub(crate) blocks: Vec<DenseBlock<B>>,
	pub(crate) transitions: Vec<Transition<B>>,
	pub(crate) norm5: BatchNorm<B, 2>,
	pub(crate) avgpool: AdaptiveAvgPool2d,
	pub(crate) relu: Relu,
	// Original 1000-way output, kept so the pretrained state dict loads
	// cleanly. The classifier head replaces it at forward time.
	pub(crate) classifier: Linear<B>,
}

impl<B: Backend> DenseNet<B> {
	/// [N, 3, 224, 224] -> [N, 1024]
	pub fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
		let x = self.conv0.forward(input);
		let x = self.norm0.forward(x);
		let x = self.relu.forward(x);
		let mut x = self.pool0.forward(x);

		for (i, block) in self.blocks.iter().enumerate() {
			x = block.forward(x);
			if let Some(transition) = self.transitions.get(i) {
				x = transition.forward(x);
			}
		}

		let x = self.norm5.forward(x);
		let x = self.relu.forward(x);
		let x = self.avgpool.forward(x);

		x.flatten(1, 3)
	}

	pub fn densenet121(num_classes: usize, device: &Device<B>) -> Self {
		DenseNetConfig::densenet121(num_classes).init(device)
	}

	pub fn densenet121_pretrained(weights: weights::DenseNet121, device: &Device<B>) -> Result<Self, RecorderError> {
		let weights = weights.weights();
		let record = Self::load_weights_record(&weights, device)?;
		let model = DenseNet::<B>::densenet121(weights.num_classes, device).load_record(record);

		Ok(model)
	}

	pub fn load_weights_record(weights: &Weights, device: &Device<B>) -> Result<DenseNetRecord<B>, RecorderError> {
		let torch_weights = weights.download().map_err(|err| {
			RecorderError::Unknown(format!("Could not download weights.\nError: {err}"))
		})?;

		// Load weights from torch state_dict
		let mut load_args = LoadArgs::new(torch_weights)
			.with_key_remap("features\\.conv0\\.(.+)", "conv0.$1")
			.with_key_remap("features\\.norm0\\.(.+)", "norm0.$1")
			.with_key_remap("features\\.norm5\\.(.+)", "norm5.$1");

		// denseblock/denselayer names are 1-based in the state dict
		for (block, count) in DENSENET121_BLOCKS.iter().enumerate() {
			for layer in 0..*count {
				load_args = load_args.with_key_remap(
					&format!("features\\.denseblock{}\\.denselayer{}\\.(.+)", block + 1, layer + 1),
					&format!("blocks.{block}.layers.{layer}.$1"),
				);
			}
			if block + 1 < DENSENET121_BLOCKS.len() {
				load_args = load_args.with_key_remap(
					&format!("features\\.transition{}\\.(.+)", block + 1),
					&format!("transitions.{block}.$1"),
				);
			}
		}

		// The published checkpoint predates the norm1/conv1 renaming
		let load_args = load_args
			.with_key_remap("(.+)\\.norm\\.1\\.(.+)", "$1.norm1.$2")
			.with_key_remap("(.+)\\.conv\\.1\\.(.+)", "$1.conv1.$2")
			.with_key_remap("(.+)\\.norm\\.2\\.(.+)", "$1.norm2.$2")
			.with_key_remap("(.+)\\.conv\\.2\\.(.+)", "$1.conv2.$2");

		let record = PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)?;

		Ok(record)
	}
}

struct DenseLayerConfig {
	norm1: BatchNormConfig,
	conv1: Conv2dConfig,
	norm2: BatchNormConfig,
	conv2: Conv2dConfig,
}

impl DenseLayerConfig {
	fn new(in_channels: usize, growth_rate: usize) -> Self {
		let bottleneck = BN_SIZE * growth_rate;

		let norm1 = BatchNormConfig::new(in_channels);
		// conv1x1
		let conv1 = Conv2dConfig::new([in_channels, bottleneck], [1, 1])
			.with_stride([1, 1])
			.with_padding(PaddingConfig2d::Explicit(0, 0))
			.with_bias(false);

		let norm2 = BatchNormConfig::new(bottleneck);
		// conv3x3
		let conv2 = Conv2dConfig::new([bottleneck, growth_rate], [3, 3])
			.with_stride([1, 1])
			.with_padding(PaddingConfig2d::Explicit(1, 1))
			.with_bias(false);

		Self {
			norm1,
			conv1,
			norm2,
			conv2,
		}
	}

	fn init<B: Backend>(&self, device: &Device<B>) -> DenseLayer<B> {
		let initializer = Initializer::KaimingNormal {
			gain: SQRT_2, // recommended value for ReLU
			fan_out_only: true,
		};

		DenseLayer {
			norm1: self.norm1.init(device),
			conv1: self
				.conv1
				.clone()
				.with_initializer(initializer.clone())
				.init(device),
			norm2: self.norm2.init(device),
			conv2: self
				.conv2
				.clone()
				.with_initializer(initializer)
				.init(device),
			relu: Relu::new(),
		}
	}
}

struct TransitionConfig {
	norm: BatchNormConfig,
	conv: Conv2dConfig,
}

impl TransitionConfig {
	fn new(in_channels: usize, out_channels: usize) -> Self {
		let norm = BatchNormConfig::new(in_channels);
		// conv1x1
		let conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
			.with_stride([1, 1])
			.with_padding(PaddingConfig2d::Explicit(0, 0))
			.with_bias(false);

		Self { norm, conv }
	}

	fn init<B: Backend>(&self, device: &Device<B>) -> Transition<B> {
		let initializer = Initializer::KaimingNormal {
			gain: SQRT_2,
			fan_out_only: true,
		};

		Transition {
			norm: self.norm.init(device),
			conv: self.conv.clone().with_initializer(initializer).init(device),
			pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
			relu: Relu::new(),
		}
	}
}

pub struct DenseNetConfig {
	pub num_blocks: [usize; 4],
	pub growth_rate: usize,
	pub num_init_features: usize,
	pub num_classes: usize,
}

impl DenseNetConfig {
	pub fn densenet121(num_classes: usize) -> Self {
		Self {
			num_blocks: DENSENET121_BLOCKS,
			growth_rate: GROWTH_RATE,
			num_init_features: INIT_FEATURES,
			num_classes,
		}
	}

	/// Channel count coming out of the final dense block.
	pub fn feature_size(&self) -> usize {
		let mut channels = self.num_init_features;
		for (i, num_layers) in self.num_blocks.iter().enumerate() {
			channels += num_layers * self.growth_rate;
			if i + 1 < self.num_blocks.len() {
				channels /= 2;
			}
		}
		channels
	}

	pub fn init<B: Backend>(self, device: &Device<B>) -> DenseNet<B> {
		let initializer = Initializer::KaimingNormal {
			gain: SQRT_2,
			fan_out_only: true,
		};

		// 7x7 conv, 64, /2
		let conv0 = Conv2dConfig::new([3, self.num_init_features], [7, 7])
			.with_stride([2, 2])
			.with_padding(PaddingConfig2d::Explicit(3, 3))
			.with_bias(false)
			.with_initializer(initializer)
			.init(device);
		let norm0 = BatchNormConfig::new(self.num_init_features).init(device);

		// 3x3 maxpool, /2
		let pool0 = MaxPool2dConfig::new([3, 3])
			.with_strides([2, 2])
			.with_padding(PaddingConfig2d::Explicit(1, 1))
			.init();

		let mut blocks = Vec::with_capacity(self.num_blocks.len());
		let mut transitions = Vec::with_capacity(self.num_blocks.len() - 1);
		let mut channels = self.num_init_features;

		for (i, num_layers) in self.num_blocks.iter().enumerate() {
			let layers = (0..*num_layers)
				.map(|l| DenseLayerConfig::new(channels + l * self.growth_rate, self.growth_rate).init(device))
				.collect();
			blocks.push(DenseBlock { layers });
			channels += num_layers * self.growth_rate;

			if i + 1 < self.num_blocks.len() {
				transitions.push(TransitionConfig::new(channels, channels / 2).init(device));
				channels /= 2;
			}
		}

		let norm5 = BatchNormConfig::new(channels).init(device);
		let classifier = LinearConfig::new(channels, self.num_classes).init(device);

		DenseNet {
			conv0,
			norm0,
			pool0,
			blocks,
			transitions,
			norm5,
			avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
			relu: Relu::new(),
			classifier,
		}
	}
}
