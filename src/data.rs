use std::path::{Path, PathBuf};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, ElementConversion, Int};
use burn::tensor::{Shape, Tensor, TensorData};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use rayon::prelude::*;
use crate::error::FlowerClassError;

pub const SIDE: u32 = 224;
const RESIZE_TO: u32 = 256;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel ImageNet normalization, applied after scaling to [0, 1].
#[derive(Clone)]
pub struct Normalizer<B: Backend> {
	pub mean: Tensor<B, 4>,
	pub std: Tensor<B, 4>,
}

impl<B: Backend> Normalizer<B> {
	pub fn new(device: &B::Device) -> Self {
		let mean = Tensor::<B, 1>::from_floats(MEAN, device).reshape([1, 3, 1, 1]);
		let std = Tensor::<B, 1>::from_floats(STD, device).reshape([1, 3, 1, 1]);
		Self { mean, std }
	}

	pub fn normalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		(input - self.mean.clone()) / self.std.clone()
	}
}

/// One decoded and cropped sample: 224x224 RGB bytes in HWC order.
#[derive(Debug, Clone)]
pub struct FlowerImage {
	pub pixels: Vec<u8>,
	pub label: usize,
}

/// Lazy dataset over one split directory whose sub-folders are class codes.
/// Images are decoded and transformed on access.
pub struct FlowerDataset {
	items: Vec<(PathBuf, usize)>,
	classes: Vec<String>,
	augment: bool,
}

impl FlowerDataset {
	pub fn from_split<P: AsRef<Path>>(dir: P, augment: bool) -> Result<Self, FlowerClassError> {
		let dir = dir.as_ref();

		let mut classes = Vec::new();
		for entry in dir.read_dir()? {
			let entry = entry?;
			if entry.file_type()?.is_dir() {
				classes.push(entry.file_name().to_string_lossy().into_owned());
			}
		}
		// Sorted folder names define the class index order
		classes.sort();

		if classes.is_empty() {
			return Err(FlowerClassError::EmptyDataDir(dir.to_path_buf()));
		}

		let per_class = classes
			.par_iter()
			.enumerate()
			.map(|(label, name)| {
				let mut files = Vec::new();
				for entry in dir.join(name).read_dir()? {
					let path = entry?.path();
					if is_image(&path) {
						files.push((path, label));
					}
				}
				files.sort();
				Ok(files)
			})
			.collect::<Result<Vec<_>, FlowerClassError>>()?;

		let items = per_class.into_iter().flatten().collect();

		Ok(Self {
			items,
			classes,
			augment,
		})
	}

	pub fn classes(&self) -> &[String] {
		&self.classes
	}
}

impl Dataset<FlowerImage> for FlowerDataset {
	fn get(&self, index: usize) -> Option<FlowerImage> {
		let (path, label) = self.items.get(index)?;
		let image = image::open(path)
			.unwrap_or_else(|err| panic!("failed to decode {}: {err}", path.display()));

		let pixels = if self.augment {
			train_pixels(image)
		} else {
			eval_pixels(image)
		};

		Some(FlowerImage {
			pixels,
			label: *label,
		})
	}

	fn len(&self) -> usize {
		self.items.len()
	}
}

fn is_image(path: &Path) -> bool {
	let extension = path
		.extension()
		.and_then(|extension| extension.to_str())
		.map(|extension| extension.to_ascii_lowercase());

	matches!(extension.as_deref(), Some("jpg" | "jpeg" | "png"))
}

fn resize_shortest(image: DynamicImage) -> DynamicImage {
	let (width, height) = image.dimensions();
	let (new_width, new_height) = if width <= height {
		let scaled = (height as u64 * RESIZE_TO as u64 / width as u64).max(RESIZE_TO as u64);
		(RESIZE_TO, scaled as u32)
	} else {
		let scaled = (width as u64 * RESIZE_TO as u64 / height as u64).max(RESIZE_TO as u64);
		(scaled as u32, RESIZE_TO)
	};

	image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

fn center_crop(image: DynamicImage) -> DynamicImage {
	let x = (image.width() - SIDE) / 2;
	let y = (image.height() - SIDE) / 2;
	image.crop_imm(x, y, SIDE, SIDE)
}

/// Resize shortest side to 256, center crop 224.
pub(crate) fn eval_pixels(image: DynamicImage) -> Vec<u8> {
	center_crop(resize_shortest(image)).to_rgb8().into_raw()
}

/// Same as [eval_pixels] plus a coin-flip horizontal mirror.
pub(crate) fn train_pixels(image: DynamicImage) -> Vec<u8> {
	let mut image = resize_shortest(image);
	if rand::thread_rng().gen_bool(0.5) {
		image = image.fliph();
	}
	center_crop(image).to_rgb8().into_raw()
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
	pub images: Tensor<B, 4>,
	pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ClassificationBatcher<B: Backend> {
	normalizer: Normalizer<B>,
	device: B::Device,
}

impl<B: Backend> ClassificationBatcher<B> {
	pub fn new(device: B::Device) -> Self {
		Self {
			normalizer: Normalizer::<B>::new(&device),
			device,
		}
	}
}

impl<B: Backend> Batcher<FlowerImage, ClassificationBatch<B>> for ClassificationBatcher<B> {
	fn batch(&self, items: Vec<FlowerImage>) -> ClassificationBatch<B> {
		let targets = items
			.iter()
			.map(|item| {
				Tensor::<B, 1, Int>::from_data(
					TensorData::from([(item.label as i64).elem::<B::IntElem>()]),
					&self.device,
				)
			})
			.collect();

		let images = items
			.into_iter()
			.map(|item| TensorData::new(item.pixels, Shape::new([SIDE as usize, SIDE as usize, 3])))
			.map(|data| {
				Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device)
					.permute([2, 0, 1]) // [C, H, W]
			})
			.map(|tensor| tensor / 255) // scale to [0, 1]
			.collect();

		let images = Tensor::stack(images, 0);
		let targets = Tensor::cat(targets, 0);

		let images = self.normalizer.normalize(images);

		ClassificationBatch { images, targets }
	}
}

/// Decode and transform a single image for prediction: [1, 3, 224, 224].
pub fn preprocess<B: Backend>(path: &Path, device: &B::Device) -> Result<Tensor<B, 4>, FlowerClassError> {
	let image = image::open(path)?;
	let pixels = eval_pixels(image);

	let data = TensorData::new(pixels, Shape::new([SIDE as usize, SIDE as usize, 3]));
	let tensor = Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device).permute([2, 0, 1]) / 255;

	Ok(Normalizer::new(device).normalize(tensor.unsqueeze::<4>()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::{Rgb, RgbImage};
	use std::fs;

	type TestBackend = burn::backend::NdArray;

	fn scratch_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir()
			.join("flower-classification-tests")
			.join(format!("{name}-{}", std::process::id()));
		fs::remove_dir_all(&dir).ok();
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	fn write_png(dir: &Path, name: &str, color: [u8; 3]) {
		RgbImage::from_pixel(64, 48, Rgb(color)).save(dir.join(name)).unwrap();
	}

	#[test]
	fn classes_follow_sorted_folder_order() {
		let root = scratch_dir("class-order");
		for class in ["2", "10", "30"] {
			let class_dir = root.join(class);
			fs::create_dir_all(&class_dir).unwrap();
			write_png(&class_dir, "a.png", [128, 0, 0]);
		}

		let dataset = FlowerDataset::from_split(&root, false).unwrap();
		// Lexicographic, matching how the checkpoint mapping is built
		assert_eq!(dataset.classes(), ["10", "2", "30"]);
		assert_eq!(dataset.len(), 3);
	}

	#[test]
	fn non_image_files_are_skipped() {
		let root = scratch_dir("skip-non-images");
		let class_dir = root.join("roses");
		fs::create_dir_all(&class_dir).unwrap();
		write_png(&class_dir, "one.png", [0, 128, 0]);
		write_png(&class_dir, "two.jpg", [0, 0, 128]);
		fs::write(class_dir.join("notes.txt"), "not an image").unwrap();

		let dataset = FlowerDataset::from_split(&root, false).unwrap();
		assert_eq!(dataset.len(), 2);
	}

	#[test]
	fn empty_split_is_an_error() {
		let root = scratch_dir("empty-split");
		assert!(matches!(
			FlowerDataset::from_split(&root, false),
			Err(FlowerClassError::EmptyDataDir(_))
		));
	}

	#[test]
	fn items_are_cropped_to_fixed_size() {
		let root = scratch_dir("item-size");
		let class_dir = root.join("tulips");
		fs::create_dir_all(&class_dir).unwrap();
		write_png(&class_dir, "small.png", [200, 10, 10]);

		let dataset = FlowerDataset::from_split(&root, true).unwrap();
		let item = dataset.get(0).unwrap();
		assert_eq!(item.pixels.len(), (SIDE * SIDE * 3) as usize);
		assert_eq!(item.label, 0);
	}

	#[test]
	fn eval_transform_upscales_small_inputs() {
		let pixels = eval_pixels(DynamicImage::ImageRgb8(RgbImage::from_pixel(
			50,
			90,
			Rgb([1, 2, 3]),
		)));
		assert_eq!(pixels.len(), (SIDE * SIDE * 3) as usize);
	}

	#[test]
	fn batches_are_nchw_and_normalized() {
		let device = Default::default();
		let batcher = ClassificationBatcher::<TestBackend>::new(device);

		let item = FlowerImage {
			pixels: vec![0u8; (SIDE * SIDE * 3) as usize],
			label: 3,
		};
		let batch = batcher.batch(vec![item.clone(), item]);

		assert_eq!(batch.images.dims(), [2, 3, SIDE as usize, SIDE as usize]);
		assert_eq!(batch.targets.dims(), [2]);

		// Zero pixels land at (0 - mean) / std
		let first = batch
			.images
			.slice([0..1, 0..1, 0..1, 0..1])
			.into_scalar();
		assert!((first - (-MEAN[0] / STD[0])).abs() < 1e-5);
	}
}
