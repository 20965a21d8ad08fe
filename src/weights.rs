use std::fs;
use std::io;
use std::path::PathBuf;
use burn::data::network::downloader;

/// A published torch state dict for one backbone.
pub struct Weights {
	pub url: &'static str,
	pub num_classes: usize,
}

impl Weights {
	/// Fetch the state dict into the local cache, once.
	pub fn download(&self) -> Result<PathBuf, io::Error> {
		let cache_dir = dirs::home_dir()
			.ok_or_else(|| {
				io::Error::new(io::ErrorKind::NotFound, "no home directory for the weights cache")
			})?
			.join(".cache")
			.join("flower-classification");
		fs::create_dir_all(&cache_dir)?;

		let file_name = match self.url.rsplit_once('/') {
			Some((_, name)) => name,
			None => "weights.pth",
		};

		let target = cache_dir.join(file_name);
		if !target.exists() {
			log::info!("downloading pretrained weights from {}", self.url);
			let bytes = downloader::download_file_as_bytes(self.url, file_name);
			fs::write(&target, bytes)?;
		}

		Ok(target)
	}
}

pub trait WeightsMeta {
	fn weights(&self) -> Weights;
}

pub enum DenseNet121 {
	/// Top-1 accuracy: 74.434%.
	/// Top-5 accuracy: 91.972%.
	ImageNet1kV1,
}

impl WeightsMeta for DenseNet121 {
	fn weights(&self) -> Weights {
		Weights {
			url: "https://download.pytorch.org/models/densenet121-a639ec97.pth",
			num_classes: 1000,
		}
	}
}

pub enum Vgg19 {
	/// Top-1 accuracy: 72.376%.
	/// Top-5 accuracy: 90.876%.
	ImageNet1kV1,
}

impl WeightsMeta for Vgg19 {
	fn weights(&self) -> Weights {
		Weights {
			url: "https://download.pytorch.org/models/vgg19-dcbb9e9d.pth",
			num_classes: 1000,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn weight_urls_point_at_torch_archives() {
		for weights in [DenseNet121::ImageNet1kV1.weights(), Vgg19::ImageNet1kV1.weights()] {
			assert!(weights.url.ends_with(".pth"));
			assert_eq!(weights.num_classes, 1000);
		}
	}
}
