use crate::error::GanError;
use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

/// One listed image and its binary attribute vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    pub labels: Vec<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMode {
    Train,
    Test,
}

impl DataMode {
    fn listing(self) -> &'static str {
        match self {
            DataMode::Train => "train.txt",
            DataMode::Test => "test.txt",
        }
    }
}

/// A batch of normalized images, their labels and source paths.
#[derive(Clone, Debug)]
pub struct AttributeBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> AttributeBatch<B> {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Attribute-labelled image source read from a plain-text listing.
///
/// The listing starts with a header of attribute names followed by one
/// `relative/path v1 .. vc` line per image, paths relative to the listing.
#[derive(Debug, Clone)]
pub struct AttributeDataset {
    root: PathBuf,
    attributes: Vec<String>,
    samples: Vec<Sample>,
    image_size: u32,
}

impl AttributeDataset {
    pub fn load(data_dir: &Path, mode: DataMode, image_size: usize) -> Result<Self> {
        let path = data_dir.join(mode.listing());
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut lines = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let attributes: Vec<String> = match lines.next() {
            Some((_, header)) => header.split_whitespace().map(str::to_string).collect(),
            None => return Err(GanError::EmptyDataset(path).into()),
        };

        let mut samples = Vec::new();
        for (idx, line) in lines {
            let mut fields = line.split_whitespace();
            let file = fields.next().unwrap_or_default();
            let labels = fields
                .map(|field| {
                    field.parse::<f32>().map_err(|_| GanError::InvalidListing {
                        path: path.clone(),
                        line: idx + 1,
                        reason: format!("label `{field}` is not a number"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if labels.len() != attributes.len() {
                return Err(GanError::InvalidListing {
                    path,
                    line: idx + 1,
                    reason: format!("expected {} labels, found {}", attributes.len(), labels.len()),
                }
                .into());
            }
            samples.push(Sample {
                path: PathBuf::from(file),
                labels: labels.into_iter().map(|v| if v > 0.0 { 1.0 } else { 0.0 }).collect(),
            });
        }
        if samples.is_empty() {
            return Err(GanError::EmptyDataset(path).into());
        }
        tracing::info!("{} -> {} samples, {} attributes", path.display(), samples.len(), attributes.len());

        Ok(Self {
            root: data_dir.to_path_buf(),
            attributes,
            samples,
            image_size: image_size as u32,
        })
    }

    /// Unlabelled source over every image in a directory, for demo rendering.
    pub fn from_image_dir(dir: &Path, c_dim: usize, image_size: usize) -> Result<Self> {
        let mut paths = Vec::new();
        for extension in ["png", "jpg", "jpeg"] {
            paths.extend(
                glob::glob(&format!("{}/*.{extension}", dir.display()))?.filter_map(Result::ok),
            );
        }
        paths.sort();
        if paths.is_empty() {
            return Err(GanError::EmptyDataset(dir.to_path_buf()).into());
        }
        let samples = paths
            .into_iter()
            .filter_map(|path| path.file_name().map(PathBuf::from))
            .map(|path| Sample {
                path,
                labels: vec![0.0; c_dim],
            })
            .collect();
        Ok(Self {
            root: dir.to_path_buf(),
            attributes: (0..c_dim).map(|idx| format!("attr_{idx}")).collect(),
            samples,
            image_size: image_size as u32,
        })
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Batches per epoch; the last one may be short.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.samples.len().div_ceil(batch_size.max(1))
    }

    /// Deterministically reorder the samples from `seed` alone.
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.samples.shuffle(&mut rng);
    }

    pub fn batch<B: Backend>(
        &self,
        index: usize,
        batch_size: usize,
        device: &B::Device,
    ) -> Result<AttributeBatch<B>> {
        let batch_size = batch_size.max(1);
        let start = (index * batch_size).min(self.samples.len());
        let end = (start + batch_size).min(self.samples.len());
        let samples = &self.samples[start..end];
        let size = self.image_size as usize;
        let classes = self.attributes.len();

        let mut pixels = Vec::with_capacity(samples.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(samples.len() * classes);
        let mut paths = Vec::with_capacity(samples.len());
        for sample in samples {
            let path = self.root.join(&sample.path);
            let mut img = image::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?
                .to_rgb8();
            if img.width() != self.image_size || img.height() != self.image_size {
                img = resize_image(&img, self.image_size, self.image_size);
            }
            pixels.append(&mut image_to_chw(&img));
            labels.extend_from_slice(&sample.labels);
            paths.push(path);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [samples.len(), 3, size, size]),
            device,
        );
        let labels = Tensor::<B, 2>::from_data(TensorData::new(labels, [samples.len(), classes]), device);
        Ok(AttributeBatch { images, labels, paths })
    }
}

fn resize_image(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    image::imageops::resize(img, width, height, image::imageops::FilterType::CatmullRom)
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
            out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
            out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    fn write_fixture(dir: &Path, count: usize) {
        let mut listing = String::from("Smile Glasses Beard\n");
        for idx in 0..count {
            let name = format!("img_{idx}.png");
            RgbImage::from_pixel(6, 6, Rgb([idx as u8 * 20, 0, 255]))
                .save(dir.join(&name))
                .unwrap();
            listing.push_str(&format!("{name} {} 0 1\n", idx % 2));
        }
        std::fs::write(dir.join("train.txt"), listing).unwrap();
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), 9);
        let fresh = AttributeDataset::load(dir.path(), DataMode::Train, 4).unwrap();

        let mut a = fresh.clone();
        let mut b = fresh.clone();
        a.shuffle(7);
        b.shuffle(7);
        assert_eq!(a.samples(), b.samples());

        let mut c = fresh;
        c.shuffle(8);
        assert_eq!(c.len(), a.len());
    }

    #[test]
    fn batches_are_resized_and_labelled() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), 5);
        let data = AttributeDataset::load(dir.path(), DataMode::Train, 4).unwrap();
        assert_eq!(data.attributes().len(), 3);
        assert_eq!(data.num_batches(2), 3);

        let device = Default::default();
        let batch = data.batch::<NdArray<f32>>(2, 2, &device).unwrap();
        assert_eq!(batch.images.dims(), [1, 3, 4, 4]);
        assert_eq!(batch.labels.to_data().to_vec::<f32>().unwrap(), vec![0.0, 0.0, 1.0]);
        let pixels = batch.images.to_data().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn malformed_listing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.txt"), "A B\nimg.png 1\n").unwrap();
        let err = AttributeDataset::load(dir.path(), DataMode::Test, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GanError>(),
            Some(GanError::InvalidListing { line: 2, .. })
        ));
    }
}
