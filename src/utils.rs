use anyhow::{Context, Result};
use burn::prelude::*;
use gif::{Encoder, Frame, Repeat};
use image::{GenericImage, Rgb, RgbImage};
use std::fs::File;
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 1].
pub fn scale_back(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Convert a BCHW tensor in [-1, 1] to a vector of RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    tensor_to_rgb(tensor, scale_back)
}

/// Convert a `[B, 1, H, W]` attention mask in [0, 1] to grey RGB images.
pub fn mask_to_images<B: Backend>(mask: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [_, channels, _, _] = mask.dims();
    let mask = if channels == 1 { mask.repeat_dim(1, 3) } else { mask };
    tensor_to_rgb(mask, |value| value)
}

fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>, to_unit: impl Fn(f32) -> f32) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .to_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;
    let mut images = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                let channel = |c: usize| (to_unit(values[base + c * hw + idx]).clamp(0.0, 1.0) * 255.0) as u8;
                img.put_pixel(x as u32, y as u32, Rgb([channel(0), channel(1), channel(2)]));
            }
        }
        images.push(img);
    }

    Ok(images)
}

/// Merge images into a fixed grid (rows x cols), filled row-major.
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Lay out `columns[c][r]` so that every row is one sample and every column one image set.
pub fn column_grid(columns: &[Vec<RgbImage>]) -> Result<RgbImage> {
    let rows = columns.first().map(Vec::len).unwrap_or_default();
    if rows == 0 || columns.iter().any(|column| column.len() != rows) {
        return Err(anyhow::anyhow!("grid columns must be non-empty and equally long"));
    }
    let cells: Vec<RgbImage> = (0..rows)
        .flat_map(|row| columns.iter().map(move |column| column[row].clone()))
        .collect();
    merge_images(&cells, rows, columns.len())
}

/// Save an image, creating parent directories as needed.
pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

/// Write frames as a looping animated GIF.
pub fn write_gif(frames: &[RgbImage], gif_path: &Path) -> Result<()> {
    let first = frames
        .first()
        .ok_or_else(|| anyhow::anyhow!("no frames provided for {}", gif_path.display()))?;
    let (width, height) = first.dimensions();
    if let Some(parent) = gif_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = File::create(gif_path)
        .with_context(|| format!("failed to create {}", gif_path.display()))?;
    let mut encoder = Encoder::new(&mut file, width as u16, height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    for img in frames {
        let img = if img.dimensions() == (width, height) {
            img.clone()
        } else {
            image::imageops::resize(img, width, height, image::imageops::FilterType::Nearest)
        };
        let mut frame = Frame::from_rgb(width as u16, height as u16, img.as_raw());
        frame.delay = 50;
        encoder.write_frame(&frame)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn tensor_values_map_to_pixels() {
        let device = Default::default();
        let tensor = Tensor::<NdArray<f32>, 4>::from_floats(
            [[[[-1.0]], [[0.0]], [[1.0]]]],
            &device,
        );
        let images = tensor_to_images(tensor).unwrap();
        assert_eq!(images[0].get_pixel(0, 0).0, [0, 127, 255]);
    }

    #[test]
    fn column_grid_places_samples_in_rows() {
        let red = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(2, 2, Rgb([0, 0, 255]));
        let grid = column_grid(&[vec![red.clone(), red], vec![blue.clone(), blue]]).unwrap();
        assert_eq!(grid.dimensions(), (4, 4));
        assert_eq!(grid.get_pixel(0, 3).0, [255, 0, 0]);
        assert_eq!(grid.get_pixel(3, 0).0, [0, 0, 255]);
    }

    #[test]
    fn gif_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.gif");
        let frames = vec![RgbImage::new(4, 4), RgbImage::from_pixel(4, 4, Rgb([9, 9, 9]))];
        write_gif(&frames, &path).unwrap();
        assert!(path.exists());
    }
}
