//! 画像の前処理（学習・検証・推論で共通）
//!
//! RGB変換 -> `size`x`size` へリサイズ -> 各チャネルを 1/255 でスケーリング。
//! 平均・標準偏差による標準化は行わない。出力は (C, H, W) 順で平坦化した `Vec<f32>`。
//!
//! 学習時のデータ拡張は [`resize_rgb`] と [`rgb_to_chw`] の間に挟まるだけで、
//! 他の処理はすべてこのモジュールを経由する。

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use std::path::Path;

/// リサイズに使うフィルタ（学習・推論で必ず同じものを使う）
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// RGBに変換して正方形にリサイズ（アスペクト比は保持しない）
pub fn resize_rgb(image: &DynamicImage, size: usize) -> RgbImage {
    let rgb = image.to_rgb8();
    let size = size as u32;
    if rgb.dimensions() == (size, size) {
        return rgb;
    }
    image::imageops::resize(&rgb, size, size, RESIZE_FILTER)
}

/// RGB画像を [0, 1] の (C, H, W) 配列に変換
pub fn rgb_to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            data[channel * plane + offset] = pixel[channel] as f32 / 255.0;
        }
    }

    data
}

/// デコード済み画像を正規化
pub fn normalize_image(image: &DynamicImage, size: usize) -> Vec<f32> {
    rgb_to_chw(&resize_rgb(image, size))
}

/// メモリ上のエンコード済み画像（アップロードなど）を正規化
pub fn normalize_bytes(bytes: &[u8], size: usize) -> Result<Vec<f32>> {
    let image = image::load_from_memory(bytes).context("画像をデコードできません")?;
    Ok(normalize_image(&image, size))
}

/// 画像ファイルを読み込んで正規化
pub fn normalize_path(path: &Path, size: usize) -> Result<Vec<f32>> {
    let image = open_image(path)?;
    Ok(normalize_image(&image, size))
}

/// 画像ファイルを開く（形式は拡張子ではなく内容から判定、エラーにパスを含める）
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .with_context(|| format!("画像読み込み失敗: {}", path.display()))?
        .decode()
        .with_context(|| format!("画像デコード失敗: {}", path.display()))
}
