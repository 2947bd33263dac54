//! 学習用データ拡張
//!
//! 回転・平行移動・ズームを1つのアフィン変換にまとめ、出力画素ごとに
//! 入力座標を逆算してバイリニア補間でサンプリングする。画像外は端の画素で埋める。
//! 左右反転は変換の後に適用する。

use image::{Rgb, RgbImage};
use rand::Rng;

use crate::model::AugmentationSettings;

/// 1枚の画像に適用する変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// 回転角（度）
    pub rotation_deg: f32,
    /// 横方向シフト（ピクセル）
    pub shift_x: f32,
    /// 縦方向シフト（ピクセル）
    pub shift_y: f32,
    /// 横方向ズーム係数
    pub zoom_x: f32,
    /// 縦方向ズーム係数
    pub zoom_y: f32,
    /// 左右反転
    pub flip_horizontal: bool,
}

impl AffineParams {
    /// 何もしない変換
    pub fn identity() -> Self {
        Self {
            rotation_deg: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip_horizontal: false,
        }
    }
}

/// 範囲 [-range, range] から一様にサンプル（range が 0 なら 0）
fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

impl AugmentationSettings {
    /// `width`x`height` の画像用に変換パラメータをランダムに生成
    pub fn sample<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> AffineParams {
        let rotation_deg = symmetric(rng, self.rotation_range);
        let shift_x = symmetric(rng, self.width_shift_range) * width as f32;
        let shift_y = symmetric(rng, self.height_shift_range) * height as f32;
        let (zoom_x, zoom_y) = if self.zoom_range > 0.0 {
            let lo = 1.0 - self.zoom_range;
            let hi = 1.0 + self.zoom_range;
            (rng.gen_range(lo..=hi), rng.gen_range(lo..=hi))
        } else {
            (1.0, 1.0)
        };
        let flip_horizontal = self.horizontal_flip && rng.gen_bool(0.5);

        AffineParams {
            rotation_deg,
            shift_x,
            shift_y,
            zoom_x,
            zoom_y,
            flip_horizontal,
        }
    }

    /// ランダムな変換を生成して適用
    pub fn augment<R: Rng>(&self, rng: &mut R, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let params = self.sample(rng, width, height);
        apply_affine(image, &params)
    }
}

/// 端の画素で埋めるバイリニア補間
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0 = x0 as u32;
    let y0 = y0 as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        out[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// アフィン変換を適用（出力サイズは入力と同じ）
pub fn apply_affine(image: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let cx = (width - 1) as f32 / 2.0;
    let cy = (height - 1) as f32 / 2.0;
    let theta = params.rotation_deg.to_radians();
    let (sin, cos) = theta.sin_cos();

    let mut output = RgbImage::from_fn(width, height, |x, y| {
        // 出力座標 -> 入力座標
        let u = (x as f32 - cx) * params.zoom_x;
        let v = (y as f32 - cy) * params.zoom_y;
        let src_x = cos * u - sin * v + params.shift_x + cx;
        let src_y = sin * u + cos * v + params.shift_y + cy;
        sample_bilinear(image, src_x, src_y)
    });

    if params.flip_horizontal {
        image::imageops::flip_horizontal_in_place(&mut output);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pattern(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 77]))
    }

    #[test]
    fn test_identity_keeps_image() {
        let img = pattern(8, 6);
        assert_eq!(apply_affine(&img, &AffineParams::identity()), img);
    }

    #[test]
    fn test_flip_only() {
        let img = pattern(5, 3);
        let params = AffineParams {
            flip_horizontal: true,
            ..AffineParams::identity()
        };
        let flipped = apply_affine(&img, &params);
        assert_eq!(flipped.get_pixel(0, 1), img.get_pixel(4, 1));
        assert_eq!(flipped.get_pixel(4, 2), img.get_pixel(0, 2));
    }

    #[test]
    fn test_integer_shift_moves_content_and_clamps_edges() {
        let img = pattern(6, 4);
        let params = AffineParams {
            shift_x: 2.0,
            ..AffineParams::identity()
        };
        let shifted = apply_affine(&img, &params);
        assert_eq!(shifted.get_pixel(0, 0), img.get_pixel(2, 0));
        // 右端は端の画素で埋まる
        assert_eq!(shifted.get_pixel(5, 3), img.get_pixel(5, 3));
    }

    #[test]
    fn test_disabled_settings_sample_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = AugmentationSettings::disabled().sample(&mut rng, 224, 224);
        assert_eq!(params, AffineParams::identity());
    }

    #[test]
    fn test_sampled_params_stay_in_range() {
        let settings = AugmentationSettings::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let p = settings.sample(&mut rng, 224, 224);
            assert!(p.rotation_deg.abs() <= 20.0);
            assert!(p.shift_x.abs() <= 0.2 * 224.0 + 1e-3);
            assert!(p.shift_y.abs() <= 0.2 * 224.0 + 1e-3);
            assert!((0.8..=1.2).contains(&p.zoom_x));
            assert!((0.8..=1.2).contains(&p.zoom_y));
        }
    }

    #[test]
    fn test_same_seed_same_augmentation() {
        let settings = AugmentationSettings::default();
        let img = pattern(8, 8);
        let a = settings.augment(&mut StdRng::seed_from_u64(3), &img);
        let b = settings.augment(&mut StdRng::seed_from_u64(3), &img);
        assert_eq!(a, b);
        assert_eq!(a.dimensions(), img.dimensions());
    }
}
