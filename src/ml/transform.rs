//! 画像変換（データ拡張と推論用前処理）
//!
//! - `AugmentationPipeline`: 学習時にサンプルを読むたびに適用するランダム変換。
//!   乱数源は呼び出し側から注入するため、同じシードなら同じ結果になります。
//! - `EvalTransform`: 検証データと推論入力に適用する決定的な変換（リサイズ＋中央切り出し）。
//!
//! どちらも最後に `normalize_chw` でImageNetの平均・標準偏差による正規化を行います。

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;

use crate::error::{ClassifierError, Result};
use crate::model::AugmentationSettings;

/// ImageNetの平均（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 推論時のリサイズ倍率（短辺を image_size * 1.15 にしてから中央を切り出す）
const EVAL_RESIZE_FACTOR: f32 = 1.15;

/// バイト列を画像としてデコードする
pub fn decode_image_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(ClassifierError::InvalidImage("empty input".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| ClassifierError::InvalidImage(e.to_string()))
}

/// ファイルを画像としてデコードする（拡張子ではなく内容から形式を判定）
pub fn decode_image_path(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path)
        .map_err(|e| ClassifierError::InvalidImage(format!("{}: {}", path.display(), e)))?;
    decode_image_bytes(&bytes).map_err(|e| match e {
        ClassifierError::InvalidImage(msg) => ClassifierError::InvalidImage(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// RGB画像をImageNet統計で正規化し、(C, H, W) の順で平坦化する
pub fn normalize_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let num_pixels = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in img.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * num_pixels + i] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    data
}

/// 短辺を `short_side` に合わせてアスペクト比を保ったままリサイズする
fn resize_shorter_side(img: &RgbImage, short_side: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let (new_w, new_h) = if w <= h {
        let scaled = (h as f32 * short_side as f32 / w as f32).round() as u32;
        (short_side, scaled.max(short_side))
    } else {
        let scaled = (w as f32 * short_side as f32 / h as f32).round() as u32;
        (scaled.max(short_side), short_side)
    };
    imageops::resize(img, new_w, new_h, FilterType::Triangle)
}

fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let x = (w.saturating_sub(size)) / 2;
    let y = (h.saturating_sub(size)) / 2;
    imageops::crop_imm(img, x, y, size.min(w), size.min(h)).to_image()
}

/// 検証・推論用の決定的な変換
#[derive(Debug, Clone)]
pub struct EvalTransform {
    image_size: u32,
}

impl EvalTransform {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn apply(&self, img: &DynamicImage) -> RgbImage {
        let short_side = ((self.image_size as f32 * EVAL_RESIZE_FACTOR).round() as u32).max(self.image_size);
        let resized = resize_shorter_side(&img.to_rgb8(), short_side);
        center_crop(&resized, self.image_size)
    }

    /// 変換後に正規化まで行う
    pub fn apply_normalized(&self, img: &DynamicImage) -> Vec<f32> {
        normalize_chw(&self.apply(img))
    }
}

/// 学習時のランダムデータ拡張
///
/// 適用順序:
/// 1. 左右反転
/// 2. 回転（±max_rotation_degrees、範囲外は黒で埋める）
/// 3. ランダムクロップ＋リサイズ（面積比・アスペクト比をランダムに選ぶ）
/// 4. カラージッター（明るさ、コントラスト、彩度、色相）
/// 5. 射影変換（四隅をランダムに内側へずらす、範囲外は黒で埋める）
/// 6. ガウシアンぼかし（3x3 カーネル）
///
/// 状態を持たないため、同じ画像に対しても呼び出しごと（エポックごと）に異なる結果になります。
#[derive(Debug, Clone)]
pub struct AugmentationPipeline {
    settings: AugmentationSettings,
    image_size: u32,
}

impl AugmentationPipeline {
    pub fn new(settings: AugmentationSettings, image_size: u32) -> Self {
        Self { settings, image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: &DynamicImage, rng: &mut R) -> RgbImage {
        let s = &self.settings;
        let mut rgb = img.to_rgb8();

        if rng.gen_bool(s.flip_probability) {
            rgb = imageops::flip_horizontal(&rgb);
        }

        if s.max_rotation_degrees > 0.0 {
            let angle = rng.gen_range(-s.max_rotation_degrees..=s.max_rotation_degrees);
            rgb = rotate_bilinear(&rgb, angle);
        }

        rgb = self.random_resized_crop(&rgb, rng);

        let brightness = jitter_factor(s.brightness, rng);
        let contrast = jitter_factor(s.contrast, rng);
        let saturation = jitter_factor(s.saturation, rng);
        let hue_shift = if s.hue > 0.0 { rng.gen_range(-s.hue..=s.hue) } else { 0.0 };
        adjust_brightness(&mut rgb, brightness);
        adjust_contrast(&mut rgb, contrast);
        adjust_saturation(&mut rgb, saturation);
        adjust_hue(&mut rgb, hue_shift);

        if rng.gen_bool(s.perspective_probability) {
            let corners = random_perspective_corners(rgb.dimensions(), s.distortion_scale, rng);
            rgb = perspective_warp(&rgb, &corners);
        }

        if rng.gen_bool(s.blur_probability) {
            let (lo, hi) = s.blur_sigma;
            let sigma = sample_range(rng, lo, hi);
            if sigma > 0.0 {
                rgb = gaussian_blur_3x3(&rgb, sigma);
            }
        }

        rgb
    }

    /// 拡張後に正規化まで行う
    pub fn apply_normalized<R: Rng + ?Sized>(&self, img: &DynamicImage, rng: &mut R) -> Vec<f32> {
        normalize_chw(&self.apply(img, rng))
    }

    fn random_resized_crop<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let (w, h) = img.dimensions();
        let area = (w * h) as f32;
        let (scale_lo, scale_hi) = self.settings.crop_scale;
        let (ratio_lo, ratio_hi) = self.settings.crop_ratio;
        let (log_lo, log_hi) = (ratio_lo.ln(), ratio_hi.ln());

        // 10回試して収まらなければ画像全体を中央から切り出す
        for _ in 0..10 {
            let target_area = area * sample_range(rng, scale_lo, scale_hi);
            let aspect = sample_range(rng, log_lo, log_hi).exp();
            let cw = (target_area * aspect).sqrt().round() as u32;
            let ch = (target_area / aspect).sqrt().round() as u32;
            if cw > 0 && ch > 0 && cw <= w && ch <= h {
                let x = rng.gen_range(0..=w - cw);
                let y = rng.gen_range(0..=h - ch);
                let cropped = imageops::crop_imm(img, x, y, cw, ch).to_image();
                return imageops::resize(&cropped, self.image_size, self.image_size, FilterType::Triangle);
            }
        }

        let side = w.min(h);
        let cropped = center_crop(img, side);
        imageops::resize(&cropped, self.image_size, self.image_size, FilterType::Triangle)
    }
}

fn sample_range<R: Rng + ?Sized>(rng: &mut R, lo: f32, hi: f32) -> f32 {
    if hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

/// 1±amount の範囲から係数を選ぶ（amount が0なら1）
fn jitter_factor<R: Rng + ?Sized>(amount: f32, rng: &mut R) -> f32 {
    if amount <= 0.0 {
        return 1.0;
    }
    sample_range(rng, (1.0 - amount).max(0.0), 1.0 + amount)
}

/// 画像中心を軸に回転する（バイリニア補間）
pub(crate) fn rotate_bilinear(img: &RgbImage, degrees: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;

    RgbImage::from_fn(w, h, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        // 出力座標を逆回転して入力座標を求める
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;
        sample_bilinear(img, sx, sy)
    })
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// 四隅の移動先をランダムに選ぶ（左上, 右上, 右下, 左下の順）
///
/// 各隅は辺の長さの半分 * distortion の範囲で画像の内側へずれます。
fn random_perspective_corners<R: Rng + ?Sized>(
    (w, h): (u32, u32),
    distortion: f32,
    rng: &mut R,
) -> [(f32, f32); 4] {
    let dx = (distortion * (w / 2) as f32) as u32;
    let dy = (distortion * (h / 2) as f32) as u32;
    let (right, bottom) = (w.saturating_sub(1), h.saturating_sub(1));

    let mut offset = |max: u32| rng.gen_range(0..=max);
    let top_left = (offset(dx), offset(dy));
    let top_right = (right - offset(dx).min(right), offset(dy));
    let bottom_right = (right - offset(dx).min(right), bottom - offset(dy).min(bottom));
    let bottom_left = (offset(dx), bottom - offset(dy).min(bottom));

    [top_left, top_right, bottom_right, bottom_left].map(|(x, y)| (x as f32, y as f32))
}

/// 4点対応から射影変換の係数を求める（`from` の点を `to` の点へ写す）
///
/// 変換は `u = (a x + b y + c) / (g x + h y + 1)`, `v = (d x + e y + f) / (g x + h y + 1)`。
/// 点が退化していて解けない場合は None を返します。
fn solve_homography(from: &[(f32, f32); 4], to: &[(f32, f32); 4]) -> Option<[f64; 8]> {
    let mut m = [[0.0f64; 9]; 8];
    for (i, (&(x, y), &(u, v))) in from.iter().zip(to.iter()).enumerate() {
        let (x, y, u, v) = (x as f64, y as f64, u as f64, v as f64);
        m[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
        m[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
    }

    // 部分ピボット付きガウスの消去法
    for col in 0..8 {
        let pivot = (col..8).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-9 {
            return None;
        }
        m.swap(col, pivot);
        for row in 0..8 {
            if row != col {
                let factor = m[row][col] / m[col][col];
                for k in col..9 {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }
    }

    let mut coeffs = [0.0f64; 8];
    for (i, c) in coeffs.iter_mut().enumerate() {
        *c = m[i][8] / m[i][i];
    }
    Some(coeffs)
}

/// 画像の四隅を `corners` へ移す射影変換（バイリニア補間、範囲外は黒）
pub(crate) fn perspective_warp(img: &RgbImage, corners: &[(f32, f32); 4]) -> RgbImage {
    let (w, h) = img.dimensions();
    let (right, bottom) = (w.saturating_sub(1) as f32, h.saturating_sub(1) as f32);
    let source = [(0.0, 0.0), (right, 0.0), (right, bottom), (0.0, bottom)];

    // 出力座標から入力座標への逆変換
    let Some([a, b, c, d, e, f, g, hh]) = solve_homography(corners, &source) else {
        return img.clone();
    };

    RgbImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as f64, y as f64);
        let denom = g * x + hh * y + 1.0;
        if denom.abs() < 1e-12 {
            return Rgb([0, 0, 0]);
        }
        let sx = snap_to_edge((a * x + b * y + c) / denom, right as f64);
        let sy = snap_to_edge((d * x + e * y + f) / denom, bottom as f64);
        sample_bilinear(img, sx as f32, sy as f32)
    })
}

/// 丸め誤差で画像端をわずかに越えた座標を端に戻す
fn snap_to_edge(v: f64, max: f64) -> f64 {
    const EPS: f64 = 1e-3;
    if v < 0.0 && v > -EPS {
        0.0
    } else if v > max && v < max + EPS {
        max
    } else {
        v
    }
}

/// 3x3 ガウシアンぼかし（境界は反射で補う）
pub(crate) fn gaussian_blur_3x3(img: &RgbImage, sigma: f32) -> RgbImage {
    let side = (-1.0 / (2.0 * sigma * sigma)).exp();
    let norm = 1.0 + 2.0 * side;
    let weights = [side / norm, 1.0 / norm, side / norm];

    let reflect = |i: i64, len: u32| -> u32 {
        let last = len as i64 - 1;
        let r = if i < 0 {
            -i
        } else if i > last {
            2 * last - i
        } else {
            i
        };
        r.clamp(0, last) as u32
    };

    let (w, h) = img.dimensions();
    let convolve = |src: &RgbImage, horizontal: bool| {
        RgbImage::from_fn(w, h, |x, y| {
            let mut acc = [0.0f32; 3];
            for (k, weight) in weights.iter().enumerate() {
                let offset = k as i64 - 1;
                let p = if horizontal {
                    src.get_pixel(reflect(x as i64 + offset, w), y)
                } else {
                    src.get_pixel(x, reflect(y as i64 + offset, h))
                };
                for c in 0..3 {
                    acc[c] += weight * p[c] as f32;
                }
            }
            Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
        })
    };

    convolve(&convolve(img, true), false)
}

fn luminance(p: &Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn blend(value: u8, toward: f32, factor: f32) -> u8 {
    (toward + factor * (value as f32 - toward)).round().clamp(0.0, 255.0) as u8
}

fn adjust_brightness(img: &mut RgbImage, factor: f32) {
    if factor == 1.0 {
        return;
    }
    for p in img.pixels_mut() {
        for c in 0..3 {
            p[c] = blend(p[c], 0.0, factor);
        }
    }
}

fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    if factor == 1.0 {
        return;
    }
    let count = (img.width() * img.height()).max(1) as f32;
    let mean = img.pixels().map(luminance).sum::<f32>() / count;
    for p in img.pixels_mut() {
        for c in 0..3 {
            p[c] = blend(p[c], mean, factor);
        }
    }
}

fn adjust_saturation(img: &mut RgbImage, factor: f32) {
    if factor == 1.0 {
        return;
    }
    for p in img.pixels_mut() {
        let gray = luminance(p);
        for c in 0..3 {
            p[c] = blend(p[c], gray, factor);
        }
    }
}

/// 色相を回す（shift は1周を1.0とした割合）
fn adjust_hue(img: &mut RgbImage, shift: f32) {
    if shift == 0.0 {
        return;
    }
    for p in img.pixels_mut() {
        let (h, s, v) = rgb_to_hsv(p);
        *p = hsv_to_rgb((h + shift).rem_euclid(1.0), s, v);
    }
}

fn rgb_to_hsv(p: &Rgb<u8>) -> (f32, f32, f32) {
    let r = p[0] as f32 / 255.0;
    let g = p[1] as f32 / 255.0;
    let b = p[2] as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let sector = h * 6.0;
    let i = sector.floor() as i32 % 6;
    let f = sector - sector.floor();
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match i {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    let to_u8 = |x: f32| (x * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w.max(1)) as u8, (y * 255 / h.max(1)) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn half_red_half_blue(size: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(size, size, |x, _| {
            if x < size / 2 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        }))
    }

    fn no_randomness() -> AugmentationSettings {
        AugmentationSettings {
            flip_probability: 0.0,
            max_rotation_degrees: 0.0,
            crop_scale: (1.0, 1.0),
            crop_ratio: (1.0, 1.0),
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            hue: 0.0,
            perspective_probability: 0.0,
            distortion_scale: 0.3,
            blur_probability: 0.0,
            blur_sigma: (0.1, 1.5),
        }
    }

    #[test]
    fn test_eval_transform_output_size() {
        let transform = EvalTransform::new(32);
        for (w, h) in [(64, 48), (30, 90), (32, 32), (10, 10)] {
            let out = transform.apply(&gradient_image(w, h));
            assert_eq!(out.dimensions(), (32, 32), "input {}x{}", w, h);
        }
    }

    #[test]
    fn test_eval_transform_is_deterministic() {
        let transform = EvalTransform::new(24);
        let img = gradient_image(50, 40);
        assert_eq!(transform.apply(&img), transform.apply(&img));
    }

    #[test]
    fn test_augmentation_reproducible_with_seed() {
        let pipeline = AugmentationPipeline::new(AugmentationSettings::default(), 32);
        let img = gradient_image(64, 48);

        let a = pipeline.apply(&img, &mut StdRng::seed_from_u64(7));
        let b = pipeline.apply(&img, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.dimensions(), (32, 32));
    }

    #[test]
    fn test_augmentation_varies_between_draws() {
        let pipeline = AugmentationPipeline::new(AugmentationSettings::default(), 32);
        let img = gradient_image(64, 48);
        let mut rng = StdRng::seed_from_u64(1);

        let first = pipeline.apply(&img, &mut rng);
        let differs = (0..5).any(|_| pipeline.apply(&img, &mut rng) != first);
        assert!(differs);
    }

    #[test]
    fn test_flip_always() {
        let mut settings = no_randomness();
        settings.flip_probability = 1.0;
        let pipeline = AugmentationPipeline::new(settings, 16);
        let out = pipeline.apply(&half_red_half_blue(16), &mut StdRng::seed_from_u64(0));

        assert_eq!(out.get_pixel(0, 8), &Rgb([0, 0, 255]));
        assert_eq!(out.get_pixel(15, 8), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_no_flip() {
        let pipeline = AugmentationPipeline::new(no_randomness(), 16);
        let out = pipeline.apply(&half_red_half_blue(16), &mut StdRng::seed_from_u64(0));

        assert_eq!(out.get_pixel(0, 8), &Rgb([255, 0, 0]));
        assert_eq!(out.get_pixel(15, 8), &Rgb([0, 0, 255]));
    }

    #[test]
    fn test_perspective_always_with_zero_distortion_is_identity() {
        let mut settings = no_randomness();
        settings.perspective_probability = 1.0;
        settings.distortion_scale = 0.0;
        let pipeline = AugmentationPipeline::new(settings, 16);
        let img = half_red_half_blue(16);

        let warped = pipeline.apply(&img, &mut StdRng::seed_from_u64(3));
        let plain = AugmentationPipeline::new(no_randomness(), 16).apply(&img, &mut StdRng::seed_from_u64(3));
        assert_eq!(warped, plain);
    }

    #[test]
    fn test_perspective_always_moves_corners_inward() {
        let mut settings = no_randomness();
        settings.perspective_probability = 1.0;
        settings.distortion_scale = 0.5;
        let pipeline = AugmentationPipeline::new(settings, 32);
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([200, 200, 200])));

        let mut rng = StdRng::seed_from_u64(11);
        let black_corner = (0..5).any(|_| {
            let out = pipeline.apply(&img, &mut rng);
            assert_eq!(out.get_pixel(16, 16), &Rgb([200, 200, 200]));
            [(0, 0), (31, 0), (31, 31), (0, 31)]
                .iter()
                .any(|&(x, y)| out.get_pixel(x, y) == &Rgb([0, 0, 0]))
        });
        assert!(black_corner);
    }

    #[test]
    fn test_perspective_warp_fills_outside_black() {
        let img = RgbImage::from_pixel(17, 17, Rgb([120, 120, 120]));
        let identity = [(0.0, 0.0), (16.0, 0.0), (16.0, 16.0), (0.0, 16.0)];
        assert_eq!(perspective_warp(&img, &identity), img);

        let pinched = [(8.0, 8.0), (16.0, 0.0), (16.0, 16.0), (0.0, 16.0)];
        let warped = perspective_warp(&img, &pinched);
        assert_eq!(warped.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(warped.get_pixel(12, 12), &Rgb([120, 120, 120]));
    }

    #[test]
    fn test_blur_uses_three_tap_kernel() {
        let mut img = RgbImage::from_pixel(9, 9, Rgb([0, 0, 0]));
        img.put_pixel(4, 4, Rgb([255, 255, 255]));
        let blurred = gaussian_blur_3x3(&img, 1.5);

        assert!(blurred.get_pixel(3, 3)[0] > 0);
        assert!(blurred.get_pixel(4, 4)[0] < 255);
        // 3x3 の外側には広がらない
        assert_eq!(blurred.get_pixel(2, 4), &Rgb([0, 0, 0]));
        assert_eq!(blurred.get_pixel(6, 6), &Rgb([0, 0, 0]));

        let flat = RgbImage::from_pixel(5, 5, Rgb([90, 90, 90]));
        assert_eq!(gaussian_blur_3x3(&flat, 0.8), flat);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let img = gradient_image(20, 12).to_rgb8();
        assert_eq!(rotate_bilinear(&img, 0.0), img);
    }

    #[test]
    fn test_rotate_fills_corners_black() {
        let img = RgbImage::from_pixel(21, 21, Rgb([200, 200, 200]));
        let rotated = rotate_bilinear(&img, 45.0);
        assert_eq!(rotated.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(rotated.get_pixel(10, 10), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_hsv_roundtrip() {
        for p in [Rgb([255u8, 0, 0]), Rgb([12, 200, 99]), Rgb([30, 30, 30])] {
            let (h, s, v) = rgb_to_hsv(&p);
            let back = hsv_to_rgb(h, s, v);
            for c in 0..3 {
                assert!((back[c] as i32 - p[c] as i32).abs() <= 1, "{:?} -> {:?}", p, back);
            }
        }
    }

    #[test]
    fn test_normalize_layout_and_values() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        let data = normalize_chw(&img);

        assert_eq!(data.len(), 6);
        // R チャネル: 画素0, 画素1
        assert!((data[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((data[1] - (0.0 - 0.485) / 0.229).abs() < 1e-5);
        // G チャネル
        assert!((data[3] - (1.0 - 0.456) / 0.224).abs() < 1e-5);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(decode_image_bytes(&[]), Err(ClassifierError::InvalidImage(_))));
        assert!(matches!(
            decode_image_bytes(b"definitely not an image"),
            Err(ClassifierError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_decode_png_bytes() {
        let img = gradient_image(8, 8);
        let mut bytes = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        let decoded = decode_image_bytes(bytes.get_ref()).unwrap();
        assert_eq!(decoded.width(), 8);
    }
}
