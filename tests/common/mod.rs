#![allow(dead_code)]

use std::path::{Path, PathBuf};

use cat_classifier_lib::model::AppConfig;
use image::{Rgb, RgbImage};

/// クラスごとに色味の異なる小さなPNGを書き出す
pub fn write_class_images(dir: &Path, count: usize, base: [u8; 3]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    (0..count)
        .map(|i| {
            let img = RgbImage::from_fn(40, 30, |x, y| {
                let stripe = if (x / 4 + y / 4) % 2 == 0 { 30 } else { 0 };
                Rgb([
                    base[0].saturating_add(stripe).wrapping_add(i as u8),
                    base[1].saturating_add((y * 2) as u8),
                    base[2].saturating_sub(stripe),
                ])
            });
            let path = dir.join(format!("img_{:02}.png", i));
            img.save(&path).unwrap();
            path
        })
        .collect()
}

/// `root/dataset/{cats,not_cats}` に画像を用意する
pub fn write_dataset(root: &Path, per_class: usize) -> PathBuf {
    let dataset = root.join("dataset");
    write_class_images(&dataset.join("cats"), per_class, [210, 120, 60]);
    write_class_images(&dataset.join("not_cats"), per_class, [40, 90, 200]);
    dataset
}

/// CPUで数秒以内に終わる小さな学習設定
pub fn small_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.training.data_dir = root.join("dataset");
    config.training.log_path = root.join("logs/train_log.jsonl");
    config.training.num_epochs = 3;
    config.training.batch_size = 4;
    config.training.num_workers = 0;
    config.training.train_ratio = 0.75;
    config.training.seed = 7;
    config.model.checkpoint_path = root.join("models/cats.tar.gz");
    config.model.class_map_path = root.join("models/class_to_idx.json");
    config.model.image_size = 32;
    config.model.base_width = 4;
    config
}
