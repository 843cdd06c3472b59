#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use forensic_fusion::LabConfig;
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub const SIDE: u32 = 64;
const PATCH: (u32, u32, u32, u32) = (18, 14, 44, 40);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn in_patch(x: u32, y: u32) -> bool {
    let (x0, y0, x1, y1) = PATCH;
    (x0..x1).contains(&x) && (y0..y1).contains(&y)
}

/// Textured camera-like frame; manipulated frames carry a smooth, saturated
/// pasted block with different noise statistics.
pub fn synthetic_image(seed: u64, manipulated: bool) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let phase = rng.gen_range(0.0..6.28);
    RgbImage::from_fn(SIDE, SIDE, |x, y| {
        if manipulated && in_patch(x, y) {
            let v = 220 + rng.gen_range(0..3u8);
            return Rgb([v, 40, 30]);
        }
        let base = 110.0 + 50.0 * ((x as f64 * 0.31 + phase).sin() + (y as f64 * 0.17).cos()) / 2.0;
        let px = |offset: f64, rng: &mut StdRng| (base + offset + rng.gen_range(-18.0..18.0)).clamp(0.0, 255.0) as u8;
        Rgb([px(0.0, &mut rng), px(10.0, &mut rng), px(-15.0, &mut rng)])
    })
}

pub fn patch_mask() -> GrayImage {
    GrayImage::from_fn(SIDE, SIDE, |x, y| Luma([if in_patch(x, y) { 255 } else { 0 }]))
}

fn split_for(i: usize) -> &'static str {
    match i % 4 {
        0 | 1 => "train",
        2 => "val",
        _ => "test",
    }
}

/// Writes `n` images, their masks and a manifest CSV under `dir`.
/// Labels alternate within every split.
pub fn write_dataset(dir: &Path, n: usize) -> PathBuf {
    let images = dir.join("images");
    fs::create_dir_all(&images).unwrap();
    let mask_path = images.join("patch_mask.png");
    patch_mask().save(&mask_path).unwrap();

    let mut manifest = String::from("image_path,label,split,source_dataset,perturbation_tag,mask_path\n");
    for i in 0..n {
        let label = (i / 4) % 2;
        let manipulated = label == 1;
        let path = images.join(format!("img_{i:03}.png"));
        synthetic_image(i as u64, manipulated).save(&path).unwrap();
        let mask = if manipulated { mask_path.display().to_string() } else { String::new() };
        manifest.push_str(&format!(
            "{},{},{},synthetic,clean,{}\n",
            path.display(),
            label,
            split_for(i),
            mask
        ));
    }
    let manifest_path = dir.join("manifest.csv");
    fs::write(&manifest_path, manifest).unwrap();
    manifest_path
}

/// Small, fast configuration rooted at `dir`.
pub fn small_config(dir: &Path, manifest: &Path) -> LabConfig {
    let mut config = LabConfig::default();
    config.experiment.name = "integration".into();
    config.experiment.image_size = [SIDE, SIDE];
    config.evaluation.bootstrap_samples = 40;
    config.evaluation.error_top_k = 5;
    config.paths.resolve_against(dir);
    config.paths.manifest_csv = manifest.to_path_buf();
    config
}
