//! Image degradations used by the robustness suite.
//!
//! Random perturbations draw from a `StdRng` seeded by the caller, so the
//! same `(image, scenario, seed)` always yields the same output.

use image::{
    RgbImage,
    imageops::{self, FilterType},
};
use rand::{Rng, SeedableRng, distributions::Distribution, rngs::StdRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::{
    error::{ForensicsError, Result},
    image_utils,
};

const MIN_RESIZED_SIDE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Perturbation {
    Jpeg { quality: u8 },
    Resize { scale: f64 },
    Blur { sigma: f64 },
    GaussianNoise { std: f64 },
    SaltPepper { amount: f64 },
    Chained { pipeline: Vec<Perturbation> },
}

impl Perturbation {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ForensicsError::InvalidConfig(msg));
        match self {
            Perturbation::Jpeg { quality } if !(1..=100).contains(quality) => {
                invalid(format!("jpeg quality must be in 1..=100, got {quality}"))
            }
            Perturbation::Resize { scale } if !(scale.is_finite() && *scale > 0.0) => {
                invalid(format!("resize scale must be positive, got {scale}"))
            }
            Perturbation::Blur { sigma } if !(sigma.is_finite() && *sigma > 0.0) => {
                invalid(format!("blur sigma must be positive, got {sigma}"))
            }
            Perturbation::GaussianNoise { std } if !(std.is_finite() && *std >= 0.0) => {
                invalid(format!("noise std must be non-negative, got {std}"))
            }
            Perturbation::SaltPepper { amount } if !(0.0..=1.0).contains(amount) => {
                invalid(format!("salt-and-pepper amount must be in [0, 1], got {amount}"))
            }
            Perturbation::Chained { pipeline } => {
                if pipeline.is_empty() {
                    return invalid("chained perturbation needs at least one step".into());
                }
                for step in pipeline {
                    if matches!(step, Perturbation::Chained { .. }) {
                        return invalid("chained perturbations cannot be nested".into());
                    }
                    step.validate()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Applies the perturbation. Step `i` of a chain is seeded with `seed + i + 1`.
    pub fn apply(&self, image: &RgbImage, seed: u64) -> Result<RgbImage> {
        match self {
            Perturbation::Jpeg { quality } => image_utils::recompress_jpeg(image, *quality),
            Perturbation::Resize { scale } => Ok(resize_round_trip(image, *scale)),
            Perturbation::Blur { sigma } => Ok(imageproc::filter::gaussian_blur_f32(image, *sigma as f32)),
            Perturbation::GaussianNoise { std } => gaussian_noise(image, *std, seed),
            Perturbation::SaltPepper { amount } => Ok(salt_pepper(image, *amount, seed)),
            Perturbation::Chained { pipeline } => {
                let mut current = image.clone();
                for (i, step) in pipeline.iter().enumerate() {
                    current = step.apply(&current, seed.wrapping_add(i as u64 + 1))?;
                }
                Ok(current)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(flatten)]
    pub perturbation: Perturbation,
}

impl Scenario {
    pub fn new(name: impl Into<String>, perturbation: Perturbation) -> Self {
        Self {
            name: name.into(),
            perturbation,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ForensicsError::InvalidConfig("scenario name must not be empty".into()));
        }
        self.perturbation.validate()
    }

    pub fn apply(&self, image: &RgbImage, seed: u64) -> Result<RgbImage> {
        self.perturbation.apply(image, seed)
    }

    pub fn default_suite() -> Vec<Scenario> {
        vec![
            Scenario::new("jpeg_q70", Perturbation::Jpeg { quality: 70 }),
            Scenario::new("jpeg_q50", Perturbation::Jpeg { quality: 50 }),
            Scenario::new("resize_0.75", Perturbation::Resize { scale: 0.75 }),
            Scenario::new("blur_sigma1", Perturbation::Blur { sigma: 1.0 }),
            Scenario::new("gaussian_noise_std5", Perturbation::GaussianNoise { std: 5.0 }),
            Scenario::new("salt_pepper_0.01", Perturbation::SaltPepper { amount: 0.01 }),
            Scenario::new(
                "jpeg75_resize0.8",
                Perturbation::Chained {
                    pipeline: vec![
                        Perturbation::Jpeg { quality: 75 },
                        Perturbation::Resize { scale: 0.8 },
                    ],
                },
            ),
        ]
    }
}

fn resize_round_trip(image: &RgbImage, scale: f64) -> RgbImage {
    let (width, height) = image.dimensions();
    let scaled_w = ((width as f64 * scale) as u32).max(MIN_RESIZED_SIDE);
    let scaled_h = ((height as f64 * scale) as u32).max(MIN_RESIZED_SIDE);
    let small = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
    imageops::resize(&small, width, height, FilterType::Triangle)
}

fn gaussian_noise(image: &RgbImage, std: f64, seed: u64) -> Result<RgbImage> {
    if std == 0.0 {
        return Ok(image.clone());
    }
    let normal = Normal::new(0.0, std)
        .map_err(|e| ForensicsError::InvalidParameter(format!("noise std {std}: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut out = image.clone();
    for value in out.iter_mut() {
        let noisy = *value as f64 + normal.sample(&mut rng);
        *value = noisy.clamp(0.0, 255.0) as u8;
    }
    Ok(out)
}

/// Sets `total * amount / 2` random pixels to white, then as many to black.
fn salt_pepper(image: &RgbImage, amount: f64, seed: u64) -> RgbImage {
    let (width, height) = image.dimensions();
    let count = ((width as f64 * height as f64) * amount / 2.0) as usize;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut out = image.clone();
    for fill in [255u8, 0u8] {
        for _ in 0..count {
            let y = rng.gen_range(0..height);
            let x = rng.gen_range(0..width);
            out.put_pixel(x, y, image::Rgb([fill; 3]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, ((x + y) * 2 % 256) as u8])
        })
    }

    #[test]
    fn scenario_json_uses_flat_type_tag() {
        let json = r#"{"name":"combo","type":"chained","pipeline":[{"type":"jpeg","quality":60},{"type":"blur","sigma":0.8}]}"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.name, "combo");
        assert_eq!(
            scenario.perturbation,
            Perturbation::Chained {
                pipeline: vec![Perturbation::Jpeg { quality: 60 }, Perturbation::Blur { sigma: 0.8 }]
            }
        );
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn nested_chains_are_rejected() {
        let nested = Perturbation::Chained {
            pipeline: vec![Perturbation::Chained {
                pipeline: vec![Perturbation::Jpeg { quality: 80 }],
            }],
        };
        assert!(nested.validate().is_err());
        assert!(Perturbation::Chained { pipeline: vec![] }.validate().is_err());
        assert!(Perturbation::Blur { sigma: 0.0 }.validate().is_err());
        assert!(Perturbation::Jpeg { quality: 0 }.validate().is_err());
    }

    #[test]
    fn default_suite_is_valid() {
        for scenario in Scenario::default_suite() {
            scenario.validate().unwrap();
        }
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let image = gradient(32, 32);
        let noise = Perturbation::GaussianNoise { std: 8.0 };
        let a = noise.apply(&image, 7).unwrap();
        let b = noise.apply(&image, 7).unwrap();
        let c = noise.apply(&image, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, image);
    }

    #[test]
    fn salt_pepper_only_writes_extremes() {
        let image = RgbImage::from_pixel(40, 40, image::Rgb([120, 120, 120]));
        let out = Perturbation::SaltPepper { amount: 0.1 }.apply(&image, 3).unwrap();
        let changed: Vec<_> = out.pixels().filter(|p| p.0 != [120, 120, 120]).collect();
        assert!(!changed.is_empty());
        assert!(changed.len() <= 160);
        assert!(changed.iter().all(|p| p.0 == [255; 3] || p.0 == [0; 3]));
    }

    #[test]
    fn geometric_perturbations_keep_dimensions() {
        let image = gradient(48, 32);
        for perturbation in [
            Perturbation::Resize { scale: 0.1 },
            Perturbation::Resize { scale: 1.5 },
            Perturbation::Blur { sigma: 1.5 },
            Perturbation::Jpeg { quality: 40 },
        ] {
            let out = perturbation.apply(&image, 0).unwrap();
            assert_eq!(out.dimensions(), (48, 32));
        }
    }

    #[test]
    fn zero_noise_is_identity() {
        let image = gradient(16, 16);
        let out = Perturbation::GaussianNoise { std: 0.0 }.apply(&image, 1).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn chain_applies_steps_in_order_with_offset_seeds() {
        let image = gradient(32, 32);
        let noise = Perturbation::GaussianNoise { std: 8.0 };
        let speckle = Perturbation::SaltPepper { amount: 0.05 };
        let chain = Perturbation::Chained {
            pipeline: vec![noise.clone(), speckle.clone()],
        };

        let chained = chain.apply(&image, 11).unwrap();
        let stepwise = speckle.apply(&noise.apply(&image, 12).unwrap(), 13).unwrap();
        assert_eq!(chained, stepwise);

        let reversed = Perturbation::Chained {
            pipeline: vec![speckle, noise],
        };
        assert_ne!(reversed.apply(&image, 11).unwrap(), chained);
    }

    #[test]
    fn chain_seed_wraps_at_u64_max() {
        let image = gradient(16, 16);
        let noise = Perturbation::GaussianNoise { std: 4.0 };
        let chain = Perturbation::Chained {
            pipeline: vec![noise.clone()],
        };
        assert_eq!(chain.apply(&image, u64::MAX).unwrap(), noise.apply(&image, 0).unwrap());
    }
}
