//! Synthetic scene: ground truth for the simulated engines.
//!
//! Images sit on a circle around the origin, looking inwards. Every image
//! anchors `points_per_image` landmarks that stay visible in the next
//! `window - 1` images of the same cluster, so consecutive images share
//! tracks and clusters are disconnected from each other.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::f64::consts::TAU;

use nalgebra::{UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::engine::SeedTuple;
use crate::geometry::SE3;
use crate::io::{CachedImage, ImagePair, MemoryCorrespondenceSource};
use crate::model::{Camera, CameraId, ImageId};

/// Id of the single camera every synthetic image uses.
pub const SCENE_CAMERA_ID: CameraId = CameraId(1);

/// Scene generation parameters.
#[derive(Debug, Clone)]
pub struct SceneConfig {
    /// Number of images per cluster. Clusters share no landmark.
    pub cluster_sizes: Vec<usize>,
    /// Landmarks anchored at every image.
    pub points_per_image: usize,
    /// Number of consecutive images a landmark is visible in.
    pub window: usize,
    /// Radius of the camera circle.
    pub radius: f64,
    /// Fraction of observations that are gross outliers.
    pub outlier_ratio: f64,
    pub seed: u64,

    /// Inlier count every seed tuple reaches. Initialization succeeds when
    /// it is at least `init_min_num_inliers`.
    pub init_num_inliers: usize,
    /// Triangulation angle (deg) every seed tuple reaches.
    pub init_tri_angle: f64,

    /// Images whose registration always fails.
    pub failing_images: BTreeSet<ImageId>,
    /// Images the color sampler cannot read.
    pub unreadable_images: BTreeSet<ImageId>,
    /// Seed tuples proposed instead of the consecutive default.
    pub seed_tuples: Option<Vec<SeedTuple>>,
    /// Refuse seed images that another model already registered.
    pub exclusive_seeds: bool,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            cluster_sizes: vec![12],
            points_per_image: 30,
            window: 4,
            radius: 5.0,
            outlier_ratio: 0.05,
            seed: 7,
            init_num_inliers: 200,
            init_tri_angle: 20.0,
            failing_images: BTreeSet::new(),
            unreadable_images: BTreeSet::new(),
            seed_tuples: None,
            exclusive_seeds: true,
        }
    }
}

/// A ground-truth image.
#[derive(Debug, Clone)]
pub struct SceneImage {
    pub id: ImageId,
    pub name: String,
    pub cluster: usize,
    /// True pose `T_cw`.
    pub pose: SE3,
    /// Landmarks visible in this image. The keypoint index of a landmark
    /// observation equals the landmark index.
    pub landmarks: Vec<usize>,
}

/// A ground-truth 3D point.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub xyz: Vector3<f64>,
    pub color: [u8; 3],
    pub observers: Vec<ImageId>,
}

/// Deterministic synthetic dataset.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub config: SceneConfig,
    pub camera: Camera,
    images: BTreeMap<ImageId, SceneImage>,
    landmarks: Vec<Landmark>,
    outliers: HashSet<(ImageId, usize)>,
}

impl SyntheticScene {
    pub fn generate(config: SceneConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let num_images: usize = config.cluster_sizes.iter().sum();
        let camera = Camera::new(SCENE_CAMERA_ID, "SIMPLE_RADIAL", 640, 480, vec![500.0, 320.0, 240.0, 0.0]);

        let mut images = BTreeMap::new();
        let mut landmarks = Vec::new();
        let mut outliers = HashSet::new();

        let mut first = 0usize;
        for (cluster, &size) in config.cluster_sizes.iter().enumerate() {
            for offset in 0..size {
                let index = first + offset;
                let id = ImageId::new(index as u32);
                let angle = TAU * index as f64 / num_images.max(1) as f64;
                images.insert(
                    id,
                    SceneImage {
                        id,
                        name: format!("image_{:04}.jpg", index),
                        cluster,
                        pose: look_at_origin(config.radius, angle),
                        landmarks: Vec::new(),
                    },
                );
            }

            for anchor in 0..size {
                let last = (anchor + config.window).min(size);
                let observers: Vec<ImageId> = (anchor..last)
                    .map(|offset| ImageId::new((first + offset) as u32))
                    .collect();
                if observers.len() < 2 {
                    continue;
                }
                for _ in 0..config.points_per_image {
                    let landmark = landmarks.len();
                    let xyz = Vector3::new(
                        rng.gen_range(-1.0..1.0),
                        rng.gen_range(-1.0..1.0),
                        rng.gen_range(-1.0..1.0),
                    );
                    let color = [rng.gen(), rng.gen(), rng.gen()];
                    for &observer in &observers {
                        if let Some(image) = images.get_mut(&observer) {
                            image.landmarks.push(landmark);
                        }
                        if rng.gen_bool(config.outlier_ratio.clamp(0.0, 1.0)) {
                            outliers.insert((observer, landmark));
                        }
                    }
                    landmarks.push(Landmark {
                        xyz,
                        color,
                        observers: observers.clone(),
                    });
                }
            }
            first += size;
        }

        Self {
            config,
            camera,
            images,
            landmarks,
            outliers,
        }
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn image(&self, id: ImageId) -> Option<&SceneImage> {
        self.images.get(&id)
    }

    pub fn images(&self) -> impl Iterator<Item = &SceneImage> {
        self.images.values()
    }

    pub fn landmark(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.get(index)
    }

    pub fn is_outlier(&self, image_id: ImageId, landmark: usize) -> bool {
        self.outliers.contains(&(image_id, landmark))
    }

    /// Number of landmarks two images both observe.
    pub fn num_shared_landmarks(&self, a: ImageId, b: ImageId) -> usize {
        match (self.images.get(&a), self.images.get(&b)) {
            (Some(a), Some(b)) => {
                let seen: HashSet<usize> = a.landmarks.iter().copied().collect();
                b.landmarks.iter().filter(|l| seen.contains(l)).count()
            }
            _ => 0,
        }
    }

    /// Seed tuples: the configured ones, or every run of four consecutive
    /// images inside a cluster.
    pub fn seed_tuples(&self) -> Vec<SeedTuple> {
        if let Some(tuples) = &self.config.seed_tuples {
            return tuples.clone();
        }
        let ids: Vec<&SceneImage> = self.images.values().collect();
        ids.windows(4)
            .filter(|w| w.iter().all(|image| image.cluster == w[0].cluster))
            .map(|w| [w[0].id, w[1].id, w[2].id, w[3].id])
            .collect()
    }

    /// Database content of the scene.
    pub fn correspondence_source(&self) -> MemoryCorrespondenceSource {
        let images = self
            .images
            .values()
            .map(|image| CachedImage {
                id: image.id,
                name: image.name.clone(),
                camera_id: SCENE_CAMERA_ID,
                num_points2d: self.landmarks.len() as u32,
                num_observations: image.landmarks.len() as u32,
            })
            .collect();

        let ids: Vec<ImageId> = self.images.keys().copied().collect();
        let mut pairs = Vec::new();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                let num_matches = self.num_shared_landmarks(a, b);
                if num_matches > 0 {
                    pairs.push(ImagePair {
                        image_id1: a,
                        image_id2: b,
                        num_matches,
                        is_watermark: false,
                    });
                }
            }
        }

        MemoryCorrespondenceSource {
            cameras: vec![self.camera.clone()],
            images,
            pairs,
        }
    }
}

/// Pose `T_cw` of a camera on a circle of `radius` at `angle`, looking at
/// the origin.
fn look_at_origin(radius: f64, angle: f64) -> SE3 {
    let center = Vector3::new(radius * angle.cos(), 0.0, radius * angle.sin());
    let rotation_wc = UnitQuaternion::face_towards(&(-center), &Vector3::y());
    let rotation_cw = rotation_wc.inverse();
    let translation = -(rotation_cw * center);
    SE3::new(rotation_cw, translation)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_generation_is_deterministic() {
        let a = SyntheticScene::generate(SceneConfig::default());
        let b = SyntheticScene::generate(SceneConfig::default());
        assert_eq!(a.num_landmarks(), b.num_landmarks());
        assert_eq!(a.landmark(17).unwrap().xyz, b.landmark(17).unwrap().xyz);
    }

    #[test]
    fn test_clusters_share_no_landmark() {
        let scene = SyntheticScene::generate(SceneConfig {
            cluster_sizes: vec![6, 4],
            ..Default::default()
        });
        assert_eq!(scene.num_images(), 10);
        assert!(scene.num_shared_landmarks(ImageId::new(4), ImageId::new(5)) > 0);
        assert_eq!(scene.num_shared_landmarks(ImageId::new(5), ImageId::new(6)), 0);

        let tuples = scene.seed_tuples();
        // 3 runs in the first cluster, 1 in the second.
        assert_eq!(tuples.len(), 4);
        assert_eq!(tuples[3], [ImageId::new(6), ImageId::new(7), ImageId::new(8), ImageId::new(9)]);
    }

    #[test]
    fn test_cameras_look_at_origin() {
        let scene = SyntheticScene::generate(SceneConfig::default());
        for image in scene.images() {
            let origin_in_camera = image.pose.transform_point(&Vector3::zeros());
            assert_relative_eq!(origin_in_camera.x, 0.0, epsilon = 1e-9);
            assert_relative_eq!(origin_in_camera.y, 0.0, epsilon = 1e-9);
            assert_relative_eq!(origin_in_camera.z, 5.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_source_has_one_pair_per_overlapping_image_pair() {
        let scene = SyntheticScene::generate(SceneConfig {
            cluster_sizes: vec![5],
            window: 3,
            ..Default::default()
        });
        let source = scene.correspondence_source();
        assert_eq!(source.images.len(), 5);
        // Window 3: neighbours at distance 1 and 2 overlap.
        assert_eq!(source.pairs.len(), 4 + 3);
    }
}
