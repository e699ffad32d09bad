//! Correspondence cache and the sources that produce it.
//!
//! The cache is the in-memory view of the feature-matching database that the
//! mapping controller needs: which images exist, which cameras they use, and
//! how many verified matches each image pair has. Loading applies the
//! minimum-match, watermark and image-name filters once, so every model of a
//! run sees the same image set.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use tracing::{debug, info};

use crate::model::{Camera, CameraId, ImageId};

/// Parameters of a correspondence load.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    /// Pairs with fewer verified matches are ignored.
    pub min_num_matches: usize,

    /// Ignore pairs flagged as watermark matches.
    pub ignore_watermarks: bool,

    /// Only keep images with these names. Empty means keep all.
    pub image_names: BTreeSet<String>,
}

/// An image entry of the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedImage {
    pub id: ImageId,
    pub name: String,
    pub camera_id: CameraId,
    pub num_points2d: u32,
    pub num_observations: u32,
}

/// A verified image pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePair {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub num_matches: usize,
    pub is_watermark: bool,
}

impl ImagePair {
    /// Canonical key with the smaller id first.
    pub fn key(&self) -> (ImageId, ImageId) {
        if self.image_id1 <= self.image_id2 {
            (self.image_id1, self.image_id2)
        } else {
            (self.image_id2, self.image_id1)
        }
    }
}

/// Filtered, in-memory correspondence data.
#[derive(Debug, Clone, Default)]
pub struct CorrespondenceCache {
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, CachedImage>,
    pairs: BTreeMap<(ImageId, ImageId), usize>,
}

impl CorrespondenceCache {
    /// Build a cache from raw database content, applying the request's
    /// filters. Images left without any pair are dropped, as are cameras no
    /// remaining image uses.
    pub fn build(
        cameras: Vec<Camera>,
        images: Vec<CachedImage>,
        pairs: Vec<ImagePair>,
        request: &LoadRequest,
    ) -> Self {
        let name_filter = |image: &CachedImage| {
            request.image_names.is_empty() || request.image_names.contains(&image.name)
        };
        let candidate_ids: HashSet<ImageId> = images
            .iter()
            .filter(|image| name_filter(image))
            .map(|image| image.id)
            .collect();

        let mut kept_pairs = BTreeMap::new();
        for pair in &pairs {
            if pair.image_id1 == pair.image_id2 {
                continue;
            }
            if pair.num_matches < request.min_num_matches {
                continue;
            }
            if request.ignore_watermarks && pair.is_watermark {
                continue;
            }
            if !candidate_ids.contains(&pair.image_id1) || !candidate_ids.contains(&pair.image_id2) {
                continue;
            }
            *kept_pairs.entry(pair.key()).or_insert(0) += pair.num_matches;
        }

        let connected: HashSet<ImageId> = kept_pairs
            .keys()
            .flat_map(|&(a, b)| [a, b])
            .collect();

        let images: BTreeMap<ImageId, CachedImage> = images
            .into_iter()
            .filter(|image| connected.contains(&image.id))
            .map(|image| (image.id, image))
            .collect();

        let used_cameras: HashSet<CameraId> = images.values().map(|image| image.camera_id).collect();
        let cameras = cameras
            .into_iter()
            .filter(|camera| used_cameras.contains(&camera.id))
            .map(|camera| (camera.id, camera))
            .collect();

        debug!(
            "[Correspondences] kept {} images and {} pairs (min_num_matches={})",
            images.len(),
            kept_pairs.len(),
            request.min_num_matches
        );

        Self {
            cameras,
            images,
            pairs: kept_pairs,
        }
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    pub fn images(&self) -> impl Iterator<Item = &CachedImage> {
        self.images.values()
    }

    pub fn image(&self, id: ImageId) -> Option<&CachedImage> {
        self.images.get(&id)
    }

    pub fn find_image_by_name(&self, name: &str) -> Option<&CachedImage> {
        self.images.values().find(|image| image.name == name)
    }

    pub fn num_matches(&self, a: ImageId, b: ImageId) -> usize {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.pairs.get(&key).copied().unwrap_or(0)
    }
}

/// Anything that can produce a correspondence cache.
pub trait CorrespondenceSource: Send {
    fn load(&mut self, request: &LoadRequest) -> Result<CorrespondenceCache>;
}

/// A source backed by an in-memory copy of the database content.
#[derive(Debug, Clone, Default)]
pub struct MemoryCorrespondenceSource {
    pub cameras: Vec<Camera>,
    pub images: Vec<CachedImage>,
    pub pairs: Vec<ImagePair>,
}

impl CorrespondenceSource for MemoryCorrespondenceSource {
    fn load(&mut self, request: &LoadRequest) -> Result<CorrespondenceCache> {
        Ok(CorrespondenceCache::build(
            self.cameras.clone(),
            self.images.clone(),
            self.pairs.clone(),
            request,
        ))
    }
}

/// A source reading three CSV tables from a directory.
///
/// ```text
/// cameras.csv  camera_id, model, width, height, param0 [, param1 ...]
/// images.csv   image_id, name, camera_id, num_points2d, num_observations
/// matches.csv  image_id1, image_id2, num_matches [, is_watermark]
/// ```
///
/// Lines starting with `#` are comments.
#[derive(Debug, Clone)]
pub struct CsvCorrespondenceSource {
    root: PathBuf,
}

impl CsvCorrespondenceSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl CorrespondenceSource for CsvCorrespondenceSource {
    fn load(&mut self, request: &LoadRequest) -> Result<CorrespondenceCache> {
        let cameras = load_cameras(&self.root.join("cameras.csv"))?;
        let images = load_images(&self.root.join("images.csv"))?;
        let pairs = load_pairs(&self.root.join("matches.csv"))?;
        info!(
            "[Correspondences] read {} cameras, {} images, {} pairs from {}",
            cameras.len(),
            images.len(),
            pairs.len(),
            self.root.display()
        );
        Ok(CorrespondenceCache::build(cameras, images, pairs, request))
    }
}

fn open_table(csv_path: &Path) -> Result<csv::Reader<std::fs::File>> {
    ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))
}

fn load_cameras(csv_path: &Path) -> Result<Vec<Camera>> {
    let mut rdr = open_table(csv_path)?;
    let mut cameras = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 5 {
            bail!(
                "{}: camera row needs at least 5 columns, got {}",
                csv_path.display(),
                rec.len()
            );
        }
        let params = rec
            .iter()
            .skip(4)
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("{}: bad camera parameter", csv_path.display()))?;
        cameras.push(Camera::new(
            CameraId::new(rec[0].parse()?),
            &rec[1],
            rec[2].parse()?,
            rec[3].parse()?,
            params,
        ));
    }
    Ok(cameras)
}

fn load_images(csv_path: &Path) -> Result<Vec<CachedImage>> {
    let mut rdr = open_table(csv_path)?;
    let mut images = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 5 {
            bail!(
                "{}: image row needs 5 columns, got {}",
                csv_path.display(),
                rec.len()
            );
        }
        images.push(CachedImage {
            id: ImageId::new(rec[0].parse()?),
            name: rec[1].to_string(),
            camera_id: CameraId::new(rec[2].parse()?),
            num_points2d: rec[3].parse()?,
            num_observations: rec[4].parse()?,
        });
    }
    Ok(images)
}

fn load_pairs(csv_path: &Path) -> Result<Vec<ImagePair>> {
    let mut rdr = open_table(csv_path)?;
    let mut pairs = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 3 {
            bail!(
                "{}: match row needs at least 3 columns, got {}",
                csv_path.display(),
                rec.len()
            );
        }
        let is_watermark = match rec.get(3) {
            Some(flag) => matches!(flag, "1" | "true"),
            None => false,
        };
        pairs.push(ImagePair {
            image_id1: ImageId::new(rec[0].parse()?),
            image_id2: ImageId::new(rec[1].parse()?),
            num_matches: rec[2].parse()?,
            is_watermark,
        });
    }
    Ok(pairs)
}
