//! ModelPool - the ordered set of reconstructions explored in one run.
//!
//! The pool owns zero or more `Reconstruction` instances. Exactly one of them
//! is grown at a time; the others are finalized models that the grown model
//! may overlap with.

use std::collections::HashSet;

use anyhow::{ensure, Result};

use super::reconstruction::Reconstruction;
use super::types::ImageId;

/// Index of a model inside the pool.
pub type ModelIndex = usize;

/// Ordered multi-model container.
#[derive(Debug, Clone, Default)]
pub struct ModelPool {
    models: Vec<Reconstruction>,
}

impl ModelPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { models: Vec::new() }
    }

    /// Create a pool seeded with a single existing model to resume from.
    pub fn resume_from(model: Reconstruction) -> Self {
        Self {
            models: vec![model],
        }
    }

    /// Number of models in the pool.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Append a new empty model and return its index.
    pub fn add(&mut self) -> ModelIndex {
        self.models.push(Reconstruction::new());
        self.models.len() - 1
    }

    /// Append an existing model and return its index.
    pub fn push(&mut self, model: Reconstruction) -> ModelIndex {
        self.models.push(model);
        self.models.len() - 1
    }

    /// Remove the model at `idx`. Later models shift down by one.
    pub fn delete(&mut self, idx: ModelIndex) -> Result<Reconstruction> {
        ensure!(
            idx < self.models.len(),
            "model index {} out of range (pool holds {})",
            idx,
            self.models.len()
        );
        Ok(self.models.remove(idx))
    }

    pub fn get(&self, idx: ModelIndex) -> Option<&Reconstruction> {
        self.models.get(idx)
    }

    pub fn get_mut(&mut self, idx: ModelIndex) -> Option<&mut Reconstruction> {
        self.models.get_mut(idx)
    }

    /// All models, in insertion order.
    pub fn models(&self) -> &[Reconstruction] {
        &self.models
    }

    /// Split the pool into the model at `idx` (exclusively borrowed) and a
    /// shared view of every other model.
    pub fn split_mut(&mut self, idx: ModelIndex) -> Option<(&mut Reconstruction, OtherModels<'_>)> {
        if idx >= self.models.len() {
            return None;
        }
        let (before, rest) = self.models.split_at_mut(idx);
        let (current, after) = rest.split_first_mut()?;
        Some((
            current,
            OtherModels { before, after },
        ))
    }

    /// Number of distinct images registered in at least one model.
    pub fn num_total_reg_images(&self) -> usize {
        self.models
            .iter()
            .flat_map(|m| m.reg_image_ids().iter().copied())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Read-only view of every model except the one being grown.
pub struct OtherModels<'a> {
    before: &'a [Reconstruction],
    after: &'a [Reconstruction],
}

impl<'a> OtherModels<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &'a Reconstruction> {
        self.before.iter().chain(self.after.iter())
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of images of `model` that are registered in one of these
    /// models.
    pub fn num_shared_reg_images(&self, model: &Reconstruction) -> usize {
        let others: HashSet<ImageId> = self
            .iter()
            .flat_map(|m| m.reg_image_ids().iter().copied())
            .collect();
        model
            .reg_image_ids()
            .iter()
            .filter(|id| others.contains(id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::model::{Camera, CameraId, Image};

    fn model_with_registered(ids: &[u32], num_images: u32) -> Reconstruction {
        let mut rec = Reconstruction::new();
        rec.add_camera(Camera::new(CameraId::new(1), "PINHOLE", 100, 100, vec![100.0]));
        for i in 0..num_images {
            rec.add_image(Image::new(ImageId::new(i), format!("{i}"), CameraId::new(1)))
                .unwrap();
        }
        for &i in ids {
            rec.register_image(ImageId::new(i), SE3::identity()).unwrap();
        }
        rec
    }

    #[test]
    fn test_add_and_delete_restores_size() {
        let mut pool = ModelPool::new();
        pool.add();
        let before = pool.len();
        let idx = pool.add();
        pool.delete(idx).unwrap();
        assert_eq!(pool.len(), before);
        assert!(pool.delete(5).is_err());
    }

    #[test]
    fn test_shared_and_total_counts() {
        let mut pool = ModelPool::new();
        pool.push(model_with_registered(&[0, 1, 2, 3, 4], 10));
        pool.push(model_with_registered(&[2, 3, 4, 5], 10));

        assert_eq!(pool.num_total_reg_images(), 6);
        for idx in 0..2 {
            let (current, others) = pool.split_mut(idx).unwrap();
            assert_eq!(others.num_shared_reg_images(current), 3);
        }
    }

    #[test]
    fn test_split_mut_views_others() {
        let mut pool = ModelPool::new();
        pool.push(model_with_registered(&[0, 1], 4));
        pool.push(model_with_registered(&[1, 2], 4));
        pool.push(model_with_registered(&[2, 3], 4));

        let (current, others) = pool.split_mut(1).unwrap();
        assert_eq!(others.len(), 2);
        assert_eq!(others.num_shared_reg_images(current), 2);
        current.deregister_image(ImageId::new(2));
        assert_eq!(others.num_shared_reg_images(current), 1);

        assert!(pool.split_mut(3).is_none());
    }
}
