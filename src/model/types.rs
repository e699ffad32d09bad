//! Core ID types for the reconstruction structures.

use serde::{Deserialize, Serialize};

/// Unique identifier of an image.
///
/// Image ids come from the correspondence database and are shared by every
/// model in the pool, which is what makes overlap between models countable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u32);

impl ImageId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique identifier of a camera (a set of shared intrinsics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub u32);

impl CameraId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CAM{}", self.0)
    }
}

/// Unique identifier of a 3D point within one reconstruction.
///
/// Point ids are assigned sequentially by the owning reconstruction and are
/// never reused, so they are meaningless across models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point3DId(pub u64);

impl Point3DId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for Point3DId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// One 2D observation of a 3D point: the observing image and the index of
/// the keypoint inside that image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackElement {
    pub image_id: ImageId,
    pub point2d_idx: u32,
}

impl TrackElement {
    pub fn new(image_id: ImageId, point2d_idx: u32) -> Self {
        Self {
            image_id,
            point2d_idx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_id_equality() {
        let id1 = ImageId::new(42);
        let id2 = ImageId::new(42);
        let id3 = ImageId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert!(id1 < id3);
    }

    #[test]
    fn test_point_id_display() {
        let id = Point3DId::new(123);
        assert_eq!(format!("{}", id), "P123");
        assert_eq!(format!("{}", ImageId::new(7)), "#7");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<ImageId, &str> = HashMap::new();
        map.insert(ImageId::new(1), "first");
        map.insert(ImageId::new(2), "second");

        assert_eq!(map.get(&ImageId::new(1)), Some(&"first"));
        assert_eq!(map.get(&ImageId::new(3)), None);
    }
}
