//! Run configuration: mapper options, derived engine blocks, YAML loading.

pub mod bundle;
pub mod options;

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

pub use bundle::{BundleAdjustmentOptions, LossFunction, SolverOptions};
pub use options::{ImageSelectionMethod, MapperOptions, RegistrationOptions, TriangulationOptions};

/// Load mapper options from a YAML file. Missing fields take their defaults.
/// The result is validated before it is returned.
pub fn load_options<P: AsRef<Path>>(path: P) -> Result<MapperOptions> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let options: MapperOptions = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse mapper options from {}", path.display()))?;
    options
        .check()
        .with_context(|| format!("Invalid mapper options in {}", path.display()))?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_options_validates() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.yaml");
        fs::write(&good, "max_model_overlap: 3\n").unwrap();
        assert_eq!(load_options(&good).unwrap().max_model_overlap, 3);

        let bad = dir.path().join("bad.yaml");
        fs::write(&bad, "ba_global_points_ratio: 0.5\n").unwrap();
        assert!(load_options(&bad).is_err());

        assert!(load_options(dir.path().join("missing.yaml")).is_err());
    }
}
