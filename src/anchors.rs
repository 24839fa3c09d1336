use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};

/// A reference box one block of the anchor detector's output is decoded
/// against. Height and width are half extents, rotation is in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub rot: f32,
    pub height: f32,
    pub width: f32,
}

impl Anchor {
    pub fn new(rot: f32, height: f32, width: f32) -> Self {
        Self { rot, height, width }
    }
}

/// Reads a JSON array of `{rot, height, width}` objects.
pub fn load_anchors<P: AsRef<Path>>(path: P) -> DetectorResult<Vec<Anchor>> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let file = File::open(path).map_err(|source| DetectorError::AnchorsIo {
        path: display.clone(),
        source,
    })?;
    let anchors: Vec<Anchor> = serde_json::from_reader(BufReader::new(file))
        .map_err(|source| DetectorError::AnchorsFormat {
            path: display.clone(),
            source,
        })?;

    if anchors.is_empty() {
        return Err(DetectorError::EmptyAnchors(display));
    }

    log::info!("loaded {} anchors from {}", anchors.len(), display);
    Ok(anchors)
}
