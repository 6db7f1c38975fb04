// src/enrich.rs
//! Boundary with the image-enrichment collaborator.
//!
//! The collaborator reads every stored attachment under `raw/images/` and writes
//! one CSV row per image. This module lists the images it will see and reads its
//! result table back; the classification itself happens elsewhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::lake::{LakeError, LakeLayout};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Promotional => "promotional",
            ImageCategory::ProductDisplay => "product_display",
            ImageCategory::Lifestyle => "lifestyle",
            ImageCategory::Other => "other",
        }
    }
}

/// One row of the enrichment result table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionRow {
    pub message_id: i64,
    #[serde(rename = "channel_name")]
    pub source_id: String,
    #[serde(rename = "detected_class", default)]
    pub detected_labels: String,
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    #[serde(rename = "image_category")]
    pub category: ImageCategory,
}

impl DetectionRow {
    pub fn labels(&self) -> Vec<&str> {
        self.detected_labels
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("reading {}: {source}", path.display())]
    Csv { path: PathBuf, source: csv::Error },

    #[error("{}: row {row}: confidence {value} outside [0, 1]", path.display())]
    ConfidenceOutOfRange { path: PathBuf, row: usize, value: f64 },
}

/// An attachment the enrichment stage will process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub source_id: String,
    pub message_id: i64,
    pub path: PathBuf,
}

/// Non-empty images with a numeric stem, sorted by (source, message id).
pub fn list_images(layout: &LakeLayout) -> Result<Vec<ImageInput>, LakeError> {
    let root = layout.images_root();
    let sources = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(LakeError::Io { path: root, source }),
    };

    let mut out = Vec::new();
    for src in sources.flatten() {
        let dir = src.path();
        if !dir.is_dir() {
            continue;
        }
        let source_id = src.file_name().to_string_lossy().to_string();
        let files = fs::read_dir(&dir).map_err(|source| LakeError::Io {
            path: dir.clone(),
            source,
        })?;
        for f in files.flatten() {
            let path = f.path();
            if let Some(message_id) = image_message_id(&path) {
                out.push(ImageInput {
                    source_id: source_id.clone(),
                    message_id,
                    path,
                });
            }
        }
    }
    out.sort_by(|a, b| (&a.source_id, a.message_id).cmp(&(&b.source_id, b.message_id)));
    Ok(out)
}

fn image_message_id(path: &Path) -> Option<i64> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let non_empty = fs::metadata(path).map(|m| m.is_file() && m.len() > 0).ok()?;
    if !non_empty {
        tracing::debug!(path = %path.display(), "skipping empty image");
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Read and validate the enrichment result table.
pub fn read_detections(path: &Path) -> Result<Vec<DetectionRow>, DetectionError> {
    let csv_err = |source| DetectionError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::Reader::from_path(path).map_err(csv_err)?;
    let mut rows = Vec::new();
    for (i, row) in rdr.deserialize::<DetectionRow>().enumerate() {
        let row = row.map_err(csv_err)?;
        if !(0.0..=1.0).contains(&row.confidence) {
            return Err(DetectionError::ConfidenceOutOfRange {
                path: path.to_path_buf(),
                row: i + 1,
                value: row.confidence,
            });
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Row counts per category, every category present.
pub fn category_counts(rows: &[DetectionRow]) -> BTreeMap<ImageCategory, usize> {
    let mut out: BTreeMap<ImageCategory, usize> = [
        ImageCategory::Promotional,
        ImageCategory::ProductDisplay,
        ImageCategory::Lifestyle,
        ImageCategory::Other,
    ]
    .into_iter()
    .map(|c| (c, 0))
    .collect();
    for r in rows {
        *out.entry(r.category).or_default() += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_usable_images() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(tmp.path());
        let a = layout.images_dir("alpha");
        let b = layout.images_dir("beta");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("12.jpg"), b"x").unwrap();
        fs::write(a.join("3.JPEG"), b"x").unwrap();
        fs::write(a.join("4.jpg"), b"").unwrap();
        fs::write(a.join("notes.txt"), b"x").unwrap();
        fs::write(a.join("cover.png"), b"x").unwrap();
        fs::write(b.join("7.png"), b"x").unwrap();

        let got: Vec<(String, i64)> = list_images(&layout)
            .unwrap()
            .into_iter()
            .map(|i| (i.source_id, i.message_id))
            .collect();
        assert_eq!(
            got,
            vec![
                ("alpha".to_string(), 3),
                ("alpha".to_string(), 12),
                ("beta".to_string(), 7)
            ]
        );
    }

    #[test]
    fn no_image_root_means_no_images() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_images(&LakeLayout::new(tmp.path())).unwrap().is_empty());
    }

    #[test]
    fn reads_result_table() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("detections.csv");
        fs::write(
            &p,
            "message_id,channel_name,detected_class,confidence_score,image_category\n\
             12,alpha,\"person, bottle\",0.91,promotional\n\
             7,beta,,0,other\n",
        )
        .unwrap();

        let rows = read_detections(&p).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].labels(), vec!["person", "bottle"]);
        assert_eq!(rows[0].category, ImageCategory::Promotional);
        assert!(rows[1].labels().is_empty());

        let counts = category_counts(&rows);
        assert_eq!(counts[&ImageCategory::Promotional], 1);
        assert_eq!(counts[&ImageCategory::Other], 1);
        assert_eq!(counts[&ImageCategory::Lifestyle], 0);
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("detections.csv");
        fs::write(
            &p,
            "message_id,channel_name,detected_class,confidence_score,image_category\n\
             1,alpha,cup,1.5,product_display\n",
        )
        .unwrap();
        assert!(matches!(
            read_detections(&p),
            Err(DetectionError::ConfidenceOutOfRange { row: 1, .. })
        ));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("detections.csv");
        fs::write(
            &p,
            "message_id,channel_name,detected_class,confidence_score,image_category\n\
             1,alpha,cup,0.5,banner\n",
        )
        .unwrap();
        assert!(matches!(read_detections(&p), Err(DetectionError::Csv { .. })));
    }
}
