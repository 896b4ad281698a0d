//! Pages of a workflow and their `pagemeta.json` persistence.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use image::ImageFormat;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::bag::Bag;
use crate::error::{BagError, SpreadsError, ValidationError};

pub const PAGEMETA_JSON: &str = "pagemeta.json";

/// Plugin name to bag-relative derivative path, in insertion order.
///
/// Setting an entry for a plugin that already has one moves it to the end,
/// so the last entry is always the most recently written derivative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedImages(Vec<(String, String)>);

impl ProcessedImages {
    pub fn set(&mut self, plugin: &str, path: &str) {
        self.0.retain(|(name, _)| name != plugin);
        self.0.push((plugin.to_string(), path.to_string()));
    }

    pub fn get(&self, plugin: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == plugin)
            .map(|(_, path)| path.as_str())
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, p)| (n.as_str(), p.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, p)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl Serialize for ProcessedImages {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (plugin, path) in &self.0 {
            map.serialize_entry(plugin, path)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProcessedImages {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = ProcessedImages;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of plugin names to paths")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut images = ProcessedImages::default();
                while let Some((plugin, path)) = access.next_entry::<String, String>()? {
                    images.set(&plugin, &path);
                }
                Ok(images)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub capture_num: u32,
    pub sequence_num: u32,
    /// Bag-relative path below `data/raw/`.
    pub raw_image: String,
    #[serde(default)]
    pub processed_images: ProcessedImages,
    pub page_label: String,
    #[serde(default)]
    pub is_blank: bool,
}

impl Page {
    pub fn new(capture_num: u32, sequence_num: u32, raw_image: impl Into<String>) -> Self {
        Self {
            capture_num,
            sequence_num,
            raw_image: raw_image.into(),
            processed_images: ProcessedImages::default(),
            page_label: default_label(sequence_num),
            is_blank: false,
        }
    }

    pub fn set_processed(&mut self, plugin: &str, path: &str) {
        self.processed_images.set(plugin, path);
    }

    /// Moves the page to `sequence_num`. A label still at its default
    /// follows the new position.
    pub fn renumber(&mut self, sequence_num: u32) {
        if self.page_label == default_label(self.sequence_num) {
            self.page_label = default_label(sequence_num);
        }
        self.sequence_num = sequence_num;
    }

    pub fn set_metadata(&mut self, key: &str, value: &Value) -> Result<(), ValidationError> {
        match (key, value) {
            ("page_label", Value::String(label)) => self.page_label = label.clone(),
            ("page_label", Value::Number(n)) => self.page_label = n.to_string(),
            ("is_blank", Value::Bool(blank)) => self.is_blank = *blank,
            ("page_label" | "is_blank", other) => {
                return Err(ValidationError::new("invalid page metadata")
                    .with_field(key, format!("unsupported value {}", other)))
            }
            _ => {
                return Err(ValidationError::new("invalid page metadata")
                    .with_field(key, "unknown page attribute"))
            }
        }
        Ok(())
    }

    /// Most recently written derivative, optionally restricted to images.
    pub fn get_latest_processed(&self, image_only: bool) -> Option<&str> {
        self.processed_images
            .iter()
            .rev()
            .map(|(_, path)| path)
            .find(|path| !image_only || is_image(path))
    }

    /// Every file the page owns, raw image first.
    pub fn files(&self) -> Vec<&str> {
        std::iter::once(self.raw_image.as_str())
            .chain(self.processed_images.paths())
            .collect()
    }
}

fn default_label(sequence_num: u32) -> String {
    (sequence_num + 1).to_string()
}

pub fn is_image(path: &str) -> bool {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false)
}

/// Loads `pagemeta.json`; a bag without one has no pages.
pub fn load_pages(bag: &Bag) -> Result<Vec<Page>, BagError> {
    let Some(raw) = bag.read_tagfile(PAGEMETA_JSON)? else {
        return Ok(Vec::new());
    };
    let mut pages: Vec<Page> = serde_json::from_slice(&raw)
        .map_err(|e| BagError::Structure(format!("{} is invalid: {}", PAGEMETA_JSON, e)))?;
    pages.sort_by_key(|p| p.sequence_num);
    Ok(pages)
}

pub fn save_pages(bag: &mut Bag, pages: &[Page]) -> Result<(), BagError> {
    let json = serde_json::to_vec_pretty(pages)
        .map_err(|e| BagError::Structure(format!("cannot serialize pages: {}", e)))?;
    bag.write_tagfile(PAGEMETA_JSON, &json)
}

/// Crops the image at `path` in place.
pub fn crop_image(path: &Path, left: u32, top: u32, width: u32, height: u32) -> Result<(), SpreadsError> {
    let img = image::open(path).map_err(|e| image_error(path, e))?;
    if width == 0
        || height == 0
        || left.saturating_add(width) > img.width()
        || top.saturating_add(height) > img.height()
    {
        return Err(ValidationError::new("crop box outside of image")
            .with_field(
                "box",
                format!(
                    "{}x{}+{}+{} exceeds {}x{}",
                    width,
                    height,
                    left,
                    top,
                    img.width(),
                    img.height()
                ),
            )
            .into());
    }
    img.crop_imm(left, top, width, height)
        .save(path)
        .map_err(|e| image_error(path, e))
}

/// JPEG thumbnail no larger than `max_side` on either axis.
pub fn render_thumbnail(path: &Path, max_side: u32) -> Result<Vec<u8>, SpreadsError> {
    let img = image::open(path).map_err(|e| image_error(path, e))?;
    let thumb = img.thumbnail(max_side, max_side).to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    thumb
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| image_error(path, e))?;
    Ok(buf.into_inner())
}

fn image_error(path: &Path, err: image::ImageError) -> SpreadsError {
    match err {
        image::ImageError::IoError(source) => SpreadsError::io(path, source),
        other => SpreadsError::plugin("image", format!("{}: {}", crate::sanitize::redact_path(path), other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_processed_images_keep_insertion_order() {
        let mut page = Page::new(0, 0, "data/raw/000.jpg");
        page.set_processed("rotate", "data/done/rotate/000.jpg");
        page.set_processed("ocr", "data/done/ocr/000.hocr");
        page.set_processed("crop", "data/done/crop/000.jpg");

        let json = serde_json::to_string(&page.processed_images).unwrap();
        assert_eq!(
            json,
            r#"{"rotate":"data/done/rotate/000.jpg","ocr":"data/done/ocr/000.hocr","crop":"data/done/crop/000.jpg"}"#
        );
        let back: ProcessedImages = serde_json::from_str(&json).unwrap();
        assert_eq!(back, page.processed_images);
    }

    #[test]
    fn test_latest_processed_respects_image_filter() {
        let mut page = Page::new(0, 0, "data/raw/000.jpg");
        page.set_processed("rotate", "data/done/rotate/000.jpg");
        page.set_processed("crop", "data/done/crop/000.jpg");
        page.set_processed("ocr", "data/done/ocr/000.hocr");

        assert_eq!(page.get_latest_processed(true), Some("data/done/crop/000.jpg"));
        assert_eq!(page.get_latest_processed(false), Some("data/done/ocr/000.hocr"));

        // Re-running a plugin makes its output the latest
        page.set_processed("rotate", "data/done/rotate/000.jpg");
        assert_eq!(page.get_latest_processed(true), Some("data/done/rotate/000.jpg"));
        assert_eq!(page.processed_images.len(), 3);
    }

    #[test]
    fn test_default_label_follows_position() {
        let mut page = Page::new(4, 2, "data/raw/004.jpg");
        assert_eq!(page.page_label, "3");
        page.renumber(0);
        assert_eq!(page.page_label, "1");

        page.set_metadata("page_label", &json!("xii")).unwrap();
        page.renumber(5);
        assert_eq!(page.page_label, "xii");
    }

    #[test]
    fn test_set_metadata_rejects_unknown_keys() {
        let mut page = Page::new(0, 0, "data/raw/000.jpg");
        page.set_metadata("is_blank", &json!(true)).unwrap();
        assert!(page.is_blank);

        let err = page.set_metadata("rotation", &json!(90)).unwrap_err();
        assert!(err.fields.contains_key("rotation"));
        assert!(page.set_metadata("is_blank", &json!("yes")).is_err());
    }

    #[test]
    fn test_pagemeta_json_shape() {
        let mut page = Page::new(1, 1, "data/raw/001.jpg");
        page.set_processed("crop", "data/done/crop/001.jpg");
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(
            value,
            json!({
                "capture_num": 1,
                "sequence_num": 1,
                "raw_image": "data/raw/001.jpg",
                "processed_images": {"crop": "data/done/crop/001.jpg"},
                "page_label": "2",
                "is_blank": false
            })
        );
    }

    #[test]
    fn test_pages_persist_through_bag() {
        let temp_dir = TempDir::new().unwrap();
        let mut bag = Bag::create(&temp_dir.path().join("bag"), &[]).unwrap();
        assert!(load_pages(&bag).unwrap().is_empty());

        let pages = vec![Page::new(1, 1, "data/raw/001.jpg"), Page::new(0, 0, "data/raw/000.jpg")];
        save_pages(&mut bag, &pages).unwrap();

        let loaded = load_pages(&bag).unwrap();
        assert_eq!(loaded[0].capture_num, 0);
        assert_eq!(loaded[1].capture_num, 1);
        assert!(bag.tagfiles().any(|t| t == PAGEMETA_JSON));
    }

    #[test]
    fn test_crop_and_thumbnail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000.png");
        RgbImage::from_pixel(40, 30, Rgb([10, 20, 30])).save(&path).unwrap();

        crop_image(&path, 5, 5, 20, 10).unwrap();
        let cropped = image::open(&path).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (20, 10));

        assert!(matches!(
            crop_image(&path, 10, 0, 20, 10),
            Err(SpreadsError::Validation(_))
        ));

        let thumb = render_thumbnail(&path, 8).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert!(decoded.width() <= 8 && decoded.height() <= 8);
    }
}
