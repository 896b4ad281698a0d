//! Dublin-Core style book metadata, stored as `dcmeta.txt`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::bag::tagfile;
use crate::bag::Bag;
use crate::config::merge;
use crate::error::{BagError, ValidationError};

pub const DCMETA_TXT: &str = "dcmeta.txt";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub creator: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub publisher: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub language: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub identifier: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
    Missing(()),
}

/// Multi-valued fields accept a bare string and read back as a singleton.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
        OneOrMany::Missing(()) => Vec::new(),
    })
}

impl Metadata {
    /// Parses a partial or full record, e.g. from a request body.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| {
            ValidationError::new("invalid metadata").with_field("metadata", e.to_string())
        })
    }

    /// Returns a copy with `changes` merged in; multi fields are replaced.
    pub fn merged(&self, changes: &Value) -> Result<Self, ValidationError> {
        if !changes.is_object() {
            return Err(ValidationError::new("invalid metadata")
                .with_field("metadata", "changes must be an object"));
        }
        let mut current = serde_json::to_value(self).map_err(|e| {
            ValidationError::new("invalid metadata").with_field("metadata", e.to_string())
        })?;
        merge(&mut current, changes);
        Self::from_value(current)
    }

    fn tags(&self) -> Vec<(&'static str, &str)> {
        let mut tags = Vec::new();
        let single = [
            ("title", &self.title),
            ("date", &self.date),
            ("extent", &self.extent),
        ];
        let multi = [
            ("creator", &self.creator),
            ("publisher", &self.publisher),
            ("language", &self.language),
            ("identifier", &self.identifier),
        ];
        for (key, value) in single {
            if let Some(value) = value {
                tags.push((key, value.as_str()));
            }
        }
        for (key, values) in multi {
            tags.extend(values.iter().map(|v| (key, v.as_str())));
        }
        tags
    }

    pub fn to_tagfile(&self) -> String {
        tagfile::serialize_tags(self.tags())
    }

    /// Builds a record from tag lines; repeated keys collect into the
    /// multi-valued fields, unknown keys are ignored.
    pub fn from_tags(tags: &[(String, String)]) -> Self {
        let mut meta = Metadata::default();
        for (key, value) in tags {
            let value = value.clone();
            match key.as_str() {
                "title" => meta.title = Some(value),
                "date" => meta.date = Some(value),
                "extent" => meta.extent = Some(value),
                "creator" => meta.creator.push(value),
                "publisher" => meta.publisher.push(value),
                "language" => meta.language.push(value),
                "identifier" => meta.identifier.push(value),
                other => log::debug!("Ignoring unknown metadata field '{}'", other),
            }
        }
        meta
    }

    pub fn load(bag: &Bag) -> Result<Self, BagError> {
        let Some(raw) = bag.read_tagfile(DCMETA_TXT)? else {
            return Ok(Metadata::default());
        };
        let content = String::from_utf8_lossy(&raw);
        let tags = tagfile::parse_tags(&content, &bag.path().join(DCMETA_TXT))?;
        Ok(Self::from_tags(&tags))
    }

    pub fn save(&self, bag: &mut Bag) -> Result<(), BagError> {
        bag.write_tagfile(DCMETA_TXT, self.to_tagfile().as_bytes())
    }
}
