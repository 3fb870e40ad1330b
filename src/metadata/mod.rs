pub mod comments;
pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{FileSourceRaw, TagRaw};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub username: String,
    pub display_name: String,
}

/// One downloadable encoding of a video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSource {
    pub label: String,
    pub url: String,
    pub view: Option<String>,
    pub size: Option<u64>,
}

impl From<FileSourceRaw> for FileSource {
    fn from(raw: FileSourceRaw) -> Self {
        Self {
            label: raw.name,
            url: raw.src.download.unwrap_or_default(),
            view: raw.src.view,
            size: raw.size,
        }
    }
}

pub type Tag = TagRaw;

/// Everything known about a video after resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub id: String,
    pub title: String,
    pub author: Author,
    pub upload_time: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
    pub private: bool,
    pub external: bool,
    pub embed_url: Option<String>,
    pub liked: bool,
    pub following: bool,
    pub friend: bool,
    pub comment_text: String,
    pub file_name: String,
    pub size: u64,
    pub file_sources: Vec<FileSource>,
    pub download_quality: String,
    pub download_url: String,
    /// Set once every resolution step succeeded
    pub state: bool,
}

impl VideoDescriptor {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_lowercase(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    /// `Title[id]`, the label used in notifications
    pub fn display_name(&self) -> String {
        format!("{}[{}]", self.title, self.id)
    }

    pub fn chosen_source(&self) -> Option<&FileSource> {
        self.file_sources
            .iter()
            .find(|source| source.label == self.download_quality)
    }
}
