// Raw payloads of the Iwara REST API. Only the fields the resolver reads are modelled.
pub mod client;
pub mod token;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoApiRaw {
    pub id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub embed_url: Option<String>,
    pub file_url: Option<String>,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub private: bool,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub tags: Vec<TagRaw>,
    pub user: Option<UserRaw>,
    pub file: Option<FileRaw>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRaw {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub following: bool,
    #[serde(default)]
    pub friend: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRaw {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRaw {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSourceRaw {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub src: FileSourceSrcRaw,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSourceSrcRaw {
    pub view: Option<String>,
    pub download: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPageRaw {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub results: Vec<CommentRaw>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRaw {
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub num_replies: u64,
}
