use serde::{Deserialize, Serialize};

/// A published photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
  pub id: String,
  pub user_id: String,
  pub title: Option<String>,
  pub caption: Option<String>,
  pub file_url: String,
  pub thumbnail_url: Option<String>,
  pub width: Option<u32>,
  pub height: Option<u32>,
  #[serde(default)]
  pub tags: Vec<String>,
  pub series_id: Option<String>,
  pub display_order: Option<i32>,
  pub created_at: String,
}

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: String,
  pub username: String,
  pub display_name: Option<String>,
  pub bio: Option<String>,
  pub equipment: Option<String>,
  pub created_at: String,
  #[serde(default)]
  pub photo_count: u64,
}

/// Follower / following totals for a profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowCounts {
  pub followers: i64,
  pub following: i64,
}

/// Ordering of search results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Recent,
  Oldest,
  /// Falls back to recency until like counts are indexed
  Popular,
}

/// Photo search parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
  pub query: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  pub date_from: Option<String>,
  pub date_to: Option<String>,
  pub user_id: Option<String>,
  #[serde(default)]
  pub sort_by: SortOrder,
}
