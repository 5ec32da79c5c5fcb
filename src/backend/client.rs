use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use super::filter::{Filter, QueryBuilder};
use super::types::{FollowCounts, Photo, SearchFilters, SortOrder, UserProfile};
use crate::config::Config;
use crate::optimistic::RelationApi;

/// Columns joined onto photo listings
const PHOTO_WITH_AUTHOR: &str = "*,users!photos_user_id_fkey(username,display_name)";

/// Backend REST API client
#[derive(Clone)]
pub struct BackendClient {
  http: reqwest::Client,
  rest_url: Url,
  page_size: usize,
}

impl BackendClient {
  pub fn new(base_url: &Url, api_key: &str, page_size: usize) -> Result<Self> {
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }
    let rest_url = base
      .join("rest/v1/")
      .map_err(|e| eyre!("Invalid backend url {}: {}", base_url, e))?;

    let mut headers = HeaderMap::new();
    let key = HeaderValue::from_str(api_key).map_err(|e| eyre!("Invalid API key: {}", e))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| eyre!("Invalid API key: {}", e))?;
    headers.insert("apikey", key);
    headers.insert(AUTHORIZATION, bearer);

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      rest_url,
      page_size,
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::new(&config.backend_url()?, &api_key, config.backend.page_size)
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  fn request(&self, method: Method, table: &str) -> Result<RequestBuilder> {
    let url = self
      .rest_url
      .join(table)
      .map_err(|e| eyre!("Invalid table name {}: {}", table, e))?;
    Ok(self.http.request(method, url))
  }

  fn page(&self, query: QueryBuilder, page: u32) -> QueryBuilder {
    let from = page as usize * self.page_size;
    query.range(from, from + self.page_size.saturating_sub(1))
  }

  async fn select<T: DeserializeOwned>(&self, table: &str, query: &QueryBuilder) -> Result<Vec<T>> {
    let response = self
      .request(Method::GET, table)?
      .query(&query.to_params())
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", table, e))?;

    let rows = check(response, table)
      .await?
      .json::<Vec<T>>()
      .await
      .map_err(|e| eyre!("Failed to parse {} rows: {}", table, e))?;

    debug!(table, rows = rows.len(), "select");
    Ok(rows)
  }

  /// Exact row count without transferring rows.
  async fn count(&self, table: &str, query: &QueryBuilder) -> Result<i64> {
    let response = self
      .request(Method::HEAD, table)?
      .query(&query.to_params())
      .header("Prefer", "count=exact")
      .send()
      .await
      .map_err(|e| eyre!("Failed to count {}: {}", table, e))?;

    let response = check(response, table).await?;
    let range = response
      .headers()
      .get(CONTENT_RANGE)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| eyre!("Missing Content-Range in {} count", table))?;

    parse_total(range).ok_or_else(|| eyre!("Unexpected Content-Range in {} count: {}", table, range))
  }

  async fn insert(&self, table: &str, row: serde_json::Value) -> Result<()> {
    let response = self
      .request(Method::POST, table)?
      .json(&row)
      .send()
      .await
      .map_err(|e| eyre!("Failed to insert into {}: {}", table, e))?;
    check(response, table).await?;
    Ok(())
  }

  async fn delete(&self, table: &str, query: &QueryBuilder) -> Result<()> {
    let response = self
      .request(Method::DELETE, table)?
      .query(&query.to_params())
      .send()
      .await
      .map_err(|e| eyre!("Failed to delete from {}: {}", table, e))?;
    check(response, table).await?;
    Ok(())
  }

  /// Get a single photo by id
  #[instrument(skip(self))]
  pub async fn get_photo(&self, id: &str) -> Result<Option<Photo>> {
    let query = QueryBuilder::new().select("*").eq("id", id).limit(1);
    Ok(self.select("photos", &query).await?.into_iter().next())
  }

  /// Get a user profile by id
  #[instrument(skip(self))]
  pub async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
    let query = QueryBuilder::new().select("*").eq("id", id).limit(1);
    Ok(self.select("users", &query).await?.into_iter().next())
  }

  /// Photos from everyone `user_id` follows, newest first
  #[instrument(skip(self))]
  pub async fn get_feed(&self, user_id: &str, page: u32) -> Result<Vec<Photo>> {
    #[derive(Deserialize)]
    struct Following {
      following_id: String,
    }

    let query = QueryBuilder::new()
      .select("following_id")
      .eq("follower_id", user_id);
    let following: Vec<Following> = self.select("follows", &query).await?;
    if following.is_empty() {
      return Ok(Vec::new());
    }

    let ids = following.into_iter().map(|f| f.following_id).collect();
    let query = QueryBuilder::new()
      .select(PHOTO_WITH_AUTHOR)
      .filter(Filter::In("user_id".to_string(), ids))
      .order("created_at", false);
    self.select("photos", &self.page(query, page)).await
  }

  /// A profile gallery, newest first
  #[instrument(skip(self))]
  pub async fn get_user_photos(&self, user_id: &str, page: u32) -> Result<Vec<Photo>> {
    let query = QueryBuilder::new()
      .select("*")
      .eq("user_id", user_id)
      .order("created_at", false);
    self.select("photos", &self.page(query, page)).await
  }

  #[instrument(skip(self))]
  pub async fn search_photos(&self, filters: &SearchFilters, page: u32) -> Result<Vec<Photo>> {
    let query = self.page(search_query(filters), page);
    self.select("photos", &query).await
  }

  /// Ids of the photos `user_id` has liked
  pub async fn get_user_likes(&self, user_id: &str) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct Like {
      photo_id: String,
    }

    let query = QueryBuilder::new().select("photo_id").eq("user_id", user_id);
    let likes: Vec<Like> = self.select("likes", &query).await?;
    Ok(likes.into_iter().map(|l| l.photo_id).collect())
  }
}

fn search_query(filters: &SearchFilters) -> QueryBuilder {
  let mut query = QueryBuilder::new().select(PHOTO_WITH_AUTHOR);

  if let Some(text) = filters.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
    query = query.filter(Filter::Or(vec![
      Filter::contains("title", text),
      Filter::contains("caption", text),
    ]));
  }
  if !filters.tags.is_empty() {
    query = query.filter(Filter::Overlaps("tags".to_string(), filters.tags.clone()));
  }
  if let Some(user_id) = &filters.user_id {
    query = query.eq("user_id", user_id.clone());
  }
  if let Some(from) = &filters.date_from {
    query = query.filter(Filter::Gte("created_at".to_string(), from.clone()));
  }
  if let Some(to) = &filters.date_to {
    query = query.filter(Filter::Lte("created_at".to_string(), to.clone()));
  }

  // Popular has no like-count index yet and sorts by recency
  let ascending = filters.sort_by == SortOrder::Oldest;
  query.order("created_at", ascending)
}

async fn check(response: Response, table: &str) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(eyre!("Backend returned {} for {}: {}", status, table, body))
}

/// Total from a `Content-Range` value such as `0-24/3573` or `*/0`.
fn parse_total(range: &str) -> Option<i64> {
  range.rsplit('/').next()?.parse().ok()
}

#[async_trait]
impl RelationApi for BackendClient {
  async fn like_photo(&self, photo_id: &str, user_id: &str) -> Result<()> {
    self
      .insert("likes", json!({ "photo_id": photo_id, "user_id": user_id }))
      .await
  }

  async fn unlike_photo(&self, photo_id: &str, user_id: &str) -> Result<()> {
    let query = QueryBuilder::new()
      .eq("photo_id", photo_id)
      .eq("user_id", user_id);
    self.delete("likes", &query).await
  }

  async fn follow_user(&self, following_id: &str, follower_id: &str) -> Result<()> {
    self
      .insert(
        "follows",
        json!({ "follower_id": follower_id, "following_id": following_id }),
      )
      .await
  }

  async fn unfollow_user(&self, following_id: &str, follower_id: &str) -> Result<()> {
    let query = QueryBuilder::new()
      .eq("follower_id", follower_id)
      .eq("following_id", following_id);
    self.delete("follows", &query).await
  }

  async fn is_following(&self, following_id: &str, follower_id: &str) -> Result<bool> {
    let query = QueryBuilder::new()
      .select("id")
      .eq("follower_id", follower_id)
      .eq("following_id", following_id)
      .limit(1);
    let rows: Vec<serde_json::Value> = self.select("follows", &query).await?;
    Ok(!rows.is_empty())
  }

  async fn follow_counts(&self, user_id: &str) -> Result<FollowCounts> {
    let followers = QueryBuilder::new().eq("following_id", user_id);
    let following = QueryBuilder::new().eq("follower_id", user_id);
    let (followers, following) = tokio::try_join!(
      self.count("follows", &followers),
      self.count("follows", &following)
    )?;
    Ok(FollowCounts {
      followers,
      following,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn photo_json(id: &str) -> serde_json::Value {
    json!({
      "id": id,
      "user_id": "u1",
      "title": "Dunes",
      "caption": null,
      "file_url": "https://cdn.example.com/dunes.jpg",
      "thumbnail_url": null,
      "width": 1200,
      "height": 800,
      "tags": ["desert"],
      "series_id": null,
      "display_order": null,
      "created_at": "2024-05-01T10:00:00Z"
    })
  }

  async fn client_for(server: &MockServer) -> BackendClient {
    let url = Url::parse(&server.uri()).unwrap();
    BackendClient::new(&url, "anon-key", 20).unwrap()
  }

  #[tokio::test]
  async fn test_client_from_config() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/users"))
      .and(header("apikey", "env-key"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
      .expect(1)
      .mount(&server)
      .await;

    std::env::set_var("STILLNEST_API_KEY", "env-key");
    let config: Config =
      serde_yaml::from_str(&format!("backend:\n  url: {}\n  page_size: 5\n", server.uri())).unwrap();
    let client = BackendClient::from_config(&config).unwrap();

    assert_eq!(client.page_size(), 5);
    assert!(client.get_user("u1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_get_photo_sends_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/photos"))
      .and(header("apikey", "anon-key"))
      .and(header("authorization", "Bearer anon-key"))
      .and(query_param("id", "eq.p1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([photo_json("p1")])))
      .mount(&server)
      .await;

    let photo = client_for(&server).await.get_photo("p1").await.unwrap();
    assert_eq!(photo.unwrap().tags, vec!["desert".to_string()]);
  }

  #[tokio::test]
  async fn test_get_photo_missing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/photos"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
      .mount(&server)
      .await;

    assert!(client_for(&server).await.get_photo("nope").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/users"))
      .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
      .mount(&server)
      .await;

    let err = client_for(&server).await.get_user("u1").await.unwrap_err();
    assert!(err.to_string().contains("500"));
  }

  #[tokio::test]
  async fn test_feed_pages_followed_users() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/follows"))
      .and(query_param("follower_id", "eq.me"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!([{ "following_id": "a" }, { "following_id": "b" }])),
      )
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/photos"))
      .and(query_param("user_id", "in.(a,b)"))
      .and(query_param("order", "created_at.desc"))
      .and(query_param("offset", "20"))
      .and(query_param("limit", "20"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([photo_json("p9")])))
      .mount(&server)
      .await;

    let photos = client_for(&server).await.get_feed("me", 1).await.unwrap();
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].id, "p9");
  }

  #[tokio::test]
  async fn test_feed_empty_without_follows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/follows"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
      .mount(&server)
      .await;

    let photos = client_for(&server).await.get_feed("me", 0).await.unwrap();
    assert!(photos.is_empty());
    // Only the follows lookup went out
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_search_query_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/rest/v1/photos"))
      .and(query_param("or", "(title.ilike.*fog*,caption.ilike.*fog*)"))
      .and(query_param("tags", "ov.{coast}"))
      .and(query_param("order", "created_at.asc"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
      .mount(&server)
      .await;

    let filters = SearchFilters {
      query: Some("  fog ".to_string()),
      tags: vec!["coast".to_string()],
      sort_by: SortOrder::Oldest,
      ..Default::default()
    };
    let photos = client_for(&server)
      .await
      .search_photos(&filters, 0)
      .await
      .unwrap();
    assert!(photos.is_empty());
  }

  #[tokio::test]
  async fn test_like_and_unlike() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rest/v1/likes"))
      .and(body_json(json!({ "photo_id": "p1", "user_id": "u1" })))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/rest/v1/likes"))
      .and(query_param("photo_id", "eq.p1"))
      .and(query_param("user_id", "eq.u1"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let client = client_for(&server).await;
    client.like_photo("p1", "u1").await.unwrap();
    client.unlike_photo("p1", "u1").await.unwrap();
  }

  #[tokio::test]
  async fn test_follow_conflict_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rest/v1/follows"))
      .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
      .mount(&server)
      .await;

    let client = client_for(&server).await;
    assert!(client.follow_user("alice", "me").await.is_err());
  }

  #[tokio::test]
  async fn test_follow_counts_from_content_range() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .and(path("/rest/v1/follows"))
      .and(query_param("following_id", "eq.alice"))
      .and(header("prefer", "count=exact"))
      .respond_with(ResponseTemplate::new(200).insert_header("content-range", "*/12"))
      .mount(&server)
      .await;
    Mock::given(method("HEAD"))
      .and(path("/rest/v1/follows"))
      .and(query_param("follower_id", "eq.alice"))
      .respond_with(ResponseTemplate::new(200).insert_header("content-range", "0-2/3"))
      .mount(&server)
      .await;

    let counts = client_for(&server)
      .await
      .follow_counts("alice")
      .await
      .unwrap();
    assert_eq!(
      counts,
      FollowCounts {
        followers: 12,
        following: 3
      }
    );
  }

  #[test]
  fn test_parse_total() {
    assert_eq!(parse_total("0-24/3573"), Some(3573));
    assert_eq!(parse_total("*/0"), Some(0));
    assert_eq!(parse_total("0-24/*"), None);
  }
}
