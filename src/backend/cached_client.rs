//! Backend client with transparent caching.

use color_eyre::Result;
use tracing::debug;

use super::client::BackendClient;
use super::types::{Photo, SearchFilters, UserProfile};
use crate::cache::{CacheKey, CacheRegistry};

/// Backend client backed by the cache registry.
///
/// This wraps the underlying `BackendClient` with the same read API, serving
/// valid cache entries first and caching every successful fetch.
#[derive(Clone)]
pub struct CachedClient {
  inner: BackendClient,
  registry: CacheRegistry,
}

impl CachedClient {
  pub fn new(inner: BackendClient, registry: CacheRegistry) -> Self {
    Self { inner, registry }
  }

  pub fn inner(&self) -> &BackendClient {
    &self.inner
  }

  pub fn registry(&self) -> &CacheRegistry {
    &self.registry
  }

  /// Get a single photo by id with caching. Missing photos are not cached.
  pub async fn get_photo(&self, id: &str) -> Result<Option<Photo>> {
    let key = CacheKey::Photo { id: id.to_string() }.to_string();
    if let Some(photo) = self.registry.photos.get(&key) {
      debug!(%key, "cache hit");
      return Ok(Some(photo));
    }
    self.fetch_photo(id).await
  }

  /// Fetch a photo from the backend, skipping the cache but updating it.
  pub async fn fetch_photo(&self, id: &str) -> Result<Option<Photo>> {
    let photo = self.inner.get_photo(id).await?;
    if let Some(photo) = &photo {
      let key = CacheKey::Photo { id: id.to_string() }.to_string();
      self.registry.photos.set(&key, photo.clone(), None);
    }
    Ok(photo)
  }

  /// Get a user profile by id with caching.
  pub async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
    let key = CacheKey::User { id: id.to_string() }.to_string();
    if let Some(user) = self.registry.users.get(&key) {
      debug!(%key, "cache hit");
      return Ok(Some(user));
    }
    self.fetch_user(id).await
  }

  /// Fetch a user profile from the backend, skipping the cache but updating it.
  pub async fn fetch_user(&self, id: &str) -> Result<Option<UserProfile>> {
    let user = self.inner.get_user(id).await?;
    if let Some(user) = &user {
      let key = CacheKey::User { id: id.to_string() }.to_string();
      self.registry.users.set(&key, user.clone(), None);
    }
    Ok(user)
  }

  /// One page of the following feed with caching.
  pub async fn get_feed(&self, user_id: &str, page: u32) -> Result<Vec<Photo>> {
    let key = CacheKey::Feed {
      user_id: user_id.to_string(),
      page,
    };
    match self.cached_page(&key) {
      Some(photos) => Ok(photos),
      None => self.fetch_feed(user_id, page).await,
    }
  }

  pub async fn fetch_feed(&self, user_id: &str, page: u32) -> Result<Vec<Photo>> {
    let photos = self.inner.get_feed(user_id, page).await?;
    let key = CacheKey::Feed {
      user_id: user_id.to_string(),
      page,
    };
    Ok(self.store_page(&key, photos))
  }

  /// One page of a profile gallery with caching.
  pub async fn get_user_photos(&self, user_id: &str, page: u32) -> Result<Vec<Photo>> {
    let key = CacheKey::UserPhotos {
      user_id: user_id.to_string(),
      page,
    };
    if let Some(photos) = self.cached_page(&key) {
      return Ok(photos);
    }
    let photos = self.inner.get_user_photos(user_id, page).await?;
    Ok(self.store_page(&key, photos))
  }

  /// One page of search results with caching.
  pub async fn search_photos(&self, filters: &SearchFilters, page: u32) -> Result<Vec<Photo>> {
    let key = CacheKey::Search {
      filters: filters.clone(),
      page,
    };
    match self.cached_page(&key) {
      Some(photos) => Ok(photos),
      None => self.fetch_search(filters, page).await,
    }
  }

  pub async fn fetch_search(&self, filters: &SearchFilters, page: u32) -> Result<Vec<Photo>> {
    let photos = self.inner.search_photos(filters, page).await?;
    let key = CacheKey::Search {
      filters: filters.clone(),
      page,
    };
    Ok(self.store_page(&key, photos))
  }

  fn cached_page(&self, key: &CacheKey) -> Option<Vec<Photo>> {
    let key = key.to_string();
    let photos = self.registry.feed.get(&key)?;
    debug!(%key, count = photos.len(), "cache hit");
    Some(photos)
  }

  /// Cache a fetched page. Its photos are also cached individually so opening
  /// one needs no request.
  fn store_page(&self, key: &CacheKey, photos: Vec<Photo>) -> Vec<Photo> {
    for photo in &photos {
      let photo_key = CacheKey::Photo {
        id: photo.id.clone(),
      }
      .to_string();
      self.registry.photos.set(&photo_key, photo.clone(), None);
    }
    self.registry.feed.set(&key.to_string(), photos.clone(), None);
    photos
  }
}
