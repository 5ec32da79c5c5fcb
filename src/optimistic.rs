//! Optimistic likes and follows.
//!
//! The UI flips immediately; the backend call confirms or the change is
//! reverted and the user is told.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backend::types::FollowCounts;
use crate::notify::{Notifier, Toast};

/// Relationship mutations on the backend.
#[async_trait]
pub trait RelationApi: Send + Sync {
  async fn like_photo(&self, photo_id: &str, user_id: &str) -> Result<()>;

  async fn unlike_photo(&self, photo_id: &str, user_id: &str) -> Result<()>;

  async fn follow_user(&self, following_id: &str, follower_id: &str) -> Result<()>;

  async fn unfollow_user(&self, following_id: &str, follower_id: &str) -> Result<()>;

  async fn is_following(&self, following_id: &str, follower_id: &str) -> Result<bool>;

  async fn follow_counts(&self, user_id: &str) -> Result<FollowCounts>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  Pending,
  Committed,
  RolledBack,
}

/// A boolean shown optimistically while the backend confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticToggle {
  committed: bool,
  displayed: bool,
  phase: MutationPhase,
}

impl OptimisticToggle {
  pub fn new(value: bool) -> Self {
    Self {
      committed: value,
      displayed: value,
      phase: MutationPhase::Idle,
    }
  }

  /// What the UI should show.
  pub fn value(&self) -> bool {
    self.displayed
  }

  /// Last value the backend confirmed.
  pub fn committed(&self) -> bool {
    self.committed
  }

  pub fn phase(&self) -> MutationPhase {
    self.phase
  }

  pub fn is_pending(&self) -> bool {
    self.phase == MutationPhase::Pending
  }

  /// Show `target` until the mutation settles. Refused while another one is
  /// pending.
  pub fn begin(&mut self, target: bool) -> bool {
    if self.is_pending() {
      return false;
    }
    self.displayed = target;
    self.phase = MutationPhase::Pending;
    true
  }

  pub fn commit(&mut self) {
    self.committed = self.displayed;
    self.phase = MutationPhase::Committed;
  }

  pub fn rollback(&mut self) {
    self.displayed = self.committed;
    self.phase = MutationPhase::RolledBack;
  }
}

/// Liked state of photos for the signed-in user.
pub struct LikeController {
  api: Arc<dyn RelationApi>,
  notifier: Arc<dyn Notifier>,
  user_id: String,
  likes: Mutex<HashMap<String, OptimisticToggle>>,
}

impl LikeController {
  pub fn new(api: Arc<dyn RelationApi>, notifier: Arc<dyn Notifier>, user_id: impl Into<String>) -> Self {
    Self {
      api,
      notifier,
      user_id: user_id.into(),
      likes: Mutex::new(HashMap::new()),
    }
  }

  /// Record photos already liked on the backend.
  pub fn seed<I, S>(&self, liked: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut likes = self.lock();
    for photo_id in liked {
      likes.insert(photo_id.into(), OptimisticToggle::new(true));
    }
  }

  pub fn is_liked(&self, photo_id: &str) -> bool {
    self.lock().get(photo_id).map(|t| t.value()).unwrap_or(false)
  }

  pub fn phase(&self, photo_id: &str) -> MutationPhase {
    self
      .lock()
      .get(photo_id)
      .map(|t| t.phase())
      .unwrap_or(MutationPhase::Idle)
  }

  /// Like or unlike a photo. Returns the liked state once the call settled.
  pub async fn set_liked(&self, photo_id: &str, liked: bool) -> bool {
    let started = {
      let mut likes = self.lock();
      let toggle = likes
        .entry(photo_id.to_string())
        .or_insert_with(|| OptimisticToggle::new(false));
      if !toggle.is_pending() && toggle.value() == liked {
        debug!(photo_id, liked, "like already in requested state");
        return liked;
      }
      toggle.begin(liked)
    };
    if !started {
      debug!(photo_id, "like already pending");
      return self.is_liked(photo_id);
    }

    let result = if liked {
      self.api.like_photo(photo_id, &self.user_id).await
    } else {
      self.api.unlike_photo(photo_id, &self.user_id).await
    };

    let mut likes = self.lock();
    let Some(toggle) = likes.get_mut(photo_id) else {
      return false;
    };
    match result {
      Ok(()) => toggle.commit(),
      Err(e) => {
        warn!(photo_id, liked, error = %e, "failed to update like");
        toggle.rollback();
        self
          .notifier
          .notify(Toast::error("Failed to update like", "Please try again."));
      }
    }
    toggle.value()
  }

  pub async fn toggle(&self, photo_id: &str) -> bool {
    let liked = self.is_liked(photo_id);
    self.set_liked(photo_id, !liked).await
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, OptimisticToggle>> {
    self.likes.lock().unwrap_or_else(|e| e.into_inner())
  }
}

struct FollowState {
  toggle: OptimisticToggle,
  counts: FollowCounts,
}

/// Follow relation between the signed-in user and one profile, plus that
/// profile's counts.
pub struct FollowController {
  api: Arc<dyn RelationApi>,
  notifier: Arc<dyn Notifier>,
  viewer_id: String,
  target_id: String,
  state: Mutex<FollowState>,
}

impl FollowController {
  pub fn new(
    api: Arc<dyn RelationApi>,
    notifier: Arc<dyn Notifier>,
    viewer_id: impl Into<String>,
    target_id: impl Into<String>,
    is_following: bool,
    counts: FollowCounts,
  ) -> Self {
    Self {
      api,
      notifier,
      viewer_id: viewer_id.into(),
      target_id: target_id.into(),
      state: Mutex::new(FollowState {
        toggle: OptimisticToggle::new(is_following),
        counts,
      }),
    }
  }

  /// Build from the backend's current relation and counts.
  pub async fn load(
    api: Arc<dyn RelationApi>,
    notifier: Arc<dyn Notifier>,
    viewer_id: &str,
    target_id: &str,
  ) -> Result<Self> {
    let is_following = if viewer_id == target_id {
      false
    } else {
      api.is_following(target_id, viewer_id).await?
    };
    let counts = api.follow_counts(target_id).await?;
    Ok(Self::new(api, notifier, viewer_id, target_id, is_following, counts))
  }

  pub fn is_own_profile(&self) -> bool {
    self.viewer_id == self.target_id
  }

  pub fn is_following(&self) -> bool {
    self.lock().toggle.value()
  }

  pub fn counts(&self) -> FollowCounts {
    self.lock().counts
  }

  pub fn phase(&self) -> MutationPhase {
    self.lock().toggle.phase()
  }

  /// Follow or unfollow. Returns the resulting relation.
  pub async fn toggle(&self) -> bool {
    if self.is_own_profile() {
      debug!(user_id = %self.viewer_id, "ignoring self-follow");
      return false;
    }

    let (was_following, follow) = {
      let mut state = self.lock();
      let was_following = state.toggle.value();
      if !state.toggle.begin(!was_following) {
        debug!(target_id = %self.target_id, "follow already pending");
        return was_following;
      }
      state.counts.followers = adjust(state.counts.followers, !was_following);
      (was_following, !was_following)
    };

    let result = if follow {
      self.api.follow_user(&self.target_id, &self.viewer_id).await
    } else {
      self.api.unfollow_user(&self.target_id, &self.viewer_id).await
    };

    let confirmed = {
      let mut state = self.lock();
      match result {
        Ok(()) => {
          state.toggle.commit();
          let message = if follow {
            "Following user"
          } else {
            "Unfollowed successfully"
          };
          self.notifier.notify(Toast::success(message));
          true
        }
        Err(e) => {
          warn!(target_id = %self.target_id, follow, error = %e, "follow action failed");
          state.toggle.rollback();
          state.counts.followers = adjust(state.counts.followers, was_following);
          let message = if was_following {
            "Failed to unfollow user"
          } else {
            "Failed to follow user"
          };
          self.notifier.notify(Toast::error("Action failed", message));
          false
        }
      }
    };

    if confirmed {
      self.sync_counts().await;
    }
    self.is_following()
  }

  /// Replace the optimistic counts with the backend's. Failures are only logged.
  pub async fn sync_counts(&self) {
    match self.api.follow_counts(&self.target_id).await {
      Ok(counts) => self.lock().counts = counts,
      Err(e) => warn!(target_id = %self.target_id, error = %e, "failed to refresh follow counts"),
    }
  }

  fn lock(&self) -> MutexGuard<'_, FollowState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn adjust(followers: i64, up: bool) -> i64 {
  if up {
    followers + 1
  } else {
    (followers - 1).max(0)
  }
}
