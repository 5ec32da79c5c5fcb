//! Infinite scroll: request the next page when the last rendered item comes
//! into view.
//!
//! The viewport itself is abstracted behind [`ObserverFactory`] so a front end
//! can plug in whatever visibility signal it has.

use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub struct ObserverOptions {
  /// Margin around the viewport, in CSS notation
  pub root_margin: String,
  /// Fraction of the target that must be visible
  pub threshold: f64,
}

impl Default for ObserverOptions {
  fn default() -> Self {
    Self {
      root_margin: "100px".to_string(),
      threshold: 0.1,
    }
  }
}

/// One visibility report.
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionEntry<N> {
  pub target: N,
  pub is_intersecting: bool,
}

/// Watches nodes and reports when they intersect the viewport.
pub trait ViewportObserver<N> {
  fn observe(&mut self, node: &N);
  fn disconnect(&mut self);
}

pub trait ObserverFactory {
  type Node;
  type Observer: ViewportObserver<Self::Node>;

  fn create(&self, options: &ObserverOptions) -> Self::Observer;
}

type FetchNextPage = Box<dyn FnMut() + Send>;

/// Asks for the next page when the observed last item becomes visible.
///
/// At most one observer is alive at a time. It is replaced whenever a new last
/// item is attached and disconnected when the controller is dropped.
pub struct InfiniteScroll<F: ObserverFactory> {
  factory: F,
  options: ObserverOptions,
  observer: Option<F::Observer>,
  has_next_page: bool,
  is_fetching_next_page: bool,
  fetch_next_page: FetchNextPage,
}

impl<F: ObserverFactory> InfiniteScroll<F> {
  pub fn new<C>(factory: F, fetch_next_page: C) -> Self
  where
    C: FnMut() + Send + 'static,
  {
    Self {
      factory,
      options: ObserverOptions::default(),
      observer: None,
      has_next_page: false,
      is_fetching_next_page: false,
      fetch_next_page: Box::new(fetch_next_page),
    }
  }

  pub fn with_options(mut self, options: ObserverOptions) -> Self {
    self.options = options;
    self
  }

  pub fn has_next_page(&self) -> bool {
    self.has_next_page
  }

  pub fn is_fetching_next_page(&self) -> bool {
    self.is_fetching_next_page
  }

  pub fn set_page_state(&mut self, has_next_page: bool, is_fetching_next_page: bool) {
    self.has_next_page = has_next_page;
    self.is_fetching_next_page = is_fetching_next_page;
  }

  /// Point the controller at the current last item, or at nothing.
  ///
  /// Ignored while a page is being fetched so the old observer keeps its target.
  pub fn attach_last_item(&mut self, node: Option<&F::Node>) {
    if self.is_fetching_next_page {
      trace!("fetch in progress, keeping current observer");
      return;
    }

    self.disconnect();
    let mut observer = self.factory.create(&self.options);
    if let Some(node) = node {
      observer.observe(node);
    }
    self.observer = Some(observer);
  }

  /// Handle a visibility report. Only the first entry is considered.
  pub fn on_intersection(&mut self, entries: &[IntersectionEntry<F::Node>]) {
    let Some(first) = entries.first() else {
      return;
    };

    if first.is_intersecting && self.has_next_page && !self.is_fetching_next_page {
      debug!("last item visible, fetching next page");
      (self.fetch_next_page)();
    }
  }

  fn disconnect(&mut self) {
    if let Some(mut observer) = self.observer.take() {
      observer.disconnect();
    }
  }
}

impl<F: ObserverFactory> Drop for InfiniteScroll<F> {
  fn drop(&mut self) {
    self.disconnect();
  }
}

/// Offset-based page bookkeeping for a paginated list.
///
/// A page shorter than `page_size` means the list is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTracker {
  page_size: usize,
  next_page: u32,
  has_next_page: bool,
  is_fetching: bool,
}

impl PageTracker {
  pub fn new(page_size: usize) -> Self {
    Self {
      page_size,
      next_page: 0,
      has_next_page: true,
      is_fetching: false,
    }
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn has_next_page(&self) -> bool {
    self.has_next_page
  }

  pub fn is_fetching(&self) -> bool {
    self.is_fetching
  }

  /// Claim the next page to fetch, if any and none is in flight.
  pub fn begin_fetch(&mut self) -> Option<u32> {
    if self.is_fetching || !self.has_next_page {
      return None;
    }
    self.is_fetching = true;
    Some(self.next_page)
  }

  /// Record a fetched page of `len` items.
  pub fn finish_fetch(&mut self, len: usize) {
    self.is_fetching = false;
    self.next_page += 1;
    self.has_next_page = self.page_size > 0 && len >= self.page_size;
  }

  /// Release the claim so the same page can be requested again.
  pub fn fail_fetch(&mut self) {
    self.is_fetching = false;
  }

  pub fn reset(&mut self) {
    *self = Self::new(self.page_size);
  }
}
