use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use stillnest::backend::types::{Photo, SearchFilters, SortOrder};
use stillnest::backend::{BackendClient, CachedClient};
use stillnest::cache::{
  CacheKey, CacheRegistry, CacheSweeper, KeyValueStore, NoopStore, SnapshotStore, SqliteStore,
};
use stillnest::clock::{self, SharedClock};
use stillnest::config::Config;
use stillnest::connectivity::{link_channel, ConnectivityMonitor, HttpProbe, LinkEvent};
use stillnest::loader::{DataLoader, LoaderOptions, LoaderState};
use stillnest::logging;
use stillnest::notify::LogNotifier;
use stillnest::optimistic::{FollowController, LikeController, RelationApi};
use stillnest::retry::{RetryOptions, Retryable};
use stillnest::scroll::PageTracker;

#[derive(Parser, Debug)]
#[command(name = "stillnest")]
#[command(about = "Offline-aware client for the stillnest photo-sharing backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stillnest/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the network link as down and serve cached data only
  #[arg(long)]
  offline: bool,

  /// Do not read or write the local cache database
  #[arg(long)]
  no_cache: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show a photo
  Photo {
    id: String,
    /// Skip a fresh cached copy
    #[arg(long)]
    refresh: bool,
  },

  /// Show a user profile
  User {
    id: String,
    #[arg(long)]
    refresh: bool,
  },

  /// Photos from the users you follow
  Feed {
    /// Your user id
    #[arg(long = "as")]
    viewer: String,
    /// Number of pages to load
    #[arg(long, default_value_t = 1)]
    pages: u32,
  },

  /// Search photos
  Search {
    #[arg(short, long)]
    query: Option<String>,
    #[arg(short = 't', long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    /// recent, oldest or popular
    #[arg(long, default_value = "recent")]
    sort: String,
    #[arg(long, default_value_t = 0)]
    page: u32,
  },

  /// Like or unlike a photo
  Like {
    photo: String,
    #[arg(long = "as")]
    viewer: String,
    /// Remove the like instead
    #[arg(long)]
    undo: bool,
  },

  /// Follow or unfollow a user
  Follow {
    target: String,
    #[arg(long = "as")]
    viewer: String,
  },

  /// Show connectivity
  Status,

  /// Inspect or clear local caches
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Entry counts per cache
  Stats,
  /// Remove every cached entry
  Clear,
}

/// Everything a command needs, wired from config.
struct Services {
  config: Config,
  clock: SharedClock,
  snapshots: SnapshotStore,
  registry: CacheRegistry,
  client: CachedClient,
  monitor: Arc<ConnectivityMonitor>,
}

impl Services {
  async fn start(config: Config, offline: bool, no_cache: bool) -> Result<Self> {
    let clock = clock::system();
    let store: Arc<dyn KeyValueStore> = if no_cache {
      Arc::new(NoopStore)
    } else {
      Arc::new(SqliteStore::open()?)
    };
    let snapshots = SnapshotStore::new(store.clone());
    let registry = CacheRegistry::new(config.caches.policies(), store, clock.clone());

    let backend = BackendClient::from_config(&config)?;
    let client = CachedClient::new(backend, registry.clone());

    let probe = HttpProbe::new(config.probe_url()?, config.connectivity.probe_timeout());
    let monitor = Arc::new(ConnectivityMonitor::new(
      Arc::new(probe),
      clock.clone(),
      config.connectivity.check_interval(),
    ));
    if offline {
      monitor.initialize(false).await;
    } else {
      // Verify reachability before the first load
      monitor.handle_link_event(LinkEvent::Up).await;
    }

    Ok(Self {
      config,
      clock,
      snapshots,
      registry,
      client,
      monitor,
    })
  }

  fn loader<T, F, Fut>(&self, key: String, fetcher: F) -> DataLoader<T>
  where
    T: Clone + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
  {
    DataLoader::new(
      LoaderOptions::new(key).with_ttl(self.config.loader_ttl()),
      fetcher,
      self.snapshots.clone(),
      self.monitor.subscribe(),
      self.clock.clone(),
    )
  }
}

#[derive(Serialize)]
struct Loaded<'a, T> {
  source: &'static str,
  stale: bool,
  error: Option<String>,
  data: &'a T,
}

fn print_loaded<T: Serialize>(state: &LoaderState<T>) -> Result<()> {
  let Some(data) = &state.data else {
    let error = state
      .error
      .as_ref()
      .map(|e| e.to_string())
      .unwrap_or_else(|| "no data".to_string());
    return Err(eyre!("{}", error));
  };

  let source = if state.is_from_network() {
    "network"
  } else if state.is_from_fallback() {
    "fallback"
  } else {
    "cache"
  };
  let out = Loaded {
    source,
    stale: state.is_stale,
    error: state.error.as_ref().map(|e| e.to_string()),
    data,
  };
  println!("{}", serde_json::to_string_pretty(&out)?);
  Ok(())
}

fn parse_sort(sort: &str) -> Result<SortOrder> {
  match sort {
    "recent" => Ok(SortOrder::Recent),
    "oldest" => Ok(SortOrder::Oldest),
    "popular" => Ok(SortOrder::Popular),
    other => Err(eyre!("Unknown sort order {}: expected recent, oldest or popular", other)),
  }
}

/// One feed page from the backend, retried with the configured policy.
async fn fetch_feed_page(
  client: CachedClient,
  viewer: String,
  page: u32,
  options: RetryOptions,
) -> Result<Vec<Photo>> {
  let mut fetch = Retryable::new(move || {
    let client = client.clone();
    let viewer = viewer.clone();
    async move { client.fetch_feed(&viewer, page).await }
  })
  .with_options(options);

  let mut result = fetch.execute().await.map(Some);
  while result.is_err() && fetch.can_retry() {
    warn!(page, attempt = fetch.retry_count() + 1, "retrying feed page");
    result = fetch.retry().await;
  }
  result?.ok_or_else(|| eyre!("Gave up on feed page {} after {} retries", page, fetch.retry_count()))
}

async fn run(services: &Services, command: Command) -> Result<()> {
  match command {
    Command::Photo { id, refresh } => {
      let client = services.client.clone();
      let key = CacheKey::Photo { id: id.clone() }.to_string();
      let loader = services.loader(key, move || {
        let client = client.clone();
        let id = id.clone();
        async move {
          client
            .fetch_photo(&id)
            .await?
            .ok_or_else(|| eyre!("Photo {} not found", id))
        }
      });
      let _ = loader.load(refresh).await;
      print_loaded(&loader.state())
    }

    Command::User { id, refresh } => {
      let client = services.client.clone();
      let key = CacheKey::User { id: id.clone() }.to_string();
      let loader = services.loader(key, move || {
        let client = client.clone();
        let id = id.clone();
        async move {
          client
            .fetch_user(&id)
            .await?
            .ok_or_else(|| eyre!("User {} not found", id))
        }
      });
      let _ = loader.load(refresh).await;
      print_loaded(&loader.state())
    }

    Command::Feed { viewer, pages } => {
      let mut tracker = PageTracker::new(services.client.inner().page_size());
      let mut photos = Vec::new();
      let mut stale = false;

      while let Some(page) = tracker.begin_fetch() {
        if page >= pages {
          break;
        }
        let key = CacheKey::Feed {
          user_id: viewer.clone(),
          page,
        }
        .to_string();
        let client = services.client.clone();
        let viewer = viewer.clone();
        let retry = services.config.retry;
        let loader = services.loader(key, move || {
          let client = client.clone();
          let viewer = viewer.clone();
          async move { fetch_feed_page(client, viewer, page, retry).await }
        });

        match loader.load(false).await {
          Ok(batch) => {
            let state = loader.state();
            if state.is_stale {
              warn!(page, source = ?state.source, "serving stale feed page");
            }
            stale |= state.is_stale;
            tracker.finish_fetch(batch.len());
            photos.extend(batch);
          }
          Err(e) => {
            tracker.fail_fetch();
            return Err(eyre!("Failed to load feed page {}: {}", page, e));
          }
        }
      }

      info!(count = photos.len(), has_more = tracker.has_next_page(), "feed loaded");
      println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
          "stale": stale,
          "has_more": tracker.has_next_page(),
          "photos": photos,
        }))?
      );
      Ok(())
    }

    Command::Search {
      query,
      tags,
      user,
      from,
      to,
      sort,
      page,
    } => {
      let filters = SearchFilters {
        query,
        tags,
        date_from: from,
        date_to: to,
        user_id: user,
        sort_by: parse_sort(&sort)?,
      };
      let key = CacheKey::Search {
        filters: filters.clone(),
        page,
      }
      .to_string();
      let client = services.client.clone();
      let loader = services.loader(key, move || {
        let client = client.clone();
        let filters = filters.clone();
        async move { client.fetch_search(&filters, page).await }
      });
      let _ = loader.load(false).await;
      print_loaded(&loader.state())
    }

    Command::Like {
      photo,
      viewer,
      undo,
    } => {
      let backend = services.client.inner().clone();
      let liked = backend.get_user_likes(&viewer).await?;
      let likes = LikeController::new(Arc::new(backend), Arc::new(LogNotifier), viewer);
      likes.seed(liked);

      let liked = likes.set_liked(&photo, !undo).await;
      println!("{}", serde_json::json!({ "photo": photo, "liked": liked }));
      Ok(())
    }

    Command::Follow { target, viewer } => {
      let api: Arc<dyn RelationApi> = Arc::new(services.client.inner().clone());
      let follow = FollowController::load(api, Arc::new(LogNotifier), &viewer, &target).await?;
      if follow.is_own_profile() {
        return Err(eyre!("Cannot follow yourself"));
      }

      let following = follow.toggle().await;
      println!(
        "{}",
        serde_json::json!({
          "user": target,
          "following": following,
          "counts": follow.counts(),
        })
      );
      Ok(())
    }

    Command::Status => {
      let state = services.monitor.refresh_connectivity().await;
      println!(
        "{}",
        serde_json::json!({
          "online": state.is_online,
          "degraded": state.is_degraded,
          "was_offline": state.was_offline,
          "last_online_at": state.last_online_at,
          "downtime": state.downtime_formatted(),
        })
      );
      Ok(())
    }

    Command::Cache { action } => match action {
      CacheAction::Stats => {
        println!("{}", serde_json::to_string_pretty(&services.registry.stats())?);
        Ok(())
      }
      CacheAction::Clear => {
        services.registry.clear_all();
        info!("caches cleared");
        println!("Caches cleared");
        Ok(())
      }
    },
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let services = Services::start(config, args.offline, args.no_cache).await?;

  let sweeper = Arc::new(CacheSweeper::new(
    services.config.sweep_interval(),
    services.registry.sweepers(),
  ));
  let sweeper_task = sweeper.clone().spawn();

  // No platform link source in the CLI; the sender is held so the monitor
  // keeps its periodic checks running
  let (_link_tx, link_events) = link_channel();
  let monitor_task = services.monitor.clone().spawn(link_events);

  let result = run(&services, args.command).await;

  sweeper.shutdown();
  services.monitor.shutdown();
  let _ = tokio::join!(sweeper_task, monitor_task);

  result
}
