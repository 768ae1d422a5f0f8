use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use fleetcache::cache::{
  CacheManager, CollectionName, MutationCoordinator, MutationReceipt, NoopStorage, SelectiveDiff,
  SnapshotStorage, SqliteStorage,
};
use fleetcache::config::Config;
use fleetcache::error::UnknownCollection;
use fleetcache::fleet::{FleetClient, NewTrip};
use fleetcache::logging;
use fleetcache::notify::ChannelNotifier;
use fleetcache::permissions::{AllowAll, PermissionOracle, RolePermissions};
use fleetcache::remote::{RemoteStore, RestStore};
use fleetcache::RecordId;

#[derive(Parser, Debug)]
#[command(name = "fleetcache")]
#[command(about = "Cached, optimistic access to a fleet management backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fleetcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List vans
  Vans,
  /// List trips
  Trips,
  /// List users
  Users,
  /// List companies
  Companies,
  /// Create, complete or delete a trip
  Trip {
    #[command(subcommand)]
    action: TripCommand,
  },
  /// Refetch collections now and merge the changes
  Refresh {
    #[arg(required = true, value_parser = parse_collection)]
    collections: Vec<CollectionName>,
  },
  /// Drop cached copies and refetch from scratch
  FullRefresh {
    #[arg(required = true, value_parser = parse_collection)]
    collections: Vec<CollectionName>,
  },
  /// Mark collections stale
  Invalidate {
    #[arg(required = true, value_parser = parse_collection)]
    collections: Vec<CollectionName>,
  },
  /// Show cache statistics
  Stats,
}

#[derive(Subcommand, Debug)]
enum TripCommand {
  Create {
    /// Van the trip runs on
    #[arg(long)]
    van: String,
    #[arg(long)]
    driver: Option<String>,
    #[arg(long)]
    start_km: Option<f64>,
    #[arg(long)]
    destination: Option<String>,
  },
  Complete {
    id: String,
    #[arg(long)]
    end_km: f64,
  },
  Delete {
    id: String,
  },
}

fn parse_collection(s: &str) -> std::result::Result<CollectionName, UnknownCollection> {
  s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging);

  let cache = build_cache(&config)?;
  let permissions = load_permissions(&cache, &config).await?;
  let (notifier, mut notifications) = ChannelNotifier::new();
  let coordinator = MutationCoordinator::new(cache, permissions, Arc::new(notifier));
  let fleet = FleetClient::new(coordinator);

  let result = run(&fleet, args.command).await;

  while let Ok(notification) = notifications.try_recv() {
    eprintln!("[{}] {}", notification.kind, notification.message);
  }
  result
}

fn build_cache(config: &Config) -> Result<CacheManager> {
  let api_key = Config::get_api_key()?;
  let remote: Arc<dyn RemoteStore> = Arc::new(RestStore::new(&config.remote.url, api_key)?);

  let storage: Arc<dyn SnapshotStorage> = if config.cache.persist {
    Arc::new(SqliteStorage::open(config.cache.path.as_deref())?)
  } else {
    Arc::new(NoopStorage)
  };

  let mut builder = CacheManager::builder(remote)
    .policy(config.staleness_policy()?)
    .diff(SelectiveDiff::new(config.cache.timestamp_comparison))
    .storage(storage);
  for (name, filters) in config.scope_filters() {
    builder = builder.filters(name, filters);
  }
  Ok(builder.build())
}

async fn load_permissions(
  cache: &CacheManager,
  config: &Config,
) -> Result<Arc<dyn PermissionOracle>> {
  let Some(group_id) = &config.access.group_id else {
    return Ok(Arc::new(AllowAll));
  };

  let groups = cache.get(CollectionName::UserGroups).await?;
  let group = groups
    .get(&RecordId::from(group_id.as_str()))
    .ok_or_else(|| eyre!("User group {} not found", group_id))?;
  let permissions = RolePermissions::from_group_record(group)?;
  tracing::info!(group = %group_id, grants = permissions.len(), "loaded permissions");
  Ok(Arc::new(permissions))
}

async fn run(fleet: &FleetClient, command: Command) -> Result<()> {
  let cache = fleet.cache();

  match command {
    Command::Vans => {
      for van in fleet.vans().await? {
        println!(
          "{}\t{}\t{}",
          van.id,
          van.plate_number.as_deref().unwrap_or("-"),
          van.status.as_str()
        );
      }
    }
    Command::Trips => {
      for trip in fleet.trips().await? {
        let van = trip.van_id.as_ref().map(RecordId::as_str).unwrap_or("-");
        let distance = trip
          .distance_km()
          .map(|km| format!("{km:.0} km"))
          .unwrap_or_default();
        println!("{}\t{}\t{}\t{}", trip.id, van, trip.status.as_str(), distance);
      }
    }
    Command::Users => {
      for user in fleet.users().await? {
        println!(
          "{}\t{}\t{}",
          user.id,
          user.name.as_deref().unwrap_or("-"),
          user.email.as_deref().unwrap_or("-")
        );
      }
    }
    Command::Companies => {
      for company in fleet.companies().await? {
        println!("{}\t{}", company.id, company.name);
      }
    }
    Command::Trip { action } => run_trip(fleet, action).await?,
    Command::Refresh { collections } => {
      for collection in cache.refresh(&collections).await? {
        println!("{}\t{} records", collection.name(), collection.len());
      }
    }
    Command::FullRefresh { collections } => {
      for collection in cache.full_refresh(&collections).await? {
        println!("{}\t{} records", collection.name(), collection.len());
      }
    }
    Command::Invalidate { collections } => {
      cache.invalidate(&collections)?;
      for name in collections {
        println!("{name}\tstale");
      }
    }
    Command::Stats => {
      let stats = cache.stats()?;
      println!("valid\t{}", stats.valid);
      println!("expired\t{}", stats.expired);
      println!("in_flight\t{}", stats.in_flight);
      println!("optimistic\t{}", stats.optimistic);
    }
  }

  Ok(())
}

async fn run_trip(fleet: &FleetClient, action: TripCommand) -> Result<()> {
  // Mutations patch the cached trips, so load them first
  fleet.trips().await?;

  let pending = match action {
    TripCommand::Create {
      van,
      driver,
      start_km,
      destination,
    } => fleet.create_trip(NewTrip {
      van_id: van.into(),
      user_id: driver.map(RecordId::from),
      start_km,
      destination,
      ..Default::default()
    })?,
    TripCommand::Complete { id, end_km } => fleet.complete_trip(id.into(), end_km)?,
    TripCommand::Delete { id } => fleet.delete_trip(id.into())?,
  };

  let receipt = pending.settled().await?;
  report(&receipt);
  Ok(())
}

fn report(receipt: &MutationReceipt) {
  let id = receipt
    .record
    .id()
    .map(|id| id.to_string())
    .unwrap_or_default();
  println!("trip {id}");
  for name in &receipt.refreshed {
    println!("refreshed {name}");
  }
  if let Some(e) = &receipt.invalidation_error {
    eprintln!("warning: dependent refresh failed: {e}");
  }
}
