use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offsync::config::Config;
use offsync::queue::SqliteStorage;
use offsync::transport::HttpTransport;
use offsync::{CachedRequest, Connectivity, OfflineService, OutgoingRequest, RequestMetadata};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Queue HTTP mutations while offline and replay them later")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the server as unreachable without probing it
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queued requests
  List,
  /// Issue a request; it is queued if the server is unreachable
  Enqueue {
    /// HTTP method (POST, PATCH, DELETE, ...)
    #[arg(short, long)]
    method: String,
    /// Request url, relative to the server url
    #[arg(short, long)]
    url: String,
    /// Entity type the request affects
    #[arg(short = 't', long = "type")]
    entity_type: Option<String>,
    /// Identity field of the entity
    #[arg(long)]
    id_key: Option<String>,
    /// Label shown in `list`
    #[arg(long)]
    label: Option<String>,
    /// JSON body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Send one queued request, or the whole queue
  Sync {
    /// Request id or unique id prefix
    id: Option<String>,
  },
  /// Drop queued requests without sending them
  Discard {
    /// Request id or unique id prefix
    id: Option<String>,
    /// Drop the whole queue
    #[arg(long, conflicts_with = "id")]
    all: bool,
  },
  /// Apply queued requests to a JSON array of entities
  Project {
    /// Entity type to project
    entity_type: String,
    /// File holding the confirmed entities (default: stdin)
    #[arg(short, long)]
    file: Option<PathBuf>,
  },
  /// Probe the server periodically and sync whenever it comes back
  Watch {
    /// Seconds between probes
    #[arg(short, long, default_value_t = 15)]
    interval: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = offsync::logging::init(&config.log)?;

  let storage = match &config.storage.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  let transport = Arc::new(HttpTransport::new(&config.server, Config::get_api_token())?);

  let offline = args.offline || (needs_server(&args.command) && !transport.is_reachable().await);
  let connectivity = Connectivity::new(offline);
  let service = Arc::new(OfflineService::new(
    &config,
    storage,
    transport.clone(),
    connectivity.clone(),
  ));

  match args.command {
    Command::List => list(&service),
    Command::Enqueue {
      method,
      url,
      entity_type,
      id_key,
      label,
      body,
    } => {
      let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let mut request = OutgoingRequest::new(method, url);
      if let Some(body) = body {
        let body: Value =
          serde_json::from_str(&body).map_err(|e| eyre!("Body is not valid JSON: {}", e))?;
        request = request.with_body(body);
      }
      if let Some(entity_type) = entity_type {
        let mut metadata = RequestMetadata::new(entity_type);
        if let Some(id_key) = id_key {
          metadata = metadata.with_id_key(id_key);
        }
        if let Some(label) = label {
          metadata = metadata.with_display_value(label);
        }
        request = request.with_metadata(metadata);
      }

      let response = service.request(request).await?;
      if service.is_offline() {
        println!("Queued ({} pending)", service.pending_count());
      }
      print_json(&response)?;
      Ok(())
    }
    Command::Sync { id: Some(id) } => {
      let request = find_request(&service, &id)?;
      if service.sync(&request).await {
        println!("Synced {}", request.display_value());
        Ok(())
      } else {
        Err(eyre!("Could not sync {}", request.display_value()))
      }
    }
    Command::Sync { id: None } => match service.sync_all_report().await {
      Some(report) => {
        println!("Sent {} request(s), {} still waiting", report.sent, report.deferred);
        Ok(())
      }
      None => Err(eyre!(
        "Synchronization failed, {} request(s) still queued",
        service.pending_count()
      )),
    },
    Command::Discard { all: true, .. } => {
      service.discard_all()?;
      println!("Discarded all queued requests");
      Ok(())
    }
    Command::Discard { id: Some(id), .. } => {
      let request = find_request(&service, &id)?;
      service.remove_single_request(&request)?;
      println!("Discarded {}", request.display_value());
      Ok(())
    }
    Command::Discard { id: None, .. } => Err(eyre!("Pass a request id or --all")),
    Command::Project { entity_type, file } => {
      let raw = match file {
        Some(path) => std::fs::read_to_string(&path)
          .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?,
        None => std::io::read_to_string(std::io::stdin())
          .map_err(|e| eyre!("Failed to read stdin: {}", e))?,
      };
      let entities: Vec<Value> =
        serde_json::from_str(&raw).map_err(|e| eyre!("Expected a JSON array: {}", e))?;

      print_json(&Value::Array(service.apply_offline_data(&entity_type, &entities)))
    }
    Command::Watch { interval } => {
      watch(service, transport, connectivity, Duration::from_secs(interval)).await;
      Ok(())
    }
  }
}

fn list(service: &OfflineService) -> Result<()> {
  let queue = service.cached_requests();
  if queue.is_empty() {
    println!("No queued requests");
    return Ok(());
  }

  for request in &queue {
    println!(
      "{}  {:<8} {:<12} {}",
      short_id(&request.id),
      request.method,
      request.metadata.entity_type,
      request.display_value(),
    );
  }
  println!("{} pending", queue.len());
  Ok(())
}

/// Commands that talk to the server; only these pay for the reachability probe.
fn needs_server(command: &Command) -> bool {
  matches!(
    command,
    Command::Enqueue { .. } | Command::Sync { .. } | Command::Watch { .. }
  )
}

fn short_id(id: &str) -> String {
  id.chars().take(8).collect()
}

/// Find a queued request by id or unique id prefix.
fn find_request(service: &OfflineService, id: &str) -> Result<CachedRequest> {
  let mut matches: Vec<CachedRequest> = service
    .cached_requests()
    .into_iter()
    .filter(|r| r.id.starts_with(id))
    .collect();

  match matches.len() {
    0 => Err(eyre!("No queued request matches {}", id)),
    1 => Ok(matches.remove(0)),
    n => Err(eyre!("{} queued requests match {}, use a longer prefix", n, id)),
  }
}

fn print_json(value: &Value) -> Result<()> {
  let pretty =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format JSON: {}", e))?;
  println!("{}", pretty);
  Ok(())
}

/// Feed reachability probes into the connectivity signal and sync on reconnect.
async fn watch(
  service: Arc<OfflineService>,
  transport: Arc<HttpTransport>,
  connectivity: Connectivity,
  interval: Duration,
) {
  let syncer = service.clone();
  let sync_task = tokio::spawn(async move { syncer.sync_on_reconnect().await });

  if !service.is_offline() && service.has_pending() {
    service.sync_all().await;
  }

  println!("Watching connectivity, press Ctrl-C to stop");
  let mut ticker = tokio::time::interval(interval);
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        connectivity.set_offline(!transport.is_reachable().await);
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  sync_task.abort();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_short_id_respects_char_boundaries() {
    assert_eq!(short_id("1b4e28ba-2fa1-11d2"), "1b4e28ba");
    assert_eq!(short_id("ab"), "ab");
    assert_eq!(short_id("αβγδεζηθικ"), "αβγδεζηθ");
  }

  #[test]
  fn test_only_server_commands_probe() {
    let probes = |argv: &[&str]| needs_server(&Args::parse_from(argv).command);
    assert!(!probes(&["offsync", "list"]));
    assert!(!probes(&["offsync", "discard", "--all"]));
    assert!(!probes(&["offsync", "project", "item"]));
    assert!(probes(&["offsync", "sync"]));
    assert!(probes(&["offsync", "watch"]));
  }
}
