//! Command execution against the cache service and REST client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use oncocache_core::cache::{
    CacheEvent, CacheService, FileStorage, FocusEvent, QueryParams, ReadPath, SortOrder,
    SystemClock,
};
use oncocache_core::models::{Collection, DropdownKind};
use oncocache_core::{ApiClient, Config};

use crate::view::{self, TerminalView};
use crate::{Command, ListArgs};

/// How long a one-shot command waits for a background revalidation before exiting.
const REVALIDATION_WAIT: Duration = Duration::from_secs(30);

pub async fn run(command: Command, mut config: Config, json: bool) -> Result<()> {
    // Toggling persists to config so the next invocation sees it
    if let Command::Enable | Command::Disable = command {
        config.cache.enabled = matches!(command, Command::Enable);
        config.save()?;
        println!(
            "Caching {}",
            if config.cache.enabled { "enabled" } else { "disabled" }
        );
        return Ok(());
    }

    let app = App::open(&config, json)?;
    match command {
        Command::List(args) => app.list(&args, false).await,
        Command::Revalidate(args) => app.list(&args, true).await,
        Command::Catalog { count } => app.catalog(count).await,
        Command::Options { kind } => app.options(kind.as_deref()).await,
        Command::Create { collection, record } => app.create(&collection, &record).await,
        Command::Update { collection, record } => app.update(&collection, &record).await,
        Command::Delete { collection, id } => app.delete(&collection, &id).await,
        Command::Search { list } => app.search(&list).await,
        Command::Watch { list, every, ticks } => app.watch(&list, every, ticks).await,
        Command::Status => {
            app.status()?;
            Ok(())
        }
        Command::Clear { collection } => app.clear(collection.as_deref()),
        Command::Sweep => {
            let removed = app.service.sweep_expired();
            println!("Removed {} expired or invalid entries", removed);
            Ok(())
        }
        Command::Enable | Command::Disable => Ok(()),
    }
}

fn parse_collection(name: &str) -> Result<Collection> {
    name.parse::<Collection>().map_err(|e| anyhow!(e))
}

fn parse_record(raw: &str) -> Result<Value> {
    let record: Value = serde_json::from_str(raw).context("Record must be valid JSON")?;
    if !record.is_object() {
        bail!("Record must be a JSON object");
    }
    Ok(record)
}

/// Numeric ids go over the wire as numbers, anything else as a string.
fn parse_id(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn query_params(args: &ListArgs) -> QueryParams {
    let order = if args.desc { SortOrder::Desc } else { SortOrder::Asc };
    let params = QueryParams::default()
        .page(args.page)
        .page_size(args.page_size)
        .sort(args.sort.clone(), order);
    match args.search {
        Some(ref term) => params.search(term.clone(), args.search_type.clone()),
        None => params,
    }
}

/// Block until the pending background revalidation reports back.
async fn wait_for_revalidation(events: &mut broadcast::Receiver<CacheEvent>) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(CacheEvent::Revalidated { key, applied }) => {
                    info!(key = %key, applied, "Revalidated");
                    return;
                }
                Ok(CacheEvent::RevalidationFailed { key, error }) => {
                    eprintln!("Could not revalidate {}: {}", key, error);
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    };
    if tokio::time::timeout(REVALIDATION_WAIT, wait).await.is_err() {
        warn!("Gave up waiting for background revalidation");
    }
}

fn describe(path: ReadPath) -> &'static str {
    match path {
        ReadPath::FreshHit => "fresh cache hit",
        ReadPath::StaleHit => "stale cache hit",
        ReadPath::Miss => "cache miss",
        ReadPath::Bypass => "cache bypassed",
    }
}

struct App {
    service: CacheService,
    client: Arc<ApiClient>,
    view: Arc<TerminalView>,
    json: bool,
}

impl App {
    fn open(config: &Config, json: bool) -> Result<Self> {
        let dir = config.cache_dir()?;
        let storage = FileStorage::with_quota(dir.clone(), config.cache.quota_bytes)
            .with_context(|| format!("Failed to open cache directory {}", dir.display()))?;
        let service = CacheService::new(Arc::new(storage), Arc::new(SystemClock), &config.cache);
        if service.init() {
            info!(dir = %dir.display(), "Cache started cold");
        }

        let mut client = ApiClient::new(config.api_url.as_str())?;
        if let Some(ref token) = config.api_token {
            client.set_token(token.clone());
        }

        Ok(Self {
            service,
            client: Arc::new(client),
            view: Arc::new(TerminalView::new(json)),
            json,
        })
    }

    async fn list(&self, args: &ListArgs, force: bool) -> Result<()> {
        let collection = parse_collection(&args.collection)?;
        let revalidator = self
            .service
            .revalidator(collection, self.client.clone(), self.view.clone());
        if force {
            revalidator.cache().force_revalidation();
        }

        let mut events = self.service.events().subscribe();
        let outcome = revalidator.load(query_params(args)).await?;
        eprintln!("({})", describe(outcome.path));

        if outcome.path == ReadPath::StaleHit {
            eprintln!("Cached copy is stale, revalidating...");
            wait_for_revalidation(&mut events).await;
        }
        Ok(())
    }

    async fn catalog(&self, count: bool) -> Result<()> {
        let revalidator = self
            .service
            .revalidator(Collection::Services, self.client.clone(), self.view.clone());
        let mut events = self.service.events().subscribe();

        let mut last = None;
        let outcome = revalidator
            .load_catalog(|percent| {
                if last != Some(percent) {
                    eprint!("\rLoading catalog... {:>3}%", percent);
                    last = Some(percent);
                }
            })
            .await?;
        eprintln!();

        if count {
            println!("{}", outcome.items.len());
        } else {
            view::print_records(Collection::Services, &outcome.items, outcome.source, self.json);
        }
        if let Some(total) = outcome.truncated_from {
            eprintln!("Catalog truncated: kept {} of {} records", outcome.items.len(), total);
        }
        if outcome.is_stale {
            eprintln!("Cached catalog is stale, refreshing...");
            wait_for_revalidation(&mut events).await;
        }
        Ok(())
    }

    async fn options(&self, kind: Option<&str>) -> Result<()> {
        match kind {
            Some(kind) => {
                let kind: DropdownKind = kind.parse().map_err(|e: String| anyhow!(e))?;
                let (options, source) = self.service.load_options(self.client.as_ref(), kind).await?;
                if self.json {
                    println!("{}", serde_json::to_string(&options)?);
                } else {
                    view::print_options(kind.title(), &options, source);
                }
            }
            None => {
                for (kind, result) in self.service.load_all_options(self.client.as_ref()).await {
                    match result {
                        Ok(options) => {
                            println!("{}: {} options", kind.title(), options.len());
                        }
                        Err(e) => eprintln!("{}: {:#}", kind.title(), e),
                    }
                }
            }
        }
        Ok(())
    }

    async fn create(&self, collection: &str, record: &str) -> Result<()> {
        let collection = parse_collection(collection)?;
        let record = parse_record(record)?;
        let revalidator = self
            .service
            .revalidator(collection, self.client.clone(), self.view.clone());

        let created = revalidator.create_record(&record).await?;
        println!("{}", created);
        Ok(())
    }

    async fn update(&self, collection: &str, record: &str) -> Result<()> {
        let collection = parse_collection(collection)?;
        let record = parse_record(record)?;
        let revalidator = self
            .service
            .revalidator(collection, self.client.clone(), self.view.clone());

        let report = revalidator.update_record(&record).await?;
        println!("Updated; patched {} cached entries", report.updated_count);
        for error in &report.errors {
            eprintln!("  {}", error);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let collection = parse_collection(collection)?;
        let revalidator = self
            .service
            .revalidator(collection, self.client.clone(), self.view.clone());

        revalidator.delete_record(&parse_id(id)).await?;
        println!("Deleted {} {}", collection, id);
        Ok(())
    }

    /// Read search terms line by line; only a term followed by a quiet
    /// period is fetched.
    async fn search(&self, args: &ListArgs) -> Result<()> {
        let collection = parse_collection(&args.collection)?;
        let revalidator = self
            .service
            .revalidator(collection, self.client.clone(), self.view.clone());
        revalidator.set_active(query_params(args));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read search input")? {
            let params = revalidator.search(&line, args.search_type.clone());
            info!(term = ?params.search_term, "Search queued");
        }

        // Let the last queued search run before exiting
        let drain = async {
            while revalidator.scheduler().pending() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(REVALIDATION_WAIT, drain).await.is_err() {
            warn!("Gave up waiting for the last search");
        }
        Ok(())
    }

    async fn watch(&self, args: &ListArgs, every: u64, ticks: u32) -> Result<()> {
        let collection = parse_collection(&args.collection)?;
        let revalidator = self
            .service
            .revalidator(collection, self.client.clone(), self.view.clone());
        revalidator.load(query_params(args)).await?;

        let mut events = self.service.events().subscribe();
        let (tx, rx) = mpsc::channel(8);
        let subscription = revalidator.subscribe_focus(rx);

        let mut interval = tokio::time::interval(Duration::from_secs(every.max(1)));
        interval.tick().await;
        for _ in 0..ticks {
            interval.tick().await;
            tx.send(FocusEvent::Gained)
                .await
                .map_err(|_| anyhow!("Focus listener stopped"))?;
            while let Ok(event) = events.try_recv() {
                if let CacheEvent::RevalidationFailed { key, error } = event {
                    eprintln!("Could not revalidate {}: {}", key, error);
                }
            }
        }

        subscription.unsubscribe();
        Ok(())
    }

    fn status(&self) -> Result<()> {
        let status = self.service.status();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&status.domains)?);
        } else {
            view::print_status(&status);
        }
        Ok(())
    }

    fn clear(&self, collection: Option<&str>) -> Result<()> {
        let removed = match collection {
            Some(name) => self.service.domain(parse_collection(name)?).clear_cache(),
            None => self.service.clear_all(),
        };
        println!("Removed {} entries", removed);
        Ok(())
    }
}
