use std::{io, process, sync::Arc};

use serde_json::json;
use tagcache::{
    cache::{
        BackingStore, CacheConfig, CacheTrigger, EventKind, EventQueue, FsBackingStore,
        KeyBuilder, SettingValue,
    },
    catalog::CatalogKeys,
    config,
    error::AppError,
    replay::{self, ReplayError, Script, Session},
    telemetry,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Replay(args) => run_replay(&settings, args),
        config::Command::Events(args) => run_events(&settings, args).await,
        config::Command::Key(args) => run_key(&settings, args),
    }
}

fn open_backing(settings: &config::Settings) -> Result<Option<Arc<dyn BackingStore>>, AppError> {
    if !settings.backing.enabled {
        return Ok(None);
    }
    let store = FsBackingStore::open(settings.backing.directory.clone())?;
    info!(directory = %store.root().display(), "Backing store opened");
    let store: Arc<dyn BackingStore> = Arc::new(store);
    Ok(Some(store))
}

fn run_replay(settings: &config::Settings, args: config::ReplayArgs) -> Result<(), AppError> {
    let script = replay::load_script(&args.file)?;
    let session = Session::new(
        CacheConfig::from(&settings.cache),
        &script.hierarchy,
        open_backing(settings)?,
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    session.run(&script.steps, &mut out)?;
    Ok(())
}

async fn run_events(settings: &config::Settings, args: config::EventsArgs) -> Result<(), AppError> {
    let raw = tokio::fs::read_to_string(&args.file).await?;
    let events = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<EventKind>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ReplayError::from)?;

    let seed = match &args.seed {
        Some(path) => replay::load_script(path)?,
        None => Script::default(),
    };

    let cache_config = CacheConfig::from(&settings.cache);
    let session = Session::new(
        cache_config.clone(),
        &seed.hierarchy,
        open_backing(settings)?,
    );
    session.run(&seed.steps, &mut io::sink())?;
    let seeded = session.cache().len();
    info!(seeded, terms = seed.hierarchy.len(), "Seed script applied");

    let consumer = session.consumer().clone();
    let queue = consumer.queue().clone();
    let trigger = CacheTrigger::new(cache_config.clone(), queue.clone(), consumer.clone());

    let published = events.len();
    for kind in events {
        trigger.trigger(kind, false);
    }

    let cache_handle = consumer.spawn_interval(cache_config.auto_consume_interval());

    tokio::select! {
        _ = wait_for_empty_queue(queue.clone(), cache_config.auto_consume_interval()) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
            info!(pending = queue.len(), "Shutdown requested");
        }
    }

    cache_handle.abort();
    let _ = cache_handle.await;

    let entries = session.cache().len();
    println!(
        "{}",
        json!({
            "entries": entries,
            "pending": queue.len(),
            "published": published,
            "seeded": seeded,
        })
    );
    Ok(())
}

async fn wait_for_empty_queue(queue: Arc<EventQueue>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if queue.is_empty() {
            return;
        }
    }
}

fn run_key(settings: &config::Settings, args: config::KeyArgs) -> Result<(), AppError> {
    let parsed = args
        .settings
        .iter()
        .map(String::as_str)
        .map(parse_setting)
        .collect::<Result<Vec<_>, _>>()?;

    let catalog = CatalogKeys::new();
    let builder = match catalog.builder(&args.kind) {
        Some(builder) => builder.clone(),
        None => {
            let mut names: Vec<&str> = parsed.iter().map(|(name, _)| name.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            KeyBuilder::new(names)
        }
    };

    let key = builder.build(&args.kind, &args.identity, &parsed, settings.cache.version);
    println!("{key}");
    Ok(())
}

fn parse_setting(raw: &str) -> Result<(String, SettingValue), AppError> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| AppError::argument(format!("setting `{raw}` must be NAME=VALUE")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::argument(format!("setting `{raw}` has an empty name")));
    }
    let Ok(value) = value.trim().parse::<SettingValue>();
    Ok((name.to_string(), value))
}
