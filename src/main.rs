use std::{collections::BTreeMap, process, sync::Arc};

use pagegate::{
    cache::{CacheConfig, Invalidator, PageStore, ResourceIdentity, SiteConfigs},
    config::{self, Command, PurgeArgs},
    infra::{backend, error::InfraError, telemetry},
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

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;
    warn_about_site_settings(&settings.sites);

    let store = backend::connect(&settings.backend).await;

    match cli_args.command {
        Command::Status => run_status(&store).await,
        Command::Flush => run_flush(&store).await,
        Command::Purge(args) => run_purge(&store, &settings.sites, args).await,
    }
}

fn warn_about_site_settings(sites: &SiteConfigs) {
    if sites.is_empty() {
        warn!("No [[sites]] configured; every request will bypass the page cache");
    }
    for host in sites.hosts() {
        if let Some(config) = sites.for_host(host)
            && config.uses_custom_prefixes()
        {
            warn!(
                host,
                prefix_data = %config.prefix_data,
                prefix_meta = %config.prefix_meta,
                "Custom key prefixes configured; any proxy reading the cache directly must use the same prefixes"
            );
        }
    }
}

async fn run_status(store: &PageStore) -> Result<(), InfraError> {
    let probe = store.status_probe().await;
    if probe.is_empty() {
        return Err(InfraError::backend("no backend endpoints configured"));
    }

    for (endpoint, healthy) in &probe {
        let state = if *healthy == 1 { "up" } else { "down" };
        println!("{endpoint}\t{state}");
    }

    if probe.values().all(|healthy| *healthy == 0) {
        return Err(InfraError::backend("no backend endpoint is reachable"));
    }
    Ok(())
}

async fn run_flush(store: &PageStore) -> Result<(), InfraError> {
    if !Invalidator::new(store.clone()).flush().await {
        return Err(InfraError::backend("flush failed on every endpoint"));
    }
    println!("flushed {}", store.engine());
    Ok(())
}

async fn run_purge(
    store: &PageStore,
    sites: &SiteConfigs,
    args: PurgeArgs,
) -> Result<(), InfraError> {
    if !store.is_alive() {
        return Err(InfraError::backend("page cache backend is unavailable"));
    }

    let mut by_host: BTreeMap<String, (Arc<CacheConfig>, Vec<String>)> = BTreeMap::new();
    for url in args.urls {
        let identity = ResourceIdentity::from_permalink(&url)
            .map_err(|err| InfraError::configuration(err.to_string()))?;
        let config = sites.for_host(&identity.host).ok_or_else(|| {
            InfraError::configuration(format!("no site configured for host `{}`", identity.host))
        })?;
        by_host
            .entry(identity.host)
            .or_insert_with(|| (config, Vec::new()))
            .1
            .push(url);
    }

    let invalidator = Invalidator::new(store.clone());
    for (host, (config, urls)) in by_host {
        let deleted = invalidator
            .purge_permalinks(&urls, args.pages, &config)
            .await;
        info!(host = %host, urls = urls.len(), pages = args.pages, deleted, "Purge finished");
        let outcome = if deleted { "purged" } else { "nothing cached" };
        for url in &urls {
            println!("{url}\t{outcome}");
        }
    }
    Ok(())
}
