use std::{process, sync::Arc};

use aquasync::{
    config::{self, Settings},
    datastore::{DataStore, RestDataStore},
    error::AppError,
    infra::{
        error::InfraError,
        realtime::{MemoryRealtime, PhoenixOptions, PhoenixTransport, realtime_url},
        telemetry,
    },
    portal::{PortalContext, ViewSpec},
    sync::{QueryState, RealtimeTransport, SyncConfig, Toast},
};
use tokio::sync::broadcast::error::RecvError;
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

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Watch(config::WatchArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Watch(args) => run_watch(settings, args).await,
        config::Command::Track(args) => run_track(settings, args).await,
    }
}

async fn run_watch(settings: Settings, args: config::WatchArgs) -> Result<(), AppError> {
    let store = build_store(&settings)?;
    let realtime: Arc<dyn RealtimeTransport> = if args.no_realtime {
        Arc::new(MemoryRealtime::new())
    } else {
        let (site, api_key) = store_credentials(&settings)?;
        let url = realtime_url(site, api_key).map_err(InfraError::from)?;
        Arc::new(
            PhoenixTransport::spawn(url, api_key.to_string(), PhoenixOptions::default())
                .map_err(InfraError::from)?,
        )
    };

    let sync_config = SyncConfig::from(&settings);
    let context = PortalContext::new(sync_config.clone(), store, realtime);
    let gc_handle = context.spawn_gc();
    let mut toasts = context.notifier().subscribe();

    let realtime_enabled = !args.no_realtime;
    let mut water =
        context.mount(ViewSpec::homepage_water(&sync_config).realtime(realtime_enabled));
    let mut sewer =
        context.mount(ViewSpec::homepage_sewer(&sync_config).realtime(realtime_enabled));

    info!(
        target = "aquasync::watch",
        realtime = realtime_enabled,
        operational_interval_ms = sync_config.operational_interval_ms,
        "Watching homepage datasets"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(target = "aquasync::watch", error = %err, "Failed to listen for Ctrl-C");
                }
                break;
            }
            state = water.changed() => {
                let Some(state) = state else { break };
                log_state("water", &state);
            }
            state = sewer.changed() => {
                let Some(state) = state else { break };
                log_state("sewer", &state);
            }
            toast = toasts.recv() => match toast {
                Ok(toast) => log_toast(&toast),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "aquasync::watch", skipped, "Toast receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    water.unmount();
    sewer.unmount();
    gc_handle.abort();
    let _ = gc_handle.await;

    info!(target = "aquasync::watch", "Watch stopped");
    Ok(())
}

async fn run_track(settings: Settings, args: config::TrackArgs) -> Result<(), AppError> {
    let store = build_store(&settings)?;
    let context = PortalContext::new(
        SyncConfig::from(&settings),
        store,
        Arc::new(MemoryRealtime::new()),
    );

    match context.tracker().lookup(&args.number).await? {
        Some(application) => {
            info!(
                target = "aquasync::track",
                tracking_number = %application.tracking_number,
                applicant = %application.applicant_name,
                status = application.status.as_str(),
                final_decision = application.status.is_final(),
                remarks = application.remarks.as_deref().unwrap_or(""),
                "Application found"
            );
            println!("{}: {}", application.tracking_number, application.status.as_str());
            Ok(())
        }
        None => Err(AppError::validation(format!(
            "no application with tracking number `{}`",
            args.number.trim()
        ))),
    }
}

fn store_credentials(settings: &Settings) -> Result<(&str, &str), AppError> {
    let site = settings
        .store
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("store.url is required"))?;
    let api_key = settings
        .store
        .api_key
        .as_deref()
        .ok_or_else(|| InfraError::configuration("store.api_key is required"))?;
    Ok((site, api_key))
}

fn build_store(settings: &Settings) -> Result<Arc<dyn DataStore>, AppError> {
    let (site, api_key) = store_credentials(settings)?;
    let store = RestDataStore::new(site, api_key, settings.store.request_timeout)
        .map_err(InfraError::from)?;
    Ok(Arc::new(store))
}

fn log_state(dataset: &str, state: &QueryState) {
    let rows = state
        .data
        .as_ref()
        .and_then(|data| data.as_array())
        .map_or(0, Vec::len);
    match &state.error {
        Some(err) => warn!(
            target = "aquasync::watch",
            dataset,
            status = state.status.as_str(),
            error = %err,
            "Dataset fetch failed"
        ),
        None => info!(
            target = "aquasync::watch",
            dataset,
            status = state.status.as_str(),
            rows,
            stale = state.is_stale,
            fetching = state.is_fetching,
            "Dataset state changed"
        ),
    }
}

fn log_toast(toast: &Toast) {
    info!(
        target = "aquasync::watch",
        toast_id = %toast.id,
        kind = ?toast.kind,
        ttl_ms = toast.ttl_ms,
        "{}",
        toast.text
    );
}
