//! View lifecycle and cross-view convergence through the portal context.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use aquasync::datastore::{MemoryDataStore, StoreError};
use aquasync::domain::{RowOperation, Table};
use aquasync::infra::realtime::MemoryRealtime;
use aquasync::portal::{PortalContext, ViewSpec};
use aquasync::sync::{BridgeState, ChannelStatus, SyncConfig, ToastKind};

struct Harness {
    context: PortalContext,
    store: Arc<MemoryDataStore>,
    realtime: Arc<MemoryRealtime>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryDataStore::new());
    store.seed(
        Table::SewerQualityData,
        [
            json!({"id": 1, "plant": "east", "bod": 18, "sampled_at": "2024-01-04"}),
            json!({"id": 2, "plant": "east", "bod": 44, "sampled_at": "2024-01-09"}),
            json!({"id": 3, "plant": "west", "bod": 21, "sampled_at": "2024-01-12"}),
        ],
    );
    store.seed(
        Table::WaterQualityData,
        [json!({"id": 1, "plant": "north", "ph": 7.2, "sampled_at": "2024-01-05"})],
    );
    let realtime = Arc::new(MemoryRealtime::auto_subscribing());
    let config = SyncConfig {
        retry: 0,
        ..Default::default()
    };
    let context = PortalContext::new(config, store.clone(), realtime.clone());
    Harness {
        context,
        store,
        realtime,
    }
}

fn ids(rows: &[Value]) -> Vec<i64> {
    let mut ids: Vec<i64> = rows.iter().filter_map(|row| row["id"].as_i64()).collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn fifty_mount_cycles_leave_no_channels_or_timers() {
    let Harness {
        context, realtime, ..
    } = harness();
    let config = context.config().clone();

    for _ in 0..50 {
        let view = context.mount(ViewSpec::homepage_sewer(&config));
        assert_eq!(realtime.active_channels(), 1);
        assert_eq!(context.polls().active_timers(), 1);
        view.unmount();
    }

    assert_eq!(realtime.active_channels(), 0);
    assert_eq!(context.polls().active_timers(), 0);
    assert_eq!(realtime.subscriptions(), 50);
    assert_eq!(realtime.removals(), 50);
}

#[tokio::test]
async fn dropping_a_view_tears_it_down() {
    let Harness {
        context, realtime, ..
    } = harness();
    let config = context.config().clone();

    {
        let _water = context.mount(ViewSpec::homepage_water(&config));
        let _sewer = context.mount(ViewSpec::homepage_sewer(&config));
        assert_eq!(realtime.active_channels(), 2);
        // Both homepage views share the operational timer.
        assert_eq!(context.polls().active_timers(), 1);
    }

    assert_eq!(realtime.active_channels(), 0);
    assert_eq!(context.polls().active_timers(), 0);
}

#[tokio::test]
async fn admin_delete_converges_homepage_view() {
    let Harness { context, store, .. } = harness();
    let config = context.config().clone();

    let mut homepage = context.mount(ViewSpec::homepage_sewer(&config));
    let mut admin_view =
        context.mount(ViewSpec::admin_sewer("2024-01-01", "2024-01-31", &config));
    homepage.settled().await.expect("settled");
    admin_view.settled().await.expect("settled");
    assert_eq!(ids(&homepage.rows()), vec![1, 2, 3]);
    let selects_before = store.select_count(Table::SewerQualityData);

    context
        .admin()
        .delete_row(Table::SewerQualityData, "2")
        .await
        .expect("delete");

    let state = homepage
        .wait_until(|state| {
            !state.is_fetching
                && !state.is_stale
                && state
                    .data
                    .as_ref()
                    .and_then(Value::as_array)
                    .is_some_and(|rows| rows.len() == 2)
        })
        .await
        .expect("converged");
    let rows = state.data.and_then(|data| data.as_array().cloned()).unwrap_or_default();
    assert_eq!(ids(&rows), vec![1, 3]);

    admin_view
        .wait_until(|state| !state.is_fetching && !state.is_stale)
        .await
        .expect("admin refetched");
    assert_eq!(ids(&admin_view.rows()), vec![1, 3]);
    assert!(store.select_count(Table::SewerQualityData) >= selects_before + 2);
}

#[tokio::test]
async fn failed_mutation_leaves_other_views_untouched() {
    let Harness { context, store, .. } = harness();
    let config = context.config().clone();
    let mut toasts = context.notifier().subscribe();

    let mut homepage = context.mount(ViewSpec::homepage_sewer(&config));
    homepage.settled().await.expect("settled");
    let selects_before = store.select_count(Table::SewerQualityData);

    store.fail_next_write(
        Table::SewerQualityData,
        StoreError::Status {
            status: 500,
            message: "row level security".to_string(),
        },
    );
    context
        .admin()
        .delete_row(Table::SewerQualityData, "2")
        .await
        .expect_err("delete fails");

    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    let state = homepage.state();
    assert!(!state.is_stale);
    assert_eq!(ids(&homepage.rows()), vec![1, 2, 3]);
    assert_eq!(store.select_count(Table::SewerQualityData), selects_before);

    let toast = toasts.try_recv().expect("error toast");
    assert_eq!(toast.kind, ToastKind::Error);
    assert!(toasts.try_recv().is_err());
}

#[tokio::test]
async fn realtime_change_refreshes_view_and_raises_toast() {
    let Harness {
        context,
        store,
        realtime,
    } = harness();
    let config = context.config().clone();
    let mut toasts = context.notifier().subscribe();

    let mut view = context.mount(ViewSpec::homepage_water(&config));
    view.settled().await.expect("settled");
    assert_eq!(view.realtime_state(), Some(BridgeState::Subscribed));

    store.seed(
        Table::WaterQualityData,
        [json!({"id": 2, "plant": "south", "ph": 6.9, "sampled_at": "2024-01-06"})],
    );
    realtime.emit_change(
        Table::WaterQualityData.as_str(),
        RowOperation::Insert,
        json!({"id": 2}),
    );

    view.wait_until(|state| {
        state
            .data
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|rows| rows.len() == 2)
    })
    .await
    .expect("refreshed");

    let toast = toasts.try_recv().expect("toast");
    assert_eq!(toast.kind, ToastKind::Info);
    assert_eq!(toast.text, "Water quality data updated");
}

#[tokio::test]
async fn changes_after_channel_loss_are_ignored() {
    let Harness {
        context,
        store,
        realtime,
    } = harness();
    let config = context.config().clone();

    let mut view = context.mount(ViewSpec::homepage_water(&config));
    view.settled().await.expect("settled");
    let selects_before = store.select_count(Table::WaterQualityData);

    realtime.emit_status(Table::WaterQualityData.as_str(), ChannelStatus::ChannelError);
    assert_eq!(view.realtime_state(), Some(BridgeState::Disconnected));

    realtime.emit_change(
        Table::WaterQualityData.as_str(),
        RowOperation::Update,
        json!({"id": 1}),
    );
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(store.select_count(Table::WaterQualityData), selects_before);
    assert!(!view.state().is_stale);
}

#[tokio::test]
async fn application_tracking_follows_admin_decisions() {
    let Harness { context, store, .. } = harness();
    store.seed(
        Table::LicenseApplications,
        [json!({
            "id": "a1",
            "tracking_number": "LA-2024-0042",
            "applicant_name": "Ward 7 Water Board",
            "status": "under_review",
            "submitted_at": "2024-03-01T09:30:00Z"
        })],
    );

    let tracker = context.tracker();
    let mut handle = tracker.watch("LA-2024-0042").expect("watch");
    handle.settled().await.expect("settled");

    context
        .admin()
        .update_row(
            Table::LicenseApplications,
            "a1",
            json!({"status": "approved", "updated_at": "2024-03-08T14:00:00Z"}),
        )
        .await
        .expect("update");

    handle
        .wait_until(|state| !state.is_stale && !state.is_fetching)
        .await
        .expect("refetched");
    let application = aquasync::portal::tracking::decode(&handle)
        .expect("decode")
        .expect("application");
    assert!(application.status.is_final());
}

#[tokio::test(start_paused = true)]
async fn poll_timer_refreshes_view_silently_while_realtime_is_down() {
    let Harness {
        context,
        store,
        realtime,
    } = harness();
    let config = context.config().clone();
    let mut toasts = context.notifier().subscribe();

    let mut view = context.mount(ViewSpec::homepage_water(&config));
    view.settled().await.expect("settled");
    realtime.emit_status(Table::WaterQualityData.as_str(), ChannelStatus::ChannelError);
    assert_eq!(view.realtime_state(), Some(BridgeState::Disconnected));

    store.seed(
        Table::WaterQualityData,
        [json!({"id": 2, "plant": "south", "ph": 6.9, "sampled_at": "2024-01-06"})],
    );
    tokio::time::advance(config.operational_interval() + Duration::from_millis(1)).await;

    let state = view
        .wait_until(|state| {
            !state.is_fetching
                && state
                    .data
                    .as_ref()
                    .and_then(Value::as_array)
                    .is_some_and(|rows| rows.len() == 2)
        })
        .await
        .expect("poll refresh");
    let rows = state.data.and_then(|data| data.as_array().cloned()).unwrap_or_default();
    assert_eq!(ids(&rows), vec![1, 2]);
    assert!(toasts.try_recv().is_err());
}

#[tokio::test]
async fn admin_write_echoed_by_realtime_raises_one_toast() {
    let Harness {
        context,
        realtime,
        ..
    } = harness();
    let config = context.config().clone();

    let mut view = context.mount(ViewSpec::homepage_water(&config));
    view.settled().await.expect("settled");
    let mut toasts = context.notifier().subscribe();

    context
        .admin()
        .update_row(Table::WaterQualityData, "1", json!({"ph": 7.4}))
        .await
        .expect("update");
    realtime.emit_change(
        Table::WaterQualityData.as_str(),
        RowOperation::Update,
        json!({"id": 1}),
    );

    let toast = toasts.try_recv().expect("toast");
    assert_eq!(toast.text, "Water quality data updated");
    assert!(toasts.try_recv().is_err());
}
