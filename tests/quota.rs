mod support;

use std::sync::Arc;

use gateway_console::Console;
use gateway_console::error::ConsoleError;
use gateway_console::license::{License, LicenseLimits, StaticLicenseSource, Usage};
use gateway_console::model::{Actor, Role};
use gateway_console::store::MemoryKvStore;
use serde_json::json;
use support::StubServer;

fn single_seat(used_instances: u32) -> Arc<StaticLicenseSource> {
    Arc::new(StaticLicenseSource {
        license: License {
            tier: "starter".to_string(),
            limits: LicenseLimits {
                max_seats: 1,
                max_messages_per_month: 1_000,
                max_contacts: 100,
            },
            addon_seats: 0,
            ..License::free()
        },
        usage: Usage {
            used_seats: 1,
            used_instances,
            ..Usage::default()
        },
    })
}

async fn live_console(gateway: &StubServer, used_instances: u32) -> Console {
    let console = Console::with_license_source(
        Arc::new(MemoryKvStore::open()),
        single_seat(used_instances),
    )
    .unwrap();
    console
        .config
        .update(|config| {
            config.mock_mode = false;
            config.gateway.base_url = gateway.url();
            config.gateway.api_key = "k".to_string();
        })
        .unwrap();
    console
}

#[tokio::test]
async fn full_seat_pool_rejects_create_without_touching_backends() {
    let gateway = StubServer::start(|_| (201, json!({"instance": {"instanceName": "x"}})))
        .await
        .unwrap();
    let console = live_console(&gateway, 1).await;
    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);

    let result = console.instances.create("nova", &agent).await;
    assert_eq!(result, Err(ConsoleError::QuotaExceeded { limit: 1 }));
    assert!(gateway.requests().is_empty());

    let status = console.license.status().await.unwrap();
    assert_eq!(status.total_seats, 1);
    assert_eq!(status.remaining_seats, 0);
    assert!(!status.enforcement_bypassed);
}

#[tokio::test]
async fn free_seat_lets_create_reach_the_gateway() {
    let gateway = StubServer::start(|_| {
        (201, json!({"instance": {"instanceName": "nova", "instanceId": "gw-1"}}))
    })
    .await
    .unwrap();
    let console = live_console(&gateway, 0).await;
    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);

    let created = console.instances.create("nova", &agent).await.unwrap();
    assert_eq!(created.id, "gw-1");
    assert_eq!(gateway.requests().len(), 1);
}

#[tokio::test]
async fn super_admin_is_not_bound_by_the_quota() {
    let gateway = StubServer::start(|_| {
        (201, json!({"instance": {"instanceName": "extra", "instanceId": "gw-2"}}))
    })
    .await
    .unwrap();
    let console = live_console(&gateway, 1).await;
    let admin = Actor::new("u-root", "Root", Role::SuperAdmin);

    assert!(console.license.quota_ok(Role::SuperAdmin).await.unwrap());
    assert!(!console.license.quota_ok(Role::Manager).await.unwrap());
    let created = console.instances.create("extra", &admin).await.unwrap();
    assert_eq!(created.id, "gw-2");
}

#[tokio::test]
async fn mock_mode_reports_usage_but_never_enforces() {
    let console = support::memory_console();
    let status = console.license.status().await.unwrap();
    assert!(status.enforcement_bypassed);
    assert_eq!(status.usage.used_instances, 2);

    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);
    for name in ["a", "b", "c"] {
        console.instances.create(name, &agent).await.unwrap();
    }
    let status = console.license.status().await.unwrap();
    assert_eq!(status.usage.used_instances, 5);
    assert_eq!(status.remaining_seats, 0);
}
