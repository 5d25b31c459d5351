mod support;

use std::time::Duration;

use gateway_console::model::{Actor, InstanceStatus, Role};
use gateway_console::pairing::PairingPhase;
use support::memory_console;

#[tokio::test(start_paused = true)]
async fn cancel_one_second_in_leaves_instance_connecting() {
    let console = memory_console();
    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);
    let created = console.instances.create("recepcao", &agent).await.unwrap();

    let mut session = console.pairing.open(&created, &agent);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(session.phase(), PairingPhase::Displaying { .. }));
    session.cancel();

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(session.finished().await, PairingPhase::Cancelled);
    let current = console.instances.find(&created.id, &agent).await.unwrap();
    assert_eq!(current.status, InstanceStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn uninterrupted_session_connects_the_instance() {
    let console = memory_console();
    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);
    let created = console.instances.create("recepcao", &agent).await.unwrap();

    let mut session = console.pairing.open(&created, &agent);
    session.wait().await.unwrap();
    let current = console.instances.find(&created.id, &agent).await.unwrap();
    assert_eq!(current.status, InstanceStatus::Connected);
    assert!(current.last_update >= created.last_update);
}

#[tokio::test(start_paused = true)]
async fn non_owner_session_aborts() {
    let console = memory_console();
    let owner = Actor::new("u-ana", "Ana Lima", Role::Agent);
    let created = console.instances.create("recepcao", &owner).await.unwrap();

    let manager = Actor::new("u-marco", "Marco Reis", Role::Manager);
    let mut session = console.pairing.open(&created, &manager);
    match session.finished().await {
        PairingPhase::Aborted { reason } => assert!(reason.contains("owner")),
        other => panic!("unexpected phase {other:?}"),
    }
}
