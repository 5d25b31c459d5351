use gateway_console::Console;
use gateway_console::model::{Actor, Role};
use gateway_console::runtime_state::ConsolePaths;

#[tokio::test]
async fn created_instances_and_config_survive_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let paths = ConsolePaths::new(temp.path().join("state"));
    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);

    let console = Console::open(&paths).unwrap();
    let created = console.instances.create("noturno", &agent).await.unwrap();
    console
        .config
        .update(|config| config.pairing.scan_dwell_ms = 1_500)
        .unwrap();
    console.close().unwrap();

    let reopened = Console::open(&paths).unwrap();
    let found = reopened.instances.find(&created.id, &agent).await.unwrap();
    assert_eq!(found.name, "noturno");
    assert_eq!(found.created_at, created.created_at);
    assert_eq!(reopened.config.get().pairing.scan_dwell_ms, 1_500);
}

#[tokio::test]
async fn closed_store_rejects_writes() {
    let temp = tempfile::tempdir().unwrap();
    let console = Console::open(&ConsolePaths::new(temp.path())).unwrap();
    console.close().unwrap();
    let agent = Actor::new("u-ana", "Ana Lima", Role::Agent);
    assert!(console.instances.create("tarde", &agent).await.is_err());
}
