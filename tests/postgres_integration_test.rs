// ABOUTME: Integration tests for the PostgreSQL backend against a live database
// ABOUTME: Run with TEST_DATABASE_URL set and `cargo test -- --ignored`

use change_notifier::backend::postgres::{check_trigger_privileges, connect, get_table_columns};
use change_notifier::backend::{Backend, PostgresBackend};
use change_notifier::config::{Culture, NotifierConfig, StartOptions};
use change_notifier::model::{ChangeEntity, Property, Record, ValueKind};
use change_notifier::notifier::{ChangeEvent, ChangeNotifier, EngineStatus};
use change_notifier::protocol::ChangeKind;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Helper to get the test database URL from environment
fn get_test_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}

/// Create a unique test table name to avoid conflicts
fn test_table_name(suffix: &str) -> String {
    format!("cn_test_{}", suffix)
}

async fn setup_test_table(client: &tokio_postgres::Client, table_name: &str) -> anyhow::Result<()> {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{0}" CASCADE;
        CREATE TABLE "public"."{0}" (
            id SERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            balance NUMERIC(12, 2),
            active BOOLEAN DEFAULT true,
            created_at TIMESTAMP DEFAULT '2024-01-02 03:04:05.678',
            seen_at TIMESTAMPTZ,
            payload BYTEA
        )
        "#,
        table_name
    );
    client.batch_execute(&ddl).await?;
    Ok(())
}

async fn cleanup_test_table(client: &tokio_postgres::Client, table_name: &str) {
    let ddl = format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table_name);
    let _ = client.batch_execute(&ddl).await;
}

#[derive(Debug, Clone, PartialEq)]
struct Account {
    id: Option<i32>,
    name: Option<String>,
    balance: Option<Decimal>,
    active: Option<bool>,
    created_at: Option<NaiveDateTime>,
    seen_at: Option<DateTime<FixedOffset>>,
    payload: Option<Vec<u8>>,
}

impl ChangeEntity for Account {
    fn properties() -> &'static [Property] {
        const PROPERTIES: &[Property] = &[
            Property::identity("id", ValueKind::I32),
            Property::new("name", ValueKind::String),
            Property::new("balance", ValueKind::Decimal),
            Property::new("active", ValueKind::Bool),
            Property::new("created_at", ValueKind::DateTime),
            Property::new("seen_at", ValueKind::DateTimeTz),
            Property::new("payload", ValueKind::Bytes),
        ];
        PROPERTIES
    }

    fn from_record(record: &Record) -> anyhow::Result<Self> {
        Ok(Account {
            id: record.get("id")?,
            name: record.get("name")?,
            balance: record.get("balance")?,
            active: record.get("active")?,
            created_at: record.get("created_at")?,
            seen_at: record.get("seen_at")?,
            payload: record.get("payload")?,
        })
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn conversation_objects(client: &tokio_postgres::Client, table_name: &str) -> i64 {
    let pattern = format!("cn_{}_%", table_name);
    let row = client
        .query_one(
            "SELECT (SELECT count(*) FROM pg_class WHERE relname LIKE $1)
                  + (SELECT count(*) FROM pg_proc WHERE proname LIKE $1)
                  + (SELECT count(*) FROM pg_trigger WHERE tgname LIKE $1)",
            &[&pattern],
        )
        .await
        .unwrap();
    row.get(0)
}

#[tokio::test]
#[ignore]
async fn test_introspection_and_privileges() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let client = connect(&url, false).await.unwrap();
    let table = test_table_name("introspect");
    setup_test_table(&client, &table).await.unwrap();

    let columns = get_table_columns(&client, "public", &table).await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["id", "name", "balance", "active", "created_at", "seen_at", "payload"]
    );
    assert_eq!(columns[0].type_name, "integer");
    assert!(!columns[1].nullable);

    let privileges = check_trigger_privileges(&client, "public", &table)
        .await
        .unwrap();
    assert!(privileges.table_exists);
    assert!(privileges.is_sufficient());

    let missing = check_trigger_privileges(&client, "public", "cn_test_does_not_exist")
        .await
        .unwrap();
    assert!(!missing.table_exists);

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_full_lifecycle_insert_update_delete() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let client = connect(&url, false).await.unwrap();
    let table = test_table_name("lifecycle");
    setup_test_table(&client, &table).await.unwrap();

    let notifier =
        ChangeNotifier::<Account, _>::new(PostgresBackend::new(&url), NotifierConfig::new("public", &table))
            .unwrap();
    let changes: Arc<Mutex<Vec<ChangeEvent<Account>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    notifier
        .on_changed(move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();
    notifier.on_error(|info| eprintln!("notifier error: {:?}", info)).unwrap();

    notifier
        .start(StartOptions {
            timeout: Duration::from_secs(1),
            watchdog_timeout: Duration::from_secs(30),
        })
        .await
        .unwrap();
    assert!(conversation_objects(&client, &table).await > 0);

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{0}" (name, balance, seen_at, payload)
               VALUES ('Ada', 1234.50, '2024-06-01 08:30:00+02', '\x00ff10');
               UPDATE "public"."{0}" SET active = false, name = 'Ada L.' WHERE name = 'Ada';
               DELETE FROM "public"."{0}";"#,
            table
        ))
        .await
        .unwrap();

    assert!(wait_for(|| changes.lock().unwrap().len() == 3).await);
    let changes = changes.lock().unwrap().clone();
    let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
    );

    let inserted = &changes[0].entity;
    assert_eq!(inserted.id, Some(1));
    assert_eq!(inserted.name.as_deref(), Some("Ada"));
    assert_eq!(inserted.balance, Some(Decimal::from_str("1234.50").unwrap()));
    assert_eq!(inserted.active, Some(true));
    assert_eq!(
        inserted.created_at,
        Some(NaiveDateTime::parse_from_str("2024-01-02 03:04:05.678", "%Y-%m-%d %H:%M:%S%.f").unwrap())
    );
    assert_eq!(
        inserted.seen_at,
        Some(DateTime::parse_from_rfc3339("2024-06-01T08:30:00+02:00").unwrap())
    );
    assert_eq!(inserted.payload, Some(vec![0x00, 0xff, 0x10]));
    assert_eq!(changes[1].entity.active, Some(false));
    assert_eq!(changes[2].entity.name.as_deref(), Some("Ada L."));

    notifier.stop().await;
    assert_eq!(notifier.status(), EngineStatus::StoppedDueToCancellation);
    assert_eq!(conversation_objects(&client, &table).await, 0);

    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_filter_and_update_of_limit_notifications() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let client = connect(&url, false).await.unwrap();
    let table = test_table_name("filtered");
    setup_test_table(&client, &table).await.unwrap();

    let mut config = NotifierConfig::new("public", &table);
    config.listen_on = vec![ChangeKind::Insert, ChangeKind::Update];
    config.update_of = vec!["balance".into()];
    config.filter = Some("balance >= 100".into());
    let notifier = ChangeNotifier::<Account, _>::new(PostgresBackend::new(&url), config).unwrap();
    let ids: Arc<Mutex<Vec<(ChangeKind, Option<i32>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ids);
    notifier
        .on_changed(move |event| sink.lock().unwrap().push((event.kind, event.entity.id)))
        .unwrap();
    notifier
        .start(StartOptions::from_secs(1, 30))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{0}" (id, name, balance) VALUES (1, 'small', 5), (2, 'large', 500);
               UPDATE "public"."{0}" SET name = 'renamed' WHERE id = 2;
               UPDATE "public"."{0}" SET balance = 700 WHERE id = 2;
               DELETE FROM "public"."{0}" WHERE id = 2;"#,
            table
        ))
        .await
        .unwrap();

    assert!(wait_for(|| ids.lock().unwrap().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        *ids.lock().unwrap(),
        vec![(ChangeKind::Insert, Some(2)), (ChangeKind::Update, Some(2))]
    );

    notifier.stop().await;
    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_decimal_comma_culture_reads_numbers() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let client = connect(&url, false).await.unwrap();
    let table = test_table_name("culture");
    setup_test_table(&client, &table).await.unwrap();

    let mut config = NotifierConfig::new("public", &table);
    config.culture = Culture {
        decimal_separator: ',',
        group_separator: Some('.'),
    };
    let notifier = ChangeNotifier::<Account, _>::new(PostgresBackend::new(&url), config).unwrap();
    let balances: Arc<Mutex<Vec<Option<Decimal>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&balances);
    notifier
        .on_changed(move |event| sink.lock().unwrap().push(event.entity.balance))
        .unwrap();
    notifier
        .start(StartOptions::from_secs(1, 30))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (name, balance) VALUES ('grouped', 1234.50)"#,
            table
        ))
        .await
        .unwrap();

    assert!(wait_for(|| balances.lock().unwrap().len() == 1).await);
    assert_eq!(
        balances.lock().unwrap()[0],
        Some(Decimal::from_str("1234.50").unwrap())
    );

    notifier.stop().await;
    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_heartbeat_keeps_quiet_table_alive() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let client = connect(&url, false).await.unwrap();
    let table = test_table_name("quiet");
    setup_test_table(&client, &table).await.unwrap();

    let notifier = ChangeNotifier::<Account, _>::new(
        PostgresBackend::new(&url),
        NotifierConfig::new("public", &table),
    )
    .unwrap();
    notifier
        .start(StartOptions {
            timeout: Duration::from_millis(200),
            watchdog_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(notifier.status().is_running());
    assert!(notifier.diagnostics().heartbeats > 0);

    notifier.stop().await;
    cleanup_test_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_missing_table_is_rejected_without_provisioning() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let backend = PostgresBackend::new(&url);
    assert!(backend
        .columns("public", "cn_test_does_not_exist")
        .await
        .unwrap()
        .is_empty());

    let notifier = ChangeNotifier::<Account, _>::new(
        backend,
        NotifierConfig::new("public", "cn_test_does_not_exist"),
    )
    .unwrap();
    assert!(notifier.start(StartOptions::from_secs(1, 5)).await.is_err());
    assert_eq!(notifier.status(), EngineStatus::StoppedDueToError);
}
