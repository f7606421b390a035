use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::DbError;
use tokio_postgres::{AsyncMessage, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotwise::collab::{AddressBook, Collaborators, HolidayCalendar};
use slotwise::engine::Engine;
use slotwise::model::Address;
use slotwise::schedule::parse_schedule;
use slotwise::wire;

const SCHEDULE: &str = r#"[
  {"courier_id": 1, "country_code": "IL", "timeslots": {
    "19/07/2021": [["09:00", "11:00", ["Tel Aviv"]], ["12:00", "14:00", ["Haifa"]]],
    "21/07/2021": [["09:00", "11:00", ["Tel Aviv"]]]
  }}
]"#;

// ── Test infrastructure ──────────────────────────────────────

fn collaborators() -> Collaborators {
    let mut addresses = AddressBook::new();
    addresses.insert(
        "Dizengoff 50, Tel Aviv",
        Address {
            street: "Dizengoff".into(),
            house_number: "50".into(),
            city: "Tel Aviv".into(),
            country: "Israel".into(),
            country_code: "IL".into(),
        },
    );
    let mut holidays = HolidayCalendar::new();
    holidays.add("IL", NaiveDate::from_ymd_opt(2021, 7, 21).unwrap());
    Collaborators::new(Arc::new(addresses), Arc::new(holidays))
}

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotwise.wal"), collaborators()).unwrap());
    engine.load_schedule(&parse_schedule(SCHEDULE).unwrap()).await.unwrap();

    let factory = wire::SlotwiseFactory::new(engine.clone(), "slotwise");
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<DbError>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotwise")
        .user("slotwise")
        .password("slotwise");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notice(notice)) => {
                    let _ = tx.send(notice);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Rows of a simple query, each as its column values.
async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<Vec<String>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).unwrap_or_default().to_string())
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

async fn sqlstate_of(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().unwrap().code().to_string()
}

async fn register(client: &tokio_postgres::Client, email: &str, address: &str) -> Ulid {
    let id = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO users (id, name, email, address, country_code) \
             VALUES ('{id}', 'Dana', '{email}', '{address}', 'IL')"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_through_the_wire() {
    let (addr, engine) = start_test_server().await;
    let (client, _notices) = connect(addr).await;
    let user = register(&client, "dana@example.com", "Dizengoff 50, Tel Aviv").await;

    let offered = rows(
        &client,
        &format!("SELECT * FROM availability WHERE user_id = '{user}' AND week_start = '2021-07-19'"),
    )
    .await;
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0][1], "2021-07-19 09:00");
    assert_eq!(offered[0][2], "2021-07-19 11:00");
    let timeslot_id = &offered[0][0];

    let delivery = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO deliveries (id, user_id, timeslot_id) VALUES ('{delivery}', '{user}', '{timeslot_id}')"
        ))
        .await
        .unwrap();

    let daily = rows(&client, "SELECT * FROM deliveries WHERE date = '2021-07-19'").await;
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0][0], delivery.to_string());
    assert_eq!(daily[0][5], "scheduled");

    client
        .simple_query(&format!("UPDATE deliveries SET status = 'completed' WHERE id = '{delivery}'"))
        .await
        .unwrap();
    let weekly = rows(&client, "SELECT * FROM deliveries WHERE week_start = '2021-07-19'").await;
    assert_eq!(weekly[0][5], "completed");

    assert_eq!(
        sqlstate_of(&client, &format!("DELETE FROM deliveries WHERE id = '{delivery}'")).await,
        "P0001"
    );
    assert_eq!(engine.daily_deliveries(NaiveDate::from_ymd_opt(2021, 7, 19).unwrap()).len(), 1);
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (addr, _engine) = start_test_server().await;
    let (client, _notices) = connect(addr).await;
    let user = register(&client, "cancel@example.com", "Dizengoff 50, Tel Aviv").await;

    let slots = rows(&client, "SELECT * FROM timeslots WHERE date = '2021-07-19'").await;
    let tel_aviv = slots.iter().find(|s| s[7] == "Tel Aviv").unwrap();
    let timeslot_id = tel_aviv[0].clone();

    let mut deliveries = Vec::new();
    for _ in 0..2 {
        let id = Ulid::new();
        client
            .simple_query(&format!("INSERT INTO deliveries VALUES ('{id}', '{user}', '{timeslot_id}')"))
            .await
            .unwrap();
        deliveries.push(id);
    }
    let full = rows(&client, "SELECT * FROM timeslots WHERE date = '2021-07-19'").await;
    let row = full.iter().find(|s| s[0] == timeslot_id).unwrap();
    assert_eq!((row[5].as_str(), row[6].as_str()), ("2", "not_available"));

    assert_eq!(
        sqlstate_of(
            &client,
            &format!("INSERT INTO deliveries (user_id, timeslot_id) VALUES ('{user}', '{timeslot_id}')")
        )
        .await,
        "P0001"
    );

    client
        .simple_query(&format!("DELETE FROM deliveries WHERE id = '{}'", deliveries[0]))
        .await
        .unwrap();
    let after = rows(&client, "SELECT * FROM timeslots WHERE date = '2021-07-19'").await;
    let row = after.iter().find(|s| s[0] == timeslot_id).unwrap();
    assert_eq!((row[5].as_str(), row[6].as_str()), ("1", "available"));

    assert_eq!(
        sqlstate_of(&client, &format!("DELETE FROM deliveries WHERE id = '{}'", deliveries[0])).await,
        "P0002"
    );
}

#[tokio::test]
async fn unresolved_address_sends_notice() {
    let (addr, _engine) = start_test_server().await;
    let (client, mut notices) = connect(addr).await;
    let user = register(&client, "nowhere@example.com", "Nowhere 0").await;

    let offered = rows(
        &client,
        &format!("SELECT * FROM availability WHERE user_id = '{user}' AND week_start = '2021-07-19'"),
    )
    .await;
    assert!(offered.is_empty());

    let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.code().code(), "01000");
}

#[tokio::test]
async fn errors_map_to_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let (client, _notices) = connect(addr).await;

    assert_eq!(sqlstate_of(&client, "SELEC nonsense").await, "42601");
    assert_eq!(
        sqlstate_of(
            &client,
            &format!("SELECT * FROM availability WHERE user_id = '{}' AND week_start = '2021-07-19'", Ulid::new())
        )
        .await,
        "P0002"
    );

    register(&client, "twice@example.com", "Dizengoff 50, Tel Aviv").await;
    assert_eq!(
        sqlstate_of(
            &client,
            "INSERT INTO users (name, email, address, country_code) \
             VALUES ('Other', 'twice@example.com', 'Herzl 1', 'IL')"
        )
        .await,
        "P0001"
    );
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _engine) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .user("slotwise")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}
