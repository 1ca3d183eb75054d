use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use fieldbook::clock::SystemClock;
use fieldbook::engine::Engine;
use fieldbook::service::Services;
use fieldbook::wire;

const PASSWORD: &str = "fieldbook";
// Far enough ahead that every booking is in the future and outside the
// cancellation cutoff.
const DAY: &str = "2099-06-01";

// ── Test infrastructure ──────────────────────────────────────

static NEXT_SERVER: AtomicU32 = AtomicU32::new(0);

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!(
        "fieldbook_int_test_{}_{}",
        std::process::id(),
        NEXT_SERVER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("fieldbook.wal")).unwrap());
    let services = Arc::new(Services::new(engine, Arc::new(SystemClock), "MIDTRANS"));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let services = services.clone();
            tokio::spawn(async move {
                let _ =
                    wire::process_connection(socket, services, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fieldbook")
        .user("fieldbook")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

async fn create_field(client: &Client, owner: i64) -> String {
    let created = rows(
        client,
        &format!(
            "INSERT INTO fields (owner_id, name, address, price_per_hour) \
             VALUES ({owner}, 'Futsal Arena', 'Jl. Merdeka 10', 100000)"
        ),
    )
    .await;
    assert_eq!(created.len(), 1);
    created[0].get("id").unwrap().to_string()
}

async fn open_every_day(client: &Client, field: &str, owner: i64) {
    let values: Vec<String> = (0..7)
        .map(|day| format!("({field}, {owner}, {day}, '08:00', '11:00')"))
        .collect();
    let schedules = rows(
        client,
        &format!(
            "INSERT INTO schedules (field_id, owner_id, day_of_week, open_time, close_time) \
             VALUES {}",
            values.join(", ")
        ),
    )
    .await;
    assert_eq!(schedules.len(), 7);
}

async fn book(client: &Client, user: i64, field: &str, start: &str, hours: i64) -> SimpleQueryRow {
    let mut booked = rows(
        client,
        &format!(
            "INSERT INTO bookings (user_id, field_id, start_time, duration_hours) \
             VALUES ({user}, {field}, '{DAY} {start}', {hours})"
        ),
    )
    .await;
    assert_eq!(booked.len(), 1);
    booked.remove(0)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_rejected() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .user("fieldbook")
        .password("not-the-password");
    assert!(config.connect(NoTls).await.is_err());
}

#[tokio::test]
async fn field_crud() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let id = create_field(&client, 3).await;
    let listed = rows(&client, "SELECT * FROM fields WHERE owner_id = 3").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("name"), Some("Futsal Arena"));

    let updated = rows(
        &client,
        &format!("UPDATE fields SET price_per_hour = 150000 WHERE id = {id} AND owner_id = 3"),
    )
    .await;
    assert_eq!(updated[0].get("price_per_hour"), Some("150000"));
    assert_eq!(updated[0].get("name"), Some("Futsal Arena"));

    let code = sqlstate(
        &client,
        &format!("DELETE FROM fields WHERE id = {id} AND owner_id = 4"),
    )
    .await;
    assert_eq!(code, "42501");

    client
        .simple_query(&format!("DELETE FROM fields WHERE id = {id} AND owner_id = 3"))
        .await
        .unwrap();
    let code = sqlstate(&client, &format!("SELECT * FROM fields WHERE id = {id}")).await;
    assert_eq!(code, "P0002");
}

#[tokio::test]
async fn slots_reflect_bookings() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let field = create_field(&client, 3).await;
    open_every_day(&client, &field, 3).await;

    book(&client, 7, &field, "09:00", 1).await;

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE field_id = {field} AND date = '{DAY}'"),
    )
    .await;
    let view: Vec<(&str, &str)> = slots
        .iter()
        .map(|s| (s.get("start_time").unwrap(), s.get("available").unwrap()))
        .collect();
    assert_eq!(
        view,
        [
            ("2099-06-01 08:00:00", "t"),
            ("2099-06-01 09:00:00", "f"),
            ("2099-06-01 10:00:00", "t"),
        ]
    );
}

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let field = create_field(&client, 3).await;

    let booking = book(&client, 7, &field, "09:00", 2).await;
    let id = booking.get("id").unwrap().to_string();
    assert_eq!(booking.get("status"), Some("pending"));
    assert_eq!(booking.get("total_price"), Some("200000"));
    assert_eq!(booking.get("end_time"), Some("2099-06-01 11:00:00"));

    // Partial overlap is refused with exclusion_violation.
    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings (user_id, field_id, start_time, duration_hours) \
             VALUES (8, {field}, '{DAY} 10:30', 1)"
        ),
    )
    .await;
    assert_eq!(code, "23P01");

    // Back-to-back is fine.
    book(&client, 8, &field, "11:00", 1).await;

    let conflicts = rows(
        &client,
        &format!(
            "SELECT * FROM conflicts WHERE field_id = {field} \
             AND start_time = '{DAY} 08:00' AND end_time = '{DAY} 12:00'"
        ),
    )
    .await;
    assert_eq!(conflicts.len(), 2);
    assert_eq!(conflicts[0].get("id"), Some(id.as_str()));

    let payment = rows(&client, &format!("SELECT * FROM payments WHERE booking_id = {id}")).await;
    assert_eq!(payment[0].get("amount"), Some("200000"));
    let tx = payment[0].get("transaction_id").unwrap().to_string();
    assert!(tx.starts_with(&format!("MIDTRANS-{id}-")));

    let settled = rows(
        &client,
        &format!("UPDATE payments SET status = 'success' WHERE transaction_id = '{tx}'"),
    )
    .await;
    assert_eq!(settled[0].get("status"), Some("success"));

    let confirmed = rows(&client, &format!("SELECT * FROM bookings WHERE id = {id}")).await;
    assert_eq!(confirmed[0].get("status"), Some("confirmed"));

    let code = sqlstate(
        &client,
        &format!("UPDATE bookings SET status = 'confirmed' WHERE id = {id}"),
    )
    .await;
    assert_eq!(code, "55000");

    let code = sqlstate(
        &client,
        &format!("DELETE FROM bookings WHERE id = {id} AND user_id = 8"),
    )
    .await;
    assert_eq!(code, "42501");

    let cancelled = rows(
        &client,
        &format!("DELETE FROM bookings WHERE id = {id} AND user_id = 7"),
    )
    .await;
    assert_eq!(cancelled[0].get("status"), Some("cancelled"));

    // The cancelled window is free again.
    book(&client, 9, &field, "09:00", 2).await;
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let field = create_field(&client, 3).await;
    book(&client, 7, &field, "09:00", 1).await;

    let stmt = client
        .prepare("SELECT * FROM bookings WHERE user_id = $1")
        .await
        .unwrap();
    assert_eq!(stmt.params().len(), 1);
    assert_eq!(stmt.columns()[0].name(), "id");
}

#[tokio::test]
async fn errors_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let field = create_field(&client, 3).await;

    assert_eq!(sqlstate(&client, "SELEC nonsense").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM courts").await, "42P01");
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO bookings (user_id, field_id, start_time, duration_hours) \
                 VALUES (7, {field}, '{DAY} 09:00', 0)"
            )
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO bookings (user_id, field_id, start_time, duration_hours) \
             VALUES (7, 999, '2099-06-01 09:00', 1)"
        )
        .await,
        "P0002"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO schedules (field_id, owner_id, day_of_week, open_time, close_time) \
                 VALUES ({field}, 3, 1, '12:00', '10:00')"
            )
        )
        .await,
        "22023"
    );
}
