use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use boxoffice::tenant::TenantManager;
use boxoffice::wire;

const DAY: i64 = 86_400_000;
const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("boxoffice_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 600_000, Duration::from_secs(1)));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "boxoffice".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("harbour_tours")
        .user("owner")
        .password("boxoffice");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap()
}

/// Notifications are delivered ahead of the listener's next statement.
async fn poll_notification(
    client: &tokio_postgres::Client,
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    client.batch_execute("SELECT * FROM summary").await.unwrap();
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

struct Catalog {
    experience: Ulid,
    ticket_type: Ulid,
    event: Ulid,
    session: Ulid,
}

/// A published experience with one 25.00 ticket type and one session tomorrow.
async fn seed(client: &tokio_postgres::Client, capacity: u32) -> Catalog {
    let c = Catalog {
        experience: Ulid::new(),
        ticket_type: Ulid::new(),
        event: Ulid::new(),
        session: Ulid::new(),
    };
    let now = now_ms();
    let (ev_start, ev_end) = (now - HOUR, now + 30 * DAY);
    let (s_start, s_end) = (now + DAY, now + DAY + 2 * HOUR);
    client
        .batch_execute(&format!(
            "INSERT INTO experiences (id, name, status) VALUES ('{}', 'Harbour cruise', 'published')",
            c.experience
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO ticket_types (id, experience_id, name, price) VALUES ('{}', '{}', 'Adult', '25.00')",
            c.ticket_type, c.experience
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, experience_id, name, start, "end") VALUES ('{}', '{}', 'Season', {ev_start}, {ev_end})"#,
            c.event, c.experience
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO sessions (id, event_id, start, "end", capacity) VALUES ('{}', '{}', {s_start}, {s_end}, {capacity})"#,
            c.session, c.event
        ))
        .await
        .unwrap();
    c
}

async fn place_hold(
    client: &tokio_postgres::Client,
    c: &Catalog,
    quantity: u32,
) -> Result<Ulid, tokio_postgres::Error> {
    let hold = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, session_id, tickets) VALUES ('{hold}', '{}', '{}:{quantity}')",
            c.session, c.ticket_type
        ))
        .await
        .map(|_| hold)
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn checkout_flow_hold_confirm_cancel() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let c = seed(&client, 10).await;

    let hold = place_hold(&client, &c, 3).await.unwrap();
    let sessions = rows(&client, &format!("SELECT * FROM sessions WHERE event_id = '{}'", c.event)).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(col(&sessions[0], "held"), "3");
    assert_eq!(col(&sessions[0], "remaining"), "7");

    let booking = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, hold_id, name, email) VALUES ('{booking}', '{hold}', 'Ada Byron', 'ada@example.com')"
        ))
        .await
        .unwrap();

    let bookings = rows(&client, "SELECT * FROM bookings").await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(col(&bookings[0], "id"), booking.to_string());
    assert_eq!(col(&bookings[0], "status"), "confirmed");
    assert_eq!(col(&bookings[0], "total"), "75.00");
    assert_eq!(col(&bookings[0], "quantity"), "3");

    assert!(rows(&client, "SELECT * FROM holds").await.is_empty());

    let summary = rows(&client, "SELECT * FROM summary").await;
    assert_eq!(col(&summary[0], "revenue"), "75.00");
    assert_eq!(col(&summary[0], "tickets_sold"), "3");

    let guests = rows(&client, "SELECT * FROM guests WHERE email = 'ada@example.com'").await;
    assert_eq!(col(&guests[0], "total_spent"), "75.00");

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap();
    let sessions = rows(&client, "SELECT * FROM sessions").await;
    assert_eq!(col(&sessions[0], "remaining"), "10");
}

#[tokio::test]
async fn oversell_is_rejected_with_capacity_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let c = seed(&client, 2).await;

    place_hold(&client, &c, 2).await.unwrap();
    let err = place_hold(&client, &c, 1).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("53400"));
}

#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    let (addr, _tm) = start_test_server().await;
    let (setup, _rx) = connect(addr).await;
    let c = Arc::new(seed(&setup, 5).await);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let c = c.clone();
        handles.push(tokio::spawn(async move {
            let (client, _rx) = connect(addr).await;
            place_hold(&client, &c, 1).await.is_ok()
        }));
    }
    let mut won = 0;
    for h in handles {
        if h.await.unwrap() {
            won += 1;
        }
    }
    assert_eq!(won, 5);

    let sessions = rows(&setup, "SELECT * FROM sessions").await;
    assert_eq!(col(&sessions[0], "held"), "5");
    assert_eq!(col(&sessions[0], "remaining"), "0");
}

#[tokio::test]
async fn scheduled_event_generates_sessions() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let experience = Ulid::new();
    let event = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO experiences (id, name, status) VALUES ('{experience}', 'Kayak tour', 'published')"
        ))
        .await
        .unwrap();

    // Monday 2030-01-07 00:00 UTC, three days.
    let start = 1_893_974_400_000i64;
    let end = start + 3 * DAY;
    let inserted = client
        .execute(
            &format!(
                r#"INSERT INTO events (id, experience_id, name, start, "end", days, times, duration, capacity)
                   VALUES ('{event}', '{experience}', 'Winter', {start}, {end}, 'daily', '10:00,14:00', 90, 8)"#
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 7);

    let sessions = rows(&client, &format!("SELECT * FROM sessions WHERE event_id = '{event}'")).await;
    assert_eq!(sessions.len(), 6);
    assert_eq!(col(&sessions[0], "start"), (start + 10 * HOUR).to_string());
    assert_eq!(col(&sessions[0], "end"), (start + 10 * HOUR + 90 * 60_000).to_string());
    assert_eq!(col(&sessions[0], "capacity"), "8");
}

#[tokio::test]
async fn availability_respects_quantity() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let c = seed(&client, 4).await;
    place_hold(&client, &c, 3).await.unwrap();

    let now = now_ms();
    let window = format!(
        r#"SELECT * FROM availability WHERE experience_id = '{}' AND start >= {now} AND "end" <= {}"#,
        c.experience,
        now + 7 * DAY
    );
    let one = rows(&client, &window).await;
    assert_eq!(one.len(), 1);
    assert_eq!(col(&one[0], "remaining"), "1");

    let two = rows(&client, &format!("{window} AND quantity = 2")).await;
    assert!(two.is_empty());
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let c = seed(&client, 6).await;

    let guest = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO guests (id, name, email) VALUES ($1, $2, $3)",
            &[&guest, &"Grace O'Malley", &"grace@example.com"],
        )
        .await
        .unwrap();

    let found = client
        .query("SELECT * FROM sessions WHERE event_id = $1", &[&c.event.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let id: String = found[0].get("id");
    assert_eq!(id, c.session.to_string());

    let guests = rows(&client, "SELECT * FROM guests").await;
    assert_eq!(col(&guests[0], "name"), "Grace O'Malley");
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client.batch_execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .batch_execute(&format!("DELETE FROM holds WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));

    let c = seed(&client, 3).await;
    let err = client
        .batch_execute(&format!("DELETE FROM experiences WHERE id = '{}'", c.experience))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));
}

#[tokio::test]
async fn backwards_spans_are_rejected_not_fatal() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let c = seed(&client, 3).await;
    let now = now_ms();

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO sessions (id, event_id, start, "end", capacity) VALUES ('{}', '{}', {}, {}, 5)"#,
            Ulid::new(),
            c.event,
            now + 2 * HOUR,
            now + HOUR
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, experience_id, name, start, "end") VALUES ('{}', '{}', 'Reversed', {}, {now})"#,
            Ulid::new(),
            c.experience,
            now + DAY
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));

    // The connection survives both.
    assert_eq!(rows(&client, "SELECT * FROM sessions").await.len(), 1);
}

#[tokio::test]
async fn extended_protocol_keeps_dollar_text_literal() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let id = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO experiences (id, name, description) VALUES ($1, $2, $3)",
            &[&id, &"Harbour cruise", &"Only $15 per person"],
        )
        .await
        .unwrap();
    let experiences = rows(&client, "SELECT * FROM experiences").await;
    assert_eq!(col(&experiences[0], "description"), "Only $15 per person");
}

#[tokio::test]
async fn listen_receives_session_events() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let c = seed(&listener, 10).await;

    listener
        .batch_execute(&format!("LISTEN session_{}", c.session))
        .await
        .unwrap();

    let (buyer, _) = connect(addr).await;
    place_hold(&buyer, &c, 2).await.unwrap();

    let notif = poll_notification(&listener, &mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("session_{}", c.session));
    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(payload.get("HoldPlaced").is_some(), "payload: {payload}");
}

#[tokio::test]
async fn listen_is_scoped_to_one_session() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let c = seed(&listener, 10).await;
    let other = seed(&listener, 10).await;

    listener
        .batch_execute(&format!("LISTEN session_{}", c.session))
        .await
        .unwrap();
    // Listening twice is harmless.
    listener
        .batch_execute(&format!("LISTEN session_{}", c.session))
        .await
        .unwrap();

    let (buyer, _) = connect(addr).await;
    place_hold(&buyer, &other, 1).await.unwrap();
    assert!(poll_notification(&listener, &mut rx, Duration::from_millis(300)).await.is_none());

    place_hold(&buyer, &c, 1).await.unwrap();
    assert!(poll_notification(&listener, &mut rx, Duration::from_secs(5)).await.is_some());
    assert!(poll_notification(&listener, &mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let c = seed(&listener, 10).await;

    listener
        .batch_execute(&format!("LISTEN session_{}", c.session))
        .await
        .unwrap();
    listener.batch_execute("UNLISTEN *").await.unwrap();

    let (buyer, _) = connect(addr).await;
    place_hold(&buyer, &c, 1).await.unwrap();
    assert!(poll_notification(&listener, &mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_on_unknown_session_fails() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let err = client
        .batch_execute(&format!("LISTEN session_{}", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
}

#[tokio::test]
async fn businesses_are_isolated_by_database() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    seed(&client, 3).await;

    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("city_museum")
        .user("owner")
        .password("boxoffice");
    let (other, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(connection);

    let experiences = other.simple_query("SELECT * FROM experiences").await.unwrap();
    assert!(!experiences.iter().any(|m| matches!(m, SimpleQueryMessage::Row(_))));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("harbour_tours")
        .user("owner")
        .password("letmein");
    assert!(config.connect(NoTls).await.is_err());
}
