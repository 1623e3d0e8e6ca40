use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    uid: String,
    is_admin: bool,
}

#[derive(Debug, Deserialize)]
struct HabitBody {
    id: String,
    name: String,
    emoji: String,
    #[serde(default)]
    streak: u32,
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    done: bool,
    streak: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    completed: usize,
    total: usize,
    percentage: u32,
    best_streak: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryBody {
    balance: f64,
    month_expenses: f64,
    progress: Option<f64>,
    status: Option<String>,
}


struct TestServer {
    base_url: String,
    child: Child,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SERVER: Lazy<Mutex<Option<Arc<TestServer>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(unix)]
mod cleanup {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Once;

    static REGISTER: Once = Once::new();
    static PID: AtomicI32 = AtomicI32::new(0);

    pub fn register(pid: u32) {
        REGISTER.call_once(|| {
            PID.store(pid as i32, Ordering::SeqCst);
            unsafe {
                libc::atexit(on_exit);
            }
        });
    }

    extern "C" fn on_exit() {
        let pid = PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn unique_data_path() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!("orbit_http_{}_{}.json", std::process::id(), nanos));
    path.to_string_lossy().to_string()
}

async fn wait_until_ready(base_url: &str) {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(resp) = client.get(format!("{base_url}/api/announcement")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("server did not become ready");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn spawn_server() -> TestServer {
    let port = pick_free_port();
    let data_path = unique_data_path();
    let child = Command::new(env!("CARGO_BIN_EXE_orbit"))
        .env("PORT", port.to_string())
        .env("ORBIT_DATA_PATH", data_path)
        .env("ORBIT_ADMIN_EMAILS", "root@orbit.test")
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn server");

    #[cfg(unix)]
    cleanup::register(child.id());

    let base_url = format!("http://127.0.0.1:{port}");
    wait_until_ready(&base_url).await;

    TestServer { base_url, child }
}

async fn shared_server() -> Arc<TestServer> {
    let mut guard = SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Arc::clone(server);
    }
    let server = Arc::new(spawn_server().await);
    *guard = Some(Arc::clone(&server));
    server
}

async fn sign_in(client: &Client, server: &TestServer, uid: &str, email: &str) -> SessionResponse {
    let response = client
        .post(format!("{}/api/sessions", server.base_url))
        .json(&serde_json::json!({
            "uid": uid,
            "email": email,
            "displayName": uid,
            "photoURL": null,
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    response.json().await.unwrap()
}

fn today_key() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

#[tokio::test]
async fn http_habit_toggle_updates_stats() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let session = sign_in(&client, &server, "habit-user", "habits@orbit.test").await;
    assert_eq!(session.uid, "habit-user");
    assert!(!session.is_admin);

    let response = client
        .post(format!("{}/api/users/habit-user/habits", server.base_url))
        .json(&serde_json::json!({ "name": "Read", "emoji": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let habit: HabitBody = response.json().await.unwrap();
    assert_eq!(habit.name, "Read");
    assert_eq!(habit.emoji, "⚡");

    let toggled: ToggleBody = client
        .post(format!(
            "{}/api/users/habit-user/habits/{}/toggle",
            server.base_url, habit.id
        ))
        .json(&serde_json::json!({ "date": today_key() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(toggled.done);
    assert_eq!(toggled.streak, 1);

    let stats: StatsBody = client
        .get(format!("{}/api/users/habit-user/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.percentage, 100);
    assert_eq!(stats.best_streak, 1);

    let habits: Vec<HabitBody> = client
        .get(format!("{}/api/users/habit-user/habits", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(habits.len(), 1);
    assert_eq!(habits[0].streak, 1);
}

#[tokio::test]
async fn http_rejects_bad_input() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    sign_in(&client, &server, "strict-user", "strict@orbit.test").await;

    let response = client
        .post(format!("{}/api/users/strict-user/habits", server.base_url))
        .json(&serde_json::json!({ "name": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let message = response.text().await.unwrap();
    assert!(!message.is_empty());

    let response = client
        .post(format!(
            "{}/api/users/strict-user/habits/missing/toggle",
            server.base_url
        ))
        .json(&serde_json::json!({ "date": "not-a-date" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = client
        .get(format!("{}/api/users/nobody/stats", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_budget_summary_tracks_expenses() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    sign_in(&client, &server, "budget-user", "budget@orbit.test").await;

    let response = client
        .put(format!("{}/api/users/budget-user/budget", server.base_url))
        .json(&serde_json::json!({ "limit": 200.0 }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    for (amount, kind) in [(500.0, "income"), (160.0, "expense")] {
        let response = client
            .post(format!("{}/api/users/budget-user/transactions", server.base_url))
            .json(&serde_json::json!({
                "amount": amount,
                "description": "entry",
                "type": kind,
                "category": "food",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    }

    let summary: SummaryBody = client
        .get(format!("{}/api/users/budget-user/budget/summary", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary.balance, 340.0);
    assert_eq!(summary.month_expenses, 160.0);
    assert_eq!(summary.progress, Some(80.0));
    assert_eq!(summary.status.as_deref(), Some("warning"));
}

#[tokio::test]
async fn http_sign_out_ends_session() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let admin = sign_in(&client, &server, "root-user", "root@orbit.test").await;
    assert!(admin.is_admin);

    let response = client
        .delete(format!("{}/api/sessions/root-user", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let response = client
        .get(format!("{}/api/users/root-user/habits", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
