use crate::api::LoginResponse;
use crate::auth::token::issue_token;
use crate::auth::{ApprovalStatus, Role};
use crate::clock::{Clock, FixedClock};
use crate::config::AppConfig;
use crate::db::{NewUser, create_book, create_user, get_user};
use crate::error::AppError;
use crate::init_rocket;
use chrono::{DateTime, Utc};
use rocket::http::{ContentType, Header};
use rocket::local::asynchronous::Client;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use tracing::log::LevelFilter;

static INIT: Once = Once::new();
pub static STANDARD_PASSWORD: &str = "password123";
pub static STANDARD_QUESTION: &str = "What was the name of your first pet?";
pub static STANDARD_ANSWER: &str = "Biscuit";

#[derive(Default)]
pub struct TestDbBuilder {
    users: Vec<TestUser>,
    books: Vec<TestBook>,
    shared_connections: Option<u32>,
}

pub struct TestUser {
    pub username: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub approval_status: ApprovalStatus,
    pub password: String,
}

pub struct TestBook {
    pub title: String,
    pub subject: String,
}

impl TestDbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn user(
        mut self,
        username: &str,
        display_name: Option<&str>,
        role: Role,
        approval_status: ApprovalStatus,
    ) -> Self {
        self.users.push(TestUser {
            username: username.to_string(),
            display_name: display_name.map(String::from),
            role,
            approval_status,
            password: STANDARD_PASSWORD.to_string(),
        });
        self
    }

    pub fn student(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Student, ApprovalStatus::Approved)
    }

    pub fn teacher(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Teacher, ApprovalStatus::Approved)
    }

    pub fn pending_teacher(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Teacher, ApprovalStatus::Pending)
    }

    pub fn admin(self, username: &str, display_name: Option<&str>) -> Self {
        self.user(username, display_name, Role::Admin, ApprovalStatus::Approved)
    }

    pub fn book(mut self, title: &str, subject: &str) -> Self {
        self.books.push(TestBook {
            title: title.to_string(),
            subject: subject.to_string(),
        });
        self
    }

    /// Backs the pool with a temporary database file and `connections`
    /// connections, so queries from different futures really overlap.
    pub fn file_backed(mut self, connections: u32) -> Self {
        self.shared_connections = Some(connections);
        self
    }

    pub async fn build(self) -> Result<TestDb, AppError> {
        INIT.call_once(|| {
            let _ = env_logger::builder()
                .filter_level(LevelFilter::Debug)
                .is_test(true)
                .try_init();
        });

        let (pool, db_path) = match self.shared_connections {
            Some(connections) => {
                let path = std::env::temp_dir()
                    .join(format!("reading-tracker-test-{}.db", uuid::Uuid::new_v4()));
                let options = SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
                    .busy_timeout(std::time::Duration::from_secs(30));

                let pool = SqlitePoolOptions::new()
                    .max_connections(connections)
                    .min_connections(connections)
                    .connect_with(options)
                    .await?;

                (pool, Some(path))
            }
            None => {
                // One connection keeps the in-memory database alive.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect("sqlite::memory:")
                    .await?;

                (pool, None)
            }
        };

        sqlx::migrate!("./migrations").run(&pool).await?;

        let config = AppConfig::for_tests();
        let mut user_id_map: HashMap<String, i64> = HashMap::new();
        let mut book_id_map: HashMap<String, i64> = HashMap::new();

        for user in &self.users {
            let user_id = create_user(
                &pool,
                NewUser {
                    username: &user.username,
                    password: &user.password,
                    role: user.role,
                    display_name: user.display_name.as_deref(),
                    approval_status: user.approval_status,
                    security_question: Some(STANDARD_QUESTION),
                    security_answer: Some(STANDARD_ANSWER),
                },
                config.bcrypt_cost,
            )
            .await?;

            user_id_map.insert(user.username.clone(), user_id);
        }

        let creator = self
            .users
            .iter()
            .find(|u| u.role != Role::Student)
            .and_then(|u| user_id_map.get(&u.username).copied());

        for book in &self.books {
            let book_id = create_book(&pool, &book.title, &book.subject, None, creator).await?;
            book_id_map.insert(book.title.clone(), book_id);
        }

        let start = DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0)
            .expect("current time is representable");

        Ok(TestDb {
            pool,
            config,
            clock: Arc::new(FixedClock::new(start)),
            user_id_map,
            book_id_map,
            db_path,
        })
    }
}

pub struct TestDb {
    pub pool: Pool<Sqlite>,
    pub config: AppConfig,
    pub clock: Arc<FixedClock>,
    pub user_id_map: HashMap<String, i64>,
    pub book_id_map: HashMap<String, i64>,
    pub db_path: Option<PathBuf>,
}

impl TestDb {
    pub fn user_id(&self, username: &str) -> i64 {
        *self
            .user_id_map
            .get(username)
            .unwrap_or_else(|| panic!("No test user named {}", username))
    }

    pub fn book_id(&self, title: &str) -> i64 {
        *self
            .book_id_map
            .get(title)
            .unwrap_or_else(|| panic!("No test book titled {}", title))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Signs a token directly, bypassing the login checks.
    pub async fn token_for(&self, username: &str) -> String {
        let user = get_user(&self.pool, self.user_id(username))
            .await
            .expect("Failed to load test user");

        issue_token(
            &user,
            &self.config.jwt_secret,
            self.config.token_ttl_hours,
            Utc::now(),
        )
        .expect("Failed to sign test token")
    }

    /// Closes the pool and removes the database file, if there is one.
    pub async fn close(self) {
        self.pool.close().await;

        if let Some(path) = self.db_path {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                let _ = std::fs::remove_file(file);
            }
        }
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count rows")
    }
}

/// Seeds a teacher, two students and a couple of books.
pub async fn create_standard_test_db() -> TestDb {
    TestDbBuilder::new()
        .teacher("teacher_user", Some("Teacher User"))
        .student("student_user", Some("Student User"))
        .student("other_student", Some("Other Student"))
        .admin("admin_user", Some("Admin User"))
        .book("Charlotte's Web", "English")
        .book("A Brief History of Time", "Science")
        .build()
        .await
        .expect("Failed to build standard test database")
}

pub async fn setup_test_client(test_db: TestDb) -> (Client, TestDb) {
    let clock: Arc<dyn Clock> = test_db.clock.clone();
    let rocket = init_rocket(test_db.pool.clone(), test_db.config.clone(), clock).await;

    let client = Client::tracked(rocket)
        .await
        .expect("Failed to build Rocket test client");

    (client, test_db)
}

pub async fn login_test_user(client: &Client, username: &str, password: &str) -> String {
    let response = client
        .post("/api/login")
        .header(ContentType::JSON)
        .body(
            json!({
                "username": username,
                "password": password
            })
            .to_string(),
        )
        .dispatch()
        .await;

    let body = response.into_string().await.expect("Empty login response");
    let login: LoginResponse = serde_json::from_str(&body).expect("Malformed login response");

    assert!(
        login.success,
        "Login failed for {}: {:?}",
        username, login.error
    );

    login.token.expect("Successful login without a token")
}

pub fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {}", token))
}
