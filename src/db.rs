use crate::{
    auth::{ApprovalStatus, DbUser, Role, User},
    error::AppError,
};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tracing::{info, instrument, warn};

use crate::models::{
    Book, BookProgress, DashboardStats, DbBook, DbBookProgress, DbProgress, DbReadingSession,
    Progress, ReadingSession, StatsTotals, elapsed_seconds,
};

const USER_COLUMNS: &str = "id, username, role, display_name, approval_status, created_at";
const SESSION_COLUMNS: &str = "id, user_id, book_id, start_time, end_time, total_seconds";
const PROGRESS_COLUMNS: &str =
    "id, user_id, book_id, percent_complete, total_reading_time, last_read_at";

pub struct NewUser<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub role: Role,
    pub display_name: Option<&'a str>,
    pub approval_status: ApprovalStatus,
    pub security_question: Option<&'a str>,
    pub security_answer: Option<&'a str>,
}

fn normalize_answer(answer: &str) -> String {
    answer.trim().to_lowercase()
}

#[instrument]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {} FROM users WHERE id = ?",
        USER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(user) => User::try_from(user),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument]
pub async fn find_user_by_username(
    pool: &Pool<Sqlite>,
    username: &str,
) -> Result<Option<User>, AppError> {
    info!("Finding user by username");
    let row = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {} FROM users WHERE username = ?",
        USER_COLUMNS
    ))
    .bind(username)
    .fetch_optional(pool)
    .await?;

    row.map(User::try_from).transpose()
}

#[instrument(skip_all, fields(username = %new_user.username, role = %new_user.role))]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    new_user: NewUser<'_>,
    bcrypt_cost: u32,
) -> Result<i64, AppError> {
    info!("Creating new user");

    let existing_user = sqlx::query("SELECT id FROM users WHERE username = ?")
        .bind(new_user.username)
        .fetch_optional(pool)
        .await?;

    if existing_user.is_some() {
        return Err(AppError::Conflict(format!(
            "Username '{}' already exists",
            new_user.username
        )));
    }

    let hashed_password = bcrypt::hash(new_user.password, bcrypt_cost)?;
    let hashed_answer = match new_user.security_answer {
        Some(answer) => Some(bcrypt::hash(normalize_answer(answer), bcrypt_cost)?),
        None => None,
    };

    let res = sqlx::query(
        "INSERT INTO users
         (username, password, role, display_name, approval_status, security_question, security_answer)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new_user.username)
    .bind(hashed_password)
    .bind(new_user.role.as_str())
    .bind(new_user.display_name)
    .bind(new_user.approval_status.as_str())
    .bind(new_user.security_question)
    .bind(hashed_answer)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip_all, fields(username))]
pub async fn authenticate_user(
    pool: &Pool<Sqlite>,
    username: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let row = sqlx::query("SELECT id, password FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id: i64 = row.try_get("id")?;
    let hash: String = row.try_get("password")?;

    // A malformed stored hash is treated as a failed login.
    match bcrypt::verify(password, &hash) {
        Ok(true) => Ok(Some(get_user(pool, id).await?)),
        _ => Ok(None),
    }
}

#[instrument(skip_all, fields(user_id))]
pub async fn update_user_password(
    pool: &Pool<Sqlite>,
    user_id: i64,
    new_password: &str,
    bcrypt_cost: u32,
) -> Result<(), AppError> {
    info!("Updating user password");
    let hashed_password = bcrypt::hash(new_password, bcrypt_cost)?;

    let result = sqlx::query("UPDATE users SET password = ? WHERE id = ?")
        .bind(hashed_password)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("User with id {} not found", user_id)));
    }

    Ok(())
}

#[instrument]
pub async fn get_security_question(
    pool: &Pool<Sqlite>,
    username: &str,
) -> Result<String, AppError> {
    info!("Fetching security question");
    let row = sqlx::query("SELECT security_question FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    let question: Option<String> = match row {
        Some(row) => row.try_get("security_question")?,
        None => None,
    };

    question
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| AppError::NotFound("No security question for this account".to_string()))
}

/// Returns the user id when the answer matches the stored one.
#[instrument(skip_all, fields(username))]
pub async fn verify_security_answer(
    pool: &Pool<Sqlite>,
    username: &str,
    answer: &str,
) -> Result<Option<i64>, AppError> {
    info!("Verifying security answer");
    let row = sqlx::query("SELECT id, security_answer FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id: i64 = row.try_get("id")?;
    let stored: Option<String> = row.try_get("security_answer")?;

    match stored {
        Some(hash) => match bcrypt::verify(normalize_answer(answer), &hash) {
            Ok(true) => Ok(Some(id)),
            _ => Ok(None),
        },
        None => Ok(None),
    }
}

#[instrument]
pub async fn set_approval_status(
    pool: &Pool<Sqlite>,
    user_id: i64,
    status: ApprovalStatus,
) -> Result<(), AppError> {
    info!("Setting approval status");
    let result = sqlx::query("UPDATE users SET approval_status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("User with id {} not found", user_id)));
    }

    Ok(())
}

#[instrument]
pub async fn get_pending_users(pool: &Pool<Sqlite>) -> Result<Vec<User>, AppError> {
    info!("Getting users awaiting approval");
    let rows = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {} FROM users WHERE approval_status = 'pending' ORDER BY created_at, id",
        USER_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(User::try_from).collect()
}

#[instrument]
pub async fn admin_exists(pool: &Pool<Sqlite>) -> Result<bool, AppError> {
    let row = sqlx::query("SELECT COUNT(*) AS admins FROM users WHERE role = 'admin'")
        .fetch_one(pool)
        .await?;

    let admins: i64 = row.try_get("admins")?;
    Ok(admins > 0)
}

#[instrument]
pub async fn create_book(
    pool: &Pool<Sqlite>,
    title: &str,
    subject: &str,
    author: Option<&str>,
    created_by: Option<i64>,
) -> Result<i64, AppError> {
    info!("Creating book");
    let res = sqlx::query(
        "INSERT INTO books (title, subject, author, created_by)
         VALUES (?, ?, ?, ?)",
    )
    .bind(title)
    .bind(subject)
    .bind(author)
    .bind(created_by)
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument]
pub async fn get_book(pool: &Pool<Sqlite>, id: i64) -> Result<Book, AppError> {
    info!("Getting book");
    let row = sqlx::query_as::<_, DbBook>(
        "SELECT id, title, subject, author, content_path, created_by FROM books WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Book::from)
        .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
}

#[instrument]
pub async fn set_book_content_path(
    pool: &Pool<Sqlite>,
    book_id: i64,
    content_path: &str,
) -> Result<(), AppError> {
    info!("Attaching content to book");
    let result = sqlx::query("UPDATE books SET content_path = ? WHERE id = ?")
        .bind(content_path)
        .bind(book_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Book with id {} not found", book_id)));
    }

    Ok(())
}

/// Opens a reading session for the pair, or returns the one already open.
///
/// The partial unique index on open sessions makes the insert a no-op when a
/// session is already open, so concurrent starts converge on the same row.
#[instrument]
pub async fn start_reading_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    book_id: i64,
    now: DateTime<Utc>,
) -> Result<ReadingSession, AppError> {
    info!("Starting reading session");
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO reading_sessions (user_id, book_id, start_time)
         VALUES (?, ?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(user_id)
    .bind(book_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let session = sqlx::query_as::<_, DbReadingSession>(&format!(
        "SELECT {} FROM reading_sessions
         WHERE user_id = ? AND book_id = ? AND end_time IS NULL",
        SESSION_COLUMNS
    ))
    .bind(user_id)
    .bind(book_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::Internal("Open reading session vanished after insert".to_string()))?;

    tx.commit().await?;

    let session = ReadingSession::from(session);
    if inserted.rows_affected() == 0 {
        info!(session_id = session.id, "Reading session already open");
    } else {
        info!(session_id = session.id, "Reading session opened");
    }

    Ok(session)
}

/// Closes the open session for the pair and folds its duration into progress.
///
/// The close is claimed with a conditional update on `end_time IS NULL`, so of
/// two racing calls only one sees the row. Claim, duration and progress are
/// committed together.
#[instrument]
pub async fn end_reading_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    book_id: i64,
    now: DateTime<Utc>,
) -> Result<ReadingSession, AppError> {
    info!("Ending reading session");
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, DbReadingSession>(&format!(
        "UPDATE reading_sessions SET end_time = ?
         WHERE user_id = ? AND book_id = ? AND end_time IS NULL
         RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(now)
    .bind(user_id)
    .bind(book_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(claimed) = claimed else {
        return Err(AppError::NotFound("No active reading session".to_string()));
    };

    let mut session = ReadingSession::from(claimed);
    let elapsed = elapsed_seconds(session.start_time, now);
    if session.start_time > now {
        warn!(session_id = session.id, "Session start is after its end, clamping to zero");
    }

    sqlx::query("UPDATE reading_sessions SET total_seconds = ? WHERE id = ?")
        .bind(elapsed)
        .bind(session.id)
        .execute(&mut *tx)
        .await?;

    accumulate_progress(&mut tx, user_id, book_id, elapsed, now).await?;

    tx.commit().await?;

    session.end_time = Some(now);
    session.total_seconds = Some(elapsed);
    info!(session_id = session.id, total_seconds = elapsed, "Reading session closed");

    Ok(session)
}

/// Adds `elapsed_seconds` to the pair's cumulative reading time, creating the
/// progress row at 0% if it does not exist yet. Single atomic upsert.
#[instrument(skip(conn))]
pub async fn accumulate_progress(
    conn: &mut SqliteConnection,
    user_id: i64,
    book_id: i64,
    elapsed_seconds: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    info!("Accumulating reading time");
    sqlx::query(
        "INSERT INTO progress (user_id, book_id, percent_complete, total_reading_time, last_read_at)
         VALUES (?, ?, 0, ?, ?)
         ON CONFLICT (user_id, book_id) DO UPDATE SET
             total_reading_time = progress.total_reading_time + excluded.total_reading_time,
             last_read_at = excluded.last_read_at",
    )
    .bind(user_id)
    .bind(book_id)
    .bind(elapsed_seconds.max(0))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[instrument]
pub async fn get_open_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    book_id: i64,
) -> Result<Option<ReadingSession>, AppError> {
    let row = sqlx::query_as::<_, DbReadingSession>(&format!(
        "SELECT {} FROM reading_sessions
         WHERE user_id = ? AND book_id = ? AND end_time IS NULL",
        SESSION_COLUMNS
    ))
    .bind(user_id)
    .bind(book_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(ReadingSession::from))
}

#[instrument]
pub async fn get_progress(
    pool: &Pool<Sqlite>,
    user_id: i64,
    book_id: i64,
) -> Result<Option<Progress>, AppError> {
    let row = sqlx::query_as::<_, DbProgress>(&format!(
        "SELECT {} FROM progress WHERE user_id = ? AND book_id = ?",
        PROGRESS_COLUMNS
    ))
    .bind(user_id)
    .bind(book_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Progress::from))
}

/// Records how far through the book the reader is. Reading time is untouched.
#[instrument]
pub async fn update_percent_complete(
    pool: &Pool<Sqlite>,
    user_id: i64,
    book_id: i64,
    percent_complete: f64,
    now: DateTime<Utc>,
) -> Result<Progress, AppError> {
    info!("Updating percent complete");
    let row = sqlx::query_as::<_, DbProgress>(&format!(
        "INSERT INTO progress (user_id, book_id, percent_complete, total_reading_time, last_read_at)
         VALUES (?, ?, ?, 0, ?)
         ON CONFLICT (user_id, book_id) DO UPDATE SET
             percent_complete = excluded.percent_complete,
             last_read_at = excluded.last_read_at
         RETURNING {}",
        PROGRESS_COLUMNS
    ))
    .bind(user_id)
    .bind(book_id)
    .bind(percent_complete)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(Progress::from(row))
}

#[instrument]
pub async fn get_student_progress(
    pool: &Pool<Sqlite>,
    user_id: i64,
    completion_threshold: f64,
) -> Result<Vec<BookProgress>, AppError> {
    info!("Getting student progress");
    let rows = sqlx::query_as::<_, DbBookProgress>(
        "SELECT p.book_id, b.title, b.subject, p.percent_complete,
                p.total_reading_time, p.last_read_at
         FROM progress p
         JOIN books b ON b.id = p.book_id
         WHERE p.user_id = ?
         ORDER BY p.last_read_at DESC, p.book_id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| row.into_book_progress(completion_threshold))
        .collect())
}

#[instrument]
pub async fn load_stats_totals(
    pool: &Pool<Sqlite>,
    completion_threshold: f64,
) -> Result<StatsTotals, AppError> {
    // Both reads see the same snapshot.
    let mut tx = pool.begin().await?;

    let (closed_sessions, total_seconds, timed_sessions, timed_seconds) =
        sqlx::query_as::<_, (i64, i64, i64, i64)>(
            "SELECT
                 COUNT(*),
                 COALESCE(SUM(total_seconds), 0),
                 COUNT(CASE WHEN total_seconds > 0 THEN 1 END),
                 COALESCE(SUM(CASE WHEN total_seconds > 0 THEN total_seconds END), 0)
             FROM reading_sessions
             WHERE end_time IS NOT NULL",
        )
        .fetch_one(&mut *tx)
        .await?;

    let (readers, completers) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT
             COUNT(DISTINCT user_id),
             COUNT(DISTINCT CASE WHEN percent_complete >= ? THEN user_id END)
         FROM progress",
    )
    .bind(completion_threshold)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(StatsTotals {
        closed_sessions,
        total_seconds,
        timed_sessions,
        timed_seconds,
        readers,
        completers,
    })
}

#[instrument]
pub async fn compute_dashboard_stats(
    pool: &Pool<Sqlite>,
    completion_threshold: f64,
    fallback_avg_reading_time: i64,
) -> Result<DashboardStats, AppError> {
    info!("Computing dashboard stats");
    let totals = load_stats_totals(pool, completion_threshold).await?;

    Ok(DashboardStats::from_totals(totals, fallback_avg_reading_time))
}
