use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub subject: String,
    pub author: Option<String>,
    pub content_path: Option<String>,
    pub created_by: Option<i64>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbBook {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub author: Option<String>,
    pub content_path: Option<String>,
    pub created_by: Option<i64>,
}

impl From<DbBook> for Book {
    fn from(book: DbBook) -> Self {
        Self {
            id: book.id.unwrap_or_default(),
            title: book.title.unwrap_or_default(),
            subject: book.subject.unwrap_or_default(),
            author: book.author,
            content_path: book.content_path,
            created_by: book.created_by,
        }
    }
}

/// A timed reading session. `end_time == None` means the session is open.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSession {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_seconds: Option<i64>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbReadingSession {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub book_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_seconds: Option<i64>,
}

impl From<DbReadingSession> for ReadingSession {
    fn from(session: DbReadingSession) -> Self {
        Self {
            id: session.id.unwrap_or_default(),
            user_id: session.user_id.unwrap_or_default(),
            book_id: session.book_id.unwrap_or_default(),
            start_time: session.start_time.unwrap_or_default(),
            end_time: session.end_time,
            total_seconds: session.total_seconds,
        }
    }
}

/// Whole seconds between `start` and `end`, never negative.
pub fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub id: i64,
    pub user_id: i64,
    pub book_id: i64,
    pub percent_complete: f64,
    /// Cumulative seconds across all closed sessions.
    pub total_reading_time: i64,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Progress {
    pub fn is_complete(&self, threshold: f64) -> bool {
        self.percent_complete >= threshold
    }
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbProgress {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub book_id: Option<i64>,
    pub percent_complete: Option<f64>,
    pub total_reading_time: Option<i64>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl From<DbProgress> for Progress {
    fn from(db: DbProgress) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            user_id: db.user_id.unwrap_or_default(),
            book_id: db.book_id.unwrap_or_default(),
            percent_complete: db.percent_complete.unwrap_or_default(),
            total_reading_time: db.total_reading_time.unwrap_or_default(),
            last_read_at: db.last_read_at,
        }
    }
}

/// Progress joined with the book it belongs to, for the student dashboard.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BookProgress {
    pub book_id: i64,
    pub title: String,
    pub subject: String,
    pub percent_complete: f64,
    pub total_reading_time: i64,
    pub last_read_at: Option<DateTime<Utc>>,
    pub completed: bool,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbBookProgress {
    pub book_id: Option<i64>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub percent_complete: Option<f64>,
    pub total_reading_time: Option<i64>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl DbBookProgress {
    pub fn into_book_progress(self, threshold: f64) -> BookProgress {
        let percent_complete = self.percent_complete.unwrap_or_default();
        BookProgress {
            book_id: self.book_id.unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            subject: self.subject.unwrap_or_default(),
            percent_complete,
            total_reading_time: self.total_reading_time.unwrap_or_default(),
            last_read_at: self.last_read_at,
            completed: percent_complete >= threshold,
        }
    }
}

/// Raw counts read from the store before any averaging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsTotals {
    pub closed_sessions: i64,
    pub total_seconds: i64,
    /// Closed sessions with a positive duration, and their summed seconds.
    pub timed_sessions: i64,
    pub timed_seconds: i64,
    pub readers: i64,
    pub completers: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    /// Seconds, rounded.
    pub avg_reading_time: i64,
    /// Whole percent.
    pub completion_rate: i64,
    pub total_sessions: i64,
    pub total_reading_seconds: i64,
    pub total_reading_minutes: i64,
}

impl DashboardStats {
    pub fn from_totals(totals: StatsTotals, fallback_avg_reading_time: i64) -> Self {
        let avg_reading_time = if totals.timed_sessions > 0 {
            (totals.timed_seconds as f64 / totals.timed_sessions as f64).round() as i64
        } else {
            fallback_avg_reading_time
        };

        let completion_rate = if totals.readers > 0 {
            (totals.completers as f64 * 100.0 / totals.readers as f64).round() as i64
        } else {
            0
        };

        Self {
            avg_reading_time,
            completion_rate,
            total_sessions: totals.closed_sessions,
            total_reading_seconds: totals.total_seconds,
            total_reading_minutes: totals.total_seconds / 60,
        }
    }
}
