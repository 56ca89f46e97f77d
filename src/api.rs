use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::State;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use sqlx::{Pool, Sqlite};
use validator::Validate;

use crate::auth::token::issue_token;
use crate::auth::{ApprovalStatus, AuthUser, Permission, Role, User};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::{
    NewUser, authenticate_user, compute_dashboard_stats, create_book, create_user,
    end_reading_session, find_user_by_username, get_book, get_open_session, get_pending_users,
    get_security_question, get_student_progress, set_approval_status,
    start_reading_session, update_percent_complete, update_user_password,
    verify_security_answer,
};
use crate::models::{Book, BookProgress, DashboardStats, Progress, ReadingSession};
use crate::validation::{
    ApiError, AppErrorExt, JsonValidateExt, PermissionCheckExt, USERNAME_RE, ValidationResponse,
};

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    username: String,
    #[validate(length(min = 1, message = "Password is required"))]
    password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    pub token: Option<String>,
    pub user: Option<UserData>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub approval_status: String,
}

impl From<User> for UserData {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            role: user.role.to_string(),
            approval_status: user.approval_status.to_string(),
        }
    }
}

#[post("/login", data = "<login>")]
pub async fn api_login(
    login: Json<LoginRequest>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
    clock: &State<Arc<dyn Clock>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let validated = login.validate_custom()?;

    let user = authenticate_user(db, &validated.username, &validated.password)
        .await
        .validate_custom()?;

    let Some(user) = user else {
        return Ok(Json(LoginResponse {
            success: false,
            token: None,
            user: None,
            error: Some("Invalid username or password".to_string()),
        }));
    };

    let refusal = match user.approval_status {
        ApprovalStatus::Approved => None,
        ApprovalStatus::Pending => Some("Account is awaiting approval"),
        ApprovalStatus::Rejected => Some("Account registration was rejected"),
    };

    if let Some(reason) = refusal {
        tracing::warn!(username = %user.username, approval_status = %user.approval_status, "Login refused");
        return Ok(Json(LoginResponse {
            success: false,
            token: None,
            user: None,
            error: Some(reason.to_string()),
        }));
    }

    let token = issue_token(&user, &config.jwt_secret, config.token_ttl_hours, clock.now())
        .validate_custom()?;

    Ok(Json(LoginResponse {
        success: true,
        token: Some(token),
        user: Some(UserData::from(user)),
        error: None,
    }))
}

#[get("/me")]
pub async fn api_me(user: AuthUser) -> Json<UserData> {
    Json(UserData::from(user.0))
}

#[derive(Deserialize, Validate, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistrationRequest {
    #[validate(regex(
        path = *USERNAME_RE,
        message = "Username must be 3-32 letters, digits, '.', '_' or '-'"
    ))]
    username: String,
    #[validate(length(min = 1, max = 64, message = "Display name must be 1-64 characters"))]
    display_name: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    password: String,
    role: String,
    #[validate(length(min = 1, max = 200, message = "Security question is required"))]
    security_question: String,
    #[validate(length(min = 1, max = 200, message = "Security answer is required"))]
    security_answer: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: i64,
    pub approval_status: String,
}

#[post("/register", data = "<registration>")]
pub async fn api_register_user(
    registration: Json<UserRegistrationRequest>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Custom<Json<RegistrationResponse>>, ApiError> {
    let validated = registration.validate_custom()?;

    // Students can start reading straight away, teachers wait for an admin.
    let (role, approval_status) = match validated.role.as_str() {
        "student" => (Role::Student, ApprovalStatus::Approved),
        "teacher" => (Role::Teacher, ApprovalStatus::Pending),
        _ => {
            return Err(Custom(
                Status::BadRequest,
                Json(ValidationResponse::with_error(
                    "role",
                    "Role must be 'student' or 'teacher'",
                )),
            ));
        }
    };

    let existing_user = find_user_by_username(db, &validated.username)
        .await
        .validate_custom()?;

    if existing_user.is_some() {
        return Err(Custom(
            Status::Conflict,
            Json(ValidationResponse::with_error(
                "username",
                "Username already exists",
            )),
        ));
    }

    let id = create_user(
        db,
        NewUser {
            username: &validated.username,
            password: &validated.password,
            role,
            display_name: Some(&validated.display_name),
            approval_status,
            security_question: Some(&validated.security_question),
            security_answer: Some(&validated.security_answer),
        },
        config.bcrypt_cost,
    )
    .await
    .validate_custom()?;

    Ok(Custom(
        Status::Created,
        Json(RegistrationResponse {
            id,
            approval_status: approval_status.to_string(),
        }),
    ))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangeRequest {
    current_password: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    new_password: String,
}

#[post("/change-password", data = "<password>")]
pub async fn api_change_password(
    password: Json<PasswordChangeRequest>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::ChangeOwnPassword)
        .validate_custom()?;

    let validated = password.validate_custom()?;

    let is_valid = authenticate_user(db, &user.username, &validated.current_password)
        .await
        .validate_custom()?;

    match is_valid {
        Some(_) => {
            update_user_password(db, user.id, &validated.new_password, config.bcrypt_cost)
                .await
                .validate_custom()?;

            Ok(Status::Ok)
        }
        _ => Err(Custom(
            Status::Unauthorized,
            Json(ValidationResponse::with_error(
                "currentPassword",
                "Current password is incorrect",
            )),
        )),
    }
}

#[derive(Deserialize, Validate)]
pub struct SecurityQuestionRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    username: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityQuestionResponse {
    pub security_question: String,
}

#[post("/password-reset/question", data = "<request>")]
pub async fn api_security_question(
    request: Json<SecurityQuestionRequest>,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<SecurityQuestionResponse>, ApiError> {
    let validated = request.validate_custom()?;

    let security_question = get_security_question(db, &validated.username)
        .await
        .validate_custom()?;

    Ok(Json(SecurityQuestionResponse { security_question }))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    username: String,
    #[validate(length(min = 1, message = "Security answer is required"))]
    security_answer: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    new_password: String,
}

#[post("/password-reset", data = "<request>")]
pub async fn api_reset_password(
    request: Json<PasswordResetRequest>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Status, ApiError> {
    let validated = request.validate_custom()?;

    let user_id = verify_security_answer(db, &validated.username, &validated.security_answer)
        .await
        .validate_custom()?;

    match user_id {
        Some(user_id) => {
            update_user_password(db, user_id, &validated.new_password, config.bcrypt_cost)
                .await
                .validate_custom()?;

            tracing::info!(username = %validated.username, "Password reset via security question");
            Ok(Status::Ok)
        }
        None => Err(Custom(
            Status::Unauthorized,
            Json(ValidationResponse::with_error(
                "securityAnswer",
                "Security answer is incorrect",
            )),
        )),
    }
}

#[get("/admin/users/pending")]
pub async fn api_get_pending_users(
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<UserData>>, Status> {
    user.require_permission(Permission::ApproveUsers)?;

    let users = get_pending_users(db).await?;

    Ok(Json(users.into_iter().map(UserData::from).collect()))
}

#[derive(Deserialize)]
pub struct ApprovalRequest {
    status: String,
}

#[put("/admin/users/<id>/approval", data = "<request>")]
pub async fn api_set_approval(
    id: i64,
    request: Json<ApprovalRequest>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
) -> Result<Status, ApiError> {
    user.require_permission(Permission::ApproveUsers)
        .validate_custom()?;

    let status = match request.status.as_str() {
        "approved" => ApprovalStatus::Approved,
        "rejected" => ApprovalStatus::Rejected,
        _ => {
            return Err(Custom(
                Status::BadRequest,
                Json(ValidationResponse::with_error(
                    "status",
                    "Status must be 'approved' or 'rejected'",
                )),
            ));
        }
    };

    set_approval_status(db, id, status).await.validate_custom()?;

    tracing::info!(admin = %user.username, user_id = id, status = %status, "Approval status changed");
    Ok(Status::Ok)
}

#[derive(Deserialize, Validate)]
pub struct CreateBookRequest {
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    title: String,
    #[validate(length(min = 1, max = 100, message = "Subject is required"))]
    subject: String,
    author: Option<String>,
}

#[post("/books", data = "<request>")]
pub async fn api_create_book(
    request: Json<CreateBookRequest>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<Book>>, ApiError> {
    user.require_permission(Permission::ManageBooks)
        .validate_custom()?;

    let validated = request.validate_custom()?;

    let id = create_book(
        db,
        &validated.title,
        &validated.subject,
        validated.author.as_deref(),
        Some(user.id),
    )
    .await
    .validate_custom()?;

    let book = get_book(db, id).await.validate_custom()?;

    Ok(Custom(Status::Created, Json(book)))
}

#[get("/books/<id>")]
pub async fn api_get_book(
    id: i64,
    _user: AuthUser,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Book>, Status> {
    let book = get_book(db, id).await?;
    Ok(Json(book))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSessionRequest {
    #[validate(
        required(message = "bookId is required"),
        range(min = 1, message = "bookId must be a positive id")
    )]
    book_id: Option<i64>,
}

impl ReadingSessionRequest {
    fn book_id(&self) -> i64 {
        self.book_id.unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: i64,
    pub start_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionResponse {
    pub session_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_seconds: i64,
}

#[post("/reading-sessions/start", data = "<request>")]
pub async fn api_start_reading_session(
    request: Json<ReadingSessionRequest>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    clock: &State<Arc<dyn Clock>>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    user.require_permission(Permission::TrackReading)
        .validate_custom()?;

    let validated = request.validate_custom()?;
    let book_id = validated.book_id();

    get_book(db, book_id).await.validate_custom()?;

    let session = start_reading_session(db, user.id, book_id, clock.now())
        .await
        .validate_custom()?;

    Ok(Json(StartSessionResponse {
        session_id: session.id,
        start_time: session.start_time,
    }))
}

#[post("/reading-sessions/end", data = "<request>")]
pub async fn api_end_reading_session(
    request: Json<ReadingSessionRequest>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    clock: &State<Arc<dyn Clock>>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    user.require_permission(Permission::TrackReading)
        .validate_custom()?;

    let validated = request.validate_custom()?;

    let session = end_reading_session(db, user.id, validated.book_id(), clock.now())
        .await
        .validate_custom()?;

    let now = clock.now();
    Ok(Json(EndSessionResponse {
        session_id: session.id,
        start_time: session.start_time,
        end_time: session.end_time.unwrap_or(now),
        total_seconds: session.total_seconds.unwrap_or_default(),
    }))
}

/// The caller's open session on a book, for clients resuming after a reload.
#[get("/reading-sessions/active?<book_id>")]
pub async fn api_active_reading_session(
    book_id: i64,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ReadingSession>, ApiError> {
    user.require_permission(Permission::TrackReading)
        .validate_custom()?;

    match get_open_session(db, user.id, book_id).await.validate_custom()? {
        Some(session) => Ok(Json(session)),
        None => Err(Custom(
            Status::NotFound,
            Json(ValidationResponse::with_error(
                "resource",
                "No active reading session",
            )),
        )),
    }
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdateRequest {
    #[validate(
        required(message = "bookId is required"),
        range(min = 1, message = "bookId must be a positive id")
    )]
    book_id: Option<i64>,
    #[validate(
        required(message = "percentComplete is required"),
        range(min = 0.0, max = 100.0, message = "percentComplete must be between 0 and 100")
    )]
    percent_complete: Option<f64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    #[serde(flatten)]
    pub progress: Progress,
    pub completed: bool,
}

#[put("/progress", data = "<request>")]
pub async fn api_update_progress(
    request: Json<ProgressUpdateRequest>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
    clock: &State<Arc<dyn Clock>>,
) -> Result<Json<ProgressResponse>, ApiError> {
    user.require_permission(Permission::TrackReading)
        .validate_custom()?;

    let validated = request.validate_custom()?;
    let book_id = validated.book_id.unwrap_or_default();
    let percent_complete = validated.percent_complete.unwrap_or_default();

    get_book(db, book_id).await.validate_custom()?;

    let progress = update_percent_complete(db, user.id, book_id, percent_complete, clock.now())
        .await
        .validate_custom()?;

    let completed = progress.is_complete(config.completion_threshold);
    Ok(Json(ProgressResponse {
        progress,
        completed,
    }))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDashboardResponse {
    pub books_started: usize,
    pub books_completed: usize,
    pub total_reading_time: i64,
    pub books: Vec<BookProgress>,
}

#[get("/dashboard/student")]
pub async fn api_student_dashboard(
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Json<StudentDashboardResponse>, Status> {
    user.require_permission(Permission::ViewOwnProgress)?;

    let books = get_student_progress(db, user.id, config.completion_threshold).await?;

    Ok(Json(StudentDashboardResponse {
        books_started: books.len(),
        books_completed: books.iter().filter(|b| b.completed).count(),
        total_reading_time: books.iter().map(|b| b.total_reading_time).sum(),
        books,
    }))
}

#[get("/dashboard/stats")]
pub async fn api_dashboard_stats(
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Json<DashboardStats>, Status> {
    user.require_permission(Permission::ViewDashboardStats)?;

    let stats = compute_dashboard_stats(
        db,
        config.completion_threshold,
        config.fallback_avg_reading_time,
    )
    .await?;

    Ok(Json(stats))
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}
