use std::path::Path;

use rocket::State;
use rocket::fs::TempFile;
use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::auth::{AuthUser, Permission};
use crate::config::AppConfig;
use crate::db::{get_book, set_book_content_path};
use crate::error::AppError;
use crate::validation::{ApiError, AppErrorExt, PermissionCheckExt, ValidationResponse};

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_name: String,
    pub path: String,
    pub book_id: Option<i64>,
}

/// File extension for the content types accepted as book assets.
pub fn extension_for(content_type: &ContentType) -> Option<&'static str> {
    if content_type == &ContentType::PDF {
        Some("pdf")
    } else if content_type == &ContentType::Plain {
        Some("txt")
    } else if content_type == &ContentType::PNG {
        Some("png")
    } else if content_type == &ContentType::JPEG {
        Some("jpg")
    } else if content_type == &ContentType::new("application", "epub+zip") {
        Some("epub")
    } else {
        None
    }
}

#[post("/upload?<book_id>", data = "<file>")]
pub async fn api_upload(
    book_id: Option<i64>,
    mut file: TempFile<'_>,
    user: AuthUser,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Custom<Json<UploadResponse>>, ApiError> {
    user.require_permission(Permission::UploadContent)
        .validate_custom()?;

    let Some(extension) = file.content_type().and_then(extension_for) else {
        return Err(Custom(
            Status::BadRequest,
            Json(ValidationResponse::with_error(
                "file",
                "Unsupported file type; expected PDF, EPUB, plain text, PNG or JPEG",
            )),
        ));
    };

    if file.len() == 0 {
        return Err(Custom(
            Status::BadRequest,
            Json(ValidationResponse::with_error("file", "Uploaded file is empty")),
        ));
    }

    if let Some(book_id) = book_id {
        get_book(db, book_id).await.validate_custom()?;
    }

    let upload_dir = Path::new(&config.upload_dir);
    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(AppError::from)
        .validate_custom()?;

    let file_name = format!("{}.{}", Uuid::new_v4(), extension);
    let destination = upload_dir.join(&file_name);

    // copy_to works across filesystems, unlike a rename from the temp dir.
    file.copy_to(&destination)
        .await
        .map_err(AppError::from)
        .validate_custom()?;

    let path = destination.to_string_lossy().into_owned();

    if let Some(book_id) = book_id {
        set_book_content_path(db, book_id, &path)
            .await
            .validate_custom()?;
    }

    tracing::info!(
        username = %user.username,
        file_name = %file_name,
        book_id = ?book_id,
        "Stored uploaded content"
    );

    Ok(Custom(
        Status::Created,
        Json(UploadResponse {
            file_name,
            path,
            book_id,
        }),
    ))
}
