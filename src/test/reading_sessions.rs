#[cfg(test)]
mod tests {
    use crate::db::{end_reading_session, get_open_session, get_progress, start_reading_session};
    use crate::error::AppError;
    use crate::test::utils::{TestDbBuilder, create_standard_test_db};
    use chrono::Duration;
    use rocket::futures::future::join_all;

    const RACERS: usize = 6;
    const ROUNDS: i64 = 20;

    #[rocket::async_test]
    async fn test_start_opens_a_session() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        let session = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        assert!(session.end_time.is_none());
        assert_eq!(session.user_id, student_id);
        assert_eq!(session.book_id, book_id);
        assert_eq!(session.start_time, test_db.now());
        assert_eq!(session.total_seconds, None);

        let open = get_open_session(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .expect("Session should be open");
        assert_eq!(open.id, session.id);
    }

    #[rocket::async_test]
    async fn test_start_is_idempotent_while_open() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        let first = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        test_db.clock.advance(Duration::seconds(45));

        let second = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.start_time, first.start_time);
        assert_eq!(test_db.count("reading_sessions").await, 1);
    }

    #[rocket::async_test]
    async fn test_end_records_floored_duration() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        let started = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        test_db.clock.advance(Duration::milliseconds(600_999));

        let ended = end_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        assert_eq!(ended.id, started.id);
        assert_eq!(ended.total_seconds, Some(600));
        assert_eq!(ended.end_time, Some(test_db.now()));

        let stored: (Option<i64>,) =
            sqlx::query_as("SELECT total_seconds FROM reading_sessions WHERE id = ?")
                .bind(started.id)
                .fetch_one(&test_db.pool)
                .await
                .unwrap();
        assert_eq!(stored.0, Some(600));
        assert!(
            get_open_session(&test_db.pool, student_id, book_id)
                .await
                .unwrap()
                .is_none()
        );

        let progress = get_progress(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .expect("Ending a session should create progress");
        assert_eq!(progress.total_reading_time, 600);
        assert_eq!(progress.percent_complete, 0.0);
    }

    #[rocket::async_test]
    async fn test_end_without_open_session_is_not_found() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        let result = end_reading_session(&test_db.pool, student_id, book_id, test_db.now()).await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert!(
            get_progress(&test_db.pool, student_id, book_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[rocket::async_test]
    async fn test_second_end_is_not_found_and_time_counts_once() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();
        test_db.clock.advance(Duration::seconds(120));

        end_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        test_db.clock.advance(Duration::seconds(60));
        let second = end_reading_session(&test_db.pool, student_id, book_id, test_db.now()).await;
        assert!(matches!(second, Err(AppError::NotFound(_))));

        let progress = get_progress(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.total_reading_time, 120);
    }

    #[rocket::async_test]
    async fn test_start_after_end_opens_new_session() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        let first = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();
        test_db.clock.advance(Duration::seconds(100));
        end_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        test_db.clock.advance(Duration::seconds(10));
        let second = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.end_time.is_none());

        test_db.clock.advance(Duration::seconds(50));
        end_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        let progress = get_progress(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.total_reading_time, 150);
        assert_eq!(test_db.count("reading_sessions").await, 2);
    }

    #[rocket::async_test]
    async fn test_clock_skew_clamps_to_zero() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();

        let earlier = test_db.now() - Duration::seconds(30);
        let ended = end_reading_session(&test_db.pool, student_id, book_id, earlier)
            .await
            .unwrap();

        assert_eq!(ended.total_seconds, Some(0));

        let progress = get_progress(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.total_reading_time, 0);
    }

    #[rocket::async_test]
    async fn test_pairs_are_independent() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let other_id = test_db.user_id("other_student");
        let web = test_db.book_id("Charlotte's Web");
        let history = test_db.book_id("A Brief History of Time");

        let a = start_reading_session(&test_db.pool, student_id, web, test_db.now())
            .await
            .unwrap();
        let b = start_reading_session(&test_db.pool, student_id, history, test_db.now())
            .await
            .unwrap();
        let c = start_reading_session(&test_db.pool, other_id, web, test_db.now())
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);

        test_db.clock.advance(Duration::seconds(90));
        end_reading_session(&test_db.pool, student_id, web, test_db.now())
            .await
            .unwrap();

        assert!(
            get_open_session(&test_db.pool, student_id, history)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            get_open_session(&test_db.pool, other_id, web)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            get_progress(&test_db.pool, other_id, web)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[rocket::async_test]
    async fn test_parallel_starts_share_one_session() {
        let test_db = TestDbBuilder::new()
            .student("racer", None)
            .book("Charlotte's Web", "English")
            .file_backed(8)
            .build()
            .await
            .unwrap();
        let student_id = test_db.user_id("racer");
        let book_id = test_db.book_id("Charlotte's Web");
        let now = test_db.now();

        let results = join_all(
            (0..RACERS).map(|_| start_reading_session(&test_db.pool, student_id, book_id, now)),
        )
        .await;

        let ids: Vec<i64> = results.into_iter().map(|r| r.unwrap().id).collect();
        assert!(ids.iter().all(|id| *id == ids[0]), "ids diverged: {:?}", ids);
        assert_eq!(test_db.count("reading_sessions").await, 1);

        test_db.close().await;
    }

    #[rocket::async_test]
    async fn test_parallel_ends_close_each_session_once() {
        let test_db = TestDbBuilder::new()
            .student("racer", None)
            .book("Charlotte's Web", "English")
            .file_backed(8)
            .build()
            .await
            .unwrap();
        let student_id = test_db.user_id("racer");
        let book_id = test_db.book_id("Charlotte's Web");
        let elapsed = 30;

        for round in 0..ROUNDS {
            let started = test_db.now();
            let starts = join_all(
                (0..RACERS)
                    .map(|_| start_reading_session(&test_db.pool, student_id, book_id, started)),
            )
            .await;

            let ids: Vec<i64> = starts.into_iter().map(|r| r.unwrap().id).collect();
            assert!(
                ids.iter().all(|id| *id == ids[0]),
                "round {} opened several sessions: {:?}",
                round,
                ids
            );

            test_db.clock.advance(Duration::seconds(elapsed));
            let ended = test_db.now();

            let ends = join_all(
                (0..RACERS).map(|_| end_reading_session(&test_db.pool, student_id, book_id, ended)),
            )
            .await;

            let mut closed = 0;
            for result in ends {
                match result {
                    Ok(session) => {
                        closed += 1;
                        assert_eq!(session.id, ids[0]);
                        assert_eq!(session.total_seconds, Some(elapsed));
                    }
                    Err(AppError::NotFound(_)) => {}
                    Err(other) => panic!("round {} failed unexpectedly: {:?}", round, other),
                }
            }
            assert_eq!(closed, 1, "round {} closed {} times", round, closed);
        }

        let progress = get_progress(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.total_reading_time, ROUNDS * elapsed);
        assert_eq!(test_db.count("reading_sessions").await, ROUNDS);

        test_db.close().await;
    }

    #[rocket::async_test]
    async fn test_failed_accumulation_leaves_session_open() {
        let test_db = create_standard_test_db().await;
        let student_id = test_db.user_id("student_user");
        let book_id = test_db.book_id("Charlotte's Web");

        let started = start_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();
        test_db.clock.advance(Duration::seconds(240));

        sqlx::query(
            "CREATE TRIGGER reject_progress BEFORE INSERT ON progress
             BEGIN SELECT RAISE(ABORT, 'progress writes disabled'); END",
        )
        .execute(&test_db.pool)
        .await
        .unwrap();

        let result = end_reading_session(&test_db.pool, student_id, book_id, test_db.now()).await;
        assert!(
            matches!(result, Err(AppError::Database(_))),
            "expected a database error, got {:?}",
            result
        );

        let still_open = get_open_session(&test_db.pool, student_id, book_id)
            .await
            .unwrap()
            .expect("Session should still be open after the rollback");
        assert_eq!(still_open.id, started.id);
        assert_eq!(still_open.end_time, None);
        assert_eq!(still_open.total_seconds, None);
        assert_eq!(test_db.count("progress").await, 0);

        sqlx::query("DROP TRIGGER reject_progress")
            .execute(&test_db.pool)
            .await
            .unwrap();

        let ended = end_reading_session(&test_db.pool, student_id, book_id, test_db.now())
            .await
            .unwrap();
        assert_eq!(ended.total_seconds, Some(240));
    }
}
