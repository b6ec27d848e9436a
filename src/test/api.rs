#[cfg(test)]
mod tests {
    use rocket::http::{ContentType, Header, Status};
    use serde_json::{Value, json};

    use crate::error::AppError;
    use crate::test::test_utils::{
        STANDARD_ANSWER_KEY, STANDARD_COURSE, create_standard_test_db, setup_test_client,
    };
    use crate::validation::ToValidationResponse;

    fn bearer(token: String) -> Header<'static> {
        Header::new("Authorization", token)
    }

    #[test]
    fn test_status_and_error_bodies_name_the_failing_field() {
        let forbidden = Status::Forbidden.to_validation_response();
        assert_eq!(forbidden.0, Status::Forbidden);
        assert_eq!(forbidden.1.status, "error");
        assert!(forbidden.1.errors.contains_key("permission"));

        let missing = Status::NotFound.to_validation_response();
        assert_eq!(missing.0, Status::NotFound);
        assert_eq!(missing.1.errors["resource"], vec!["Resource not found".to_string()]);

        let unauthorized = Status::Unauthorized.to_validation_response();
        assert!(unauthorized.1.errors.contains_key("authentication"));

        let teapot = Status::ImATeapot.to_validation_response();
        assert_eq!(teapot.0, Status::ImATeapot);
        assert!(teapot.1.errors.contains_key("server"));

        let conflict = AppError::Conflict("reset pending".into()).to_validation_response();
        assert_eq!(conflict.0, Status::Conflict);
        assert_eq!(conflict.1.errors["resource"], vec!["reset pending".to_string()]);

        let hidden = AppError::Internal("pool exhausted".into()).to_validation_response();
        assert_eq!(hidden.0, Status::InternalServerError);
        assert!(!hidden.1.errors["server"][0].contains("pool"));
    }

    #[rocket::async_test]
    async fn test_health() {
        let test_db = create_standard_test_db().await;
        let (client, _) = setup_test_client(test_db).await;

        let response = client.get("/api/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.unwrap(), "OK");
    }

    #[rocket::async_test]
    async fn test_auth_required_apis() {
        let test_db = create_standard_test_db().await;
        let (client, _) = setup_test_client(test_db).await;

        let endpoints = vec![
            "/api/gamification/me",
            "/api/gamification/me/events",
            "/api/certificates",
            "/api/courses/1/progress",
        ];

        for endpoint in endpoints {
            let response = client.get(endpoint).dispatch().await;
            assert_eq!(
                response.status(),
                Status::Unauthorized,
                "Endpoint {} did not require authentication",
                endpoint
            );
        }

        let response = client
            .get("/api/gamification/me")
            .header(Header::new("Authorization", "Bearer not-a-session"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["error"], "Unauthorized");
    }

    #[rocket::async_test]
    async fn test_complete_lesson_api() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let lesson = test_db.lesson_ids(test_db.module_ids(STANDARD_COURSE)[0])[0];

        let response = client
            .post("/api/progress/complete")
            .header(ContentType::JSON)
            .header(bearer(test_db.token("alice")))
            .body(json!({ "lessonId": lesson, "watchTimeSeconds": 60 }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["alreadyCompleted"], false);
        assert_eq!(body["progressPercentage"], 25);
        assert_eq!(body["xpAwarded"], 10);
        assert_eq!(body["badgesUnlocked"], json!(["First Steps"]));

        let response = client
            .get("/api/gamification/me")
            .header(bearer(test_db.token("alice")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["stats"]["totalXp"], 10);
        assert_eq!(body["level"]["xpToNextLevel"], 90);
        assert_eq!(body["badges"][0]["name"], "First Steps");
    }

    #[rocket::async_test]
    async fn test_complete_lesson_rejections() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let modules = test_db.module_ids(STANDARD_COURSE);
        let first = test_db.lesson_ids(modules[0])[0];
        let locked = test_db.lesson_ids(modules[1])[0];

        let cases = vec![
            ("bob", json!({ "lessonId": first }), Status::Forbidden),
            ("alice", json!({ "lessonId": locked }), Status::Forbidden),
            ("alice", json!({ "lessonId": 9999 }), Status::NotFound),
            (
                "alice",
                json!({ "lessonId": first, "watchTimeSeconds": -5 }),
                Status::UnprocessableEntity,
            ),
        ];

        for (username, body, expected) in cases {
            let response = client
                .post("/api/progress/complete")
                .header(ContentType::JSON)
                .header(bearer(test_db.token(username)))
                .body(body.to_string())
                .dispatch()
                .await;
            assert_eq!(response.status(), expected, "{} {}", username, body);
        }
    }

    #[rocket::async_test]
    async fn test_quiz_answers_need_permission() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let module = test_db.module_ids(STANDARD_COURSE)[0];

        let response = client
            .get(format!("/api/quiz/{}/questions", module))
            .header(bearer(test_db.token("alice")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        let questions = body.as_array().unwrap();
        assert_eq!(questions.len(), 5);
        assert!(questions.iter().all(|q| q["correctAnswer"] == -1));
        assert!(questions.iter().all(|q| q["explanation"].is_null()));

        let response = client
            .get(format!("/api/quiz/{}/questions?includeAnswers=true", module))
            .header(bearer(test_db.token("alice")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .get(format!("/api/quiz/{}/questions?includeAnswers=true", module))
            .header(bearer(test_db.token("ivan")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        let keys: Vec<i64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|q| q["correctAnswer"].as_i64().unwrap())
            .collect();
        assert_eq!(keys, STANDARD_ANSWER_KEY.to_vec());
    }

    #[rocket::async_test]
    async fn test_submit_quiz_api() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let module = test_db.module_ids(STANDARD_COURSE)[0];
        let answers: Vec<Value> = test_db
            .question_ids(module)
            .iter()
            .zip(STANDARD_ANSWER_KEY.iter())
            .map(|(id, key)| json!({ "questionId": id, "selectedAnswer": key }))
            .collect();

        let response = client
            .post(format!("/api/quiz/{}/submit", module))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("alice")))
            .body(json!({ "answers": answers }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["score"], 100);
        assert_eq!(body["passed"], true);
        assert_eq!(body["xpAwarded"], 50);

        let response = client
            .post(format!("/api/quiz/{}/submit", module))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("alice")))
            .body(json!({ "answers": [] }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);

        let response = client
            .get(format!("/api/quiz/{}/attempts", module))
            .header(bearer(test_db.token("alice")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["attempts"].as_array().unwrap().len(), 1);
        assert_eq!(body["bestAttempt"]["score"], 100);
    }

    #[rocket::async_test]
    async fn test_admin_routes_need_admin() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let alice = test_db.user_id("alice");
        let course = test_db.course_id(STANDARD_COURSE);

        for username in ["alice", "ivan"] {
            let response = client
                .post(format!("/api/admin/users/{}/reset-course", alice))
                .header(ContentType::JSON)
                .header(bearer(test_db.token(username)))
                .body(json!({ "courseId": course }).to_string())
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Forbidden, "{}", username);

            let response = client
                .post(format!("/api/admin/users/{}/xp-adjustment", alice))
                .header(ContentType::JSON)
                .header(bearer(test_db.token(username)))
                .body(json!({ "amount": 500, "description": "Generous" }).to_string())
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Forbidden, "{}", username);
        }
    }

    #[rocket::async_test]
    async fn test_admin_adjust_reset_and_reconcile() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let alice = test_db.user_id("alice");
        let course = test_db.course_id(STANDARD_COURSE);
        let lesson = test_db.lesson_ids(test_db.module_ids(STANDARD_COURSE)[0])[0];

        client
            .post("/api/progress/complete")
            .header(ContentType::JSON)
            .header(bearer(test_db.token("alice")))
            .body(json!({ "lessonId": lesson }).to_string())
            .dispatch()
            .await;

        let response = client
            .post(format!("/api/admin/users/{}/xp-adjustment", alice))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("ada")))
            .body(json!({ "amount": 25, "description": "Workshop bonus" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["userId"], alice);
        assert_eq!(body["totalXp"], 35);

        let response = client
            .post(format!("/api/admin/users/{}/reset-course", alice))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("ada")))
            .body(json!({ "courseId": course }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["completed"], true);
        assert_eq!(body["summary"]["xpDeducted"], 10);
        assert_eq!(body["summary"]["lessonsReset"], 1);

        let response = client
            .post(format!("/api/admin/users/{}/reconcile", alice))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("ada")))
            .body(json!({ "repair": false }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["drift"], json!([]));

        let response = client
            .get("/api/gamification/me")
            .header(bearer(test_db.token("alice")))
            .dispatch()
            .await;
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["stats"]["totalXp"], 25);
    }

    #[rocket::async_test]
    async fn test_certificate_flow_and_public_verification() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let course = test_db.course_id(STANDARD_COURSE);

        let response = client
            .post(format!("/api/certificates/course/{}", course))
            .header(bearer(test_db.token("alice")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["issued"], false);
        assert!(body["certificate"].is_null());

        let response = client
            .get("/api/certificates/verify/NODO360-2025-ABCDEF12")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
    }

    #[rocket::async_test]
    async fn test_enroll_and_note_api() {
        let test_db = create_standard_test_db().await;
        let (client, test_db) = setup_test_client(test_db).await;
        let course = test_db.course_id(STANDARD_COURSE);
        let lesson = test_db.lesson_ids(test_db.module_ids(STANDARD_COURSE)[0])[0];

        let response = client
            .put(format!("/api/lessons/{}/note", lesson))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("bob")))
            .body(json!({ "content": "Too early" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .post(format!("/api/courses/{}/enroll", course))
            .header(bearer(test_db.token("bob")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["progressPercentage"], 0);

        let response = client
            .put(format!("/api/lessons/{}/note", lesson))
            .header(ContentType::JSON)
            .header(bearer(test_db.token("bob")))
            .body(json!({ "content": "Moves transfer ownership" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["content"], "Moves transfer ownership");

        let response = client
            .get(format!("/api/courses/{}/progress", course))
            .header(bearer(test_db.token("bob")))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["totalLessons"], 4);
        assert_eq!(body["modules"][0]["isUnlocked"], true);
        assert_eq!(body["modules"][1]["isUnlocked"], false);
    }
}
