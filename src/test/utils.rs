#[cfg(test)]
pub mod test_utils {
    use std::collections::HashMap;
    use std::sync::Once;

    use chrono::{Duration, Utc};
    use rocket::local::asynchronous::Client;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::{Pool, Sqlite};

    use crate::auth::Role;
    use crate::db::{
        NewQuizQuestion, create_badge, create_course, create_enrollment, create_lesson,
        create_module, create_quiz_question,
    };
    use crate::engine::Engine;
    use crate::env::EngineConfig;
    use crate::error::AppError;
    use crate::init_rocket;
    use crate::quiz::SubmittedAnswer;

    static INIT: Once = Once::new();

    pub const STANDARD_COURSE: &str = "Rust Fundamentals";
    /// Correct option per question of the standard quiz.
    pub const STANDARD_ANSWER_KEY: [i64; 5] = [0, 1, 2, 3, 0];

    #[derive(Default)]
    pub struct TestDbBuilder {
        users: Vec<TestUser>,
        courses: Vec<TestCourse>,
        badges: Vec<TestBadge>,
        enrollments: Vec<(String, String)>,
    }

    pub struct TestUser {
        pub username: String,
        pub display_name: Option<String>,
        pub role: Role,
    }

    pub struct TestCourse {
        pub title: String,
        pub modules: Vec<TestModule>,
    }

    pub struct TestModule {
        pub title: String,
        pub lessons: usize,
        pub requires_quiz: bool,
        pub questions: Vec<TestQuestion>,
    }

    pub struct TestQuestion {
        pub question: String,
        pub options: Vec<String>,
        pub correct_answer: i64,
    }

    pub struct TestBadge {
        pub name: String,
        pub requirement_type: String,
        pub requirement_value: i64,
    }

    impl TestDbBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        fn user(mut self, username: &str, display_name: Option<&str>, role: Role) -> Self {
            self.users.push(TestUser {
                username: username.to_string(),
                display_name: display_name.map(String::from),
                role,
            });
            self
        }

        pub fn student(self, username: &str, display_name: Option<&str>) -> Self {
            self.user(username, display_name, Role::Student)
        }

        pub fn instructor(self, username: &str, display_name: Option<&str>) -> Self {
            self.user(username, display_name, Role::Instructor)
        }

        pub fn admin(self, username: &str, display_name: Option<&str>) -> Self {
            self.user(username, display_name, Role::Admin)
        }

        pub fn course(mut self, title: &str) -> Self {
            self.courses.push(TestCourse {
                title: title.to_string(),
                modules: Vec::new(),
            });
            self
        }

        /// Adds a module to the most recently added course.
        pub fn module(mut self, title: &str, lessons: usize, requires_quiz: bool) -> Self {
            if let Some(course) = self.courses.last_mut() {
                course.modules.push(TestModule {
                    title: title.to_string(),
                    lessons,
                    requires_quiz,
                    questions: Vec::new(),
                });
            }
            self
        }

        /// Adds a question to the most recently added module.
        pub fn question(mut self, question: &str, options: &[&str], correct_answer: i64) -> Self {
            if let Some(module) = self
                .courses
                .last_mut()
                .and_then(|course| course.modules.last_mut())
            {
                module.questions.push(TestQuestion {
                    question: question.to_string(),
                    options: options.iter().map(|o| o.to_string()).collect(),
                    correct_answer,
                });
            }
            self
        }

        pub fn badge(mut self, name: &str, requirement_type: &str, requirement_value: i64) -> Self {
            self.badges.push(TestBadge {
                name: name.to_string(),
                requirement_type: requirement_type.to_string(),
                requirement_value,
            });
            self
        }

        pub fn enroll(mut self, username: &str, course_title: &str) -> Self {
            self.enrollments
                .push((username.to_string(), course_title.to_string()));
            self
        }

        pub async fn build(self) -> Result<TestDb, AppError> {
            INIT.call_once(|| {
                let _ = env_logger::builder()
                    .parse_filters("debug")
                    .is_test(true)
                    .try_init();
            });

            // One connection keeps every query on the same in-memory database.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?;

            sqlx::migrate!("./migrations").run(&pool).await?;

            let mut conn = pool.acquire().await?;
            let now = Utc::now();

            let mut user_id_map: HashMap<String, i64> = HashMap::new();
            let mut token_map: HashMap<String, String> = HashMap::new();

            for user in &self.users {
                let user_id = sqlx::query_scalar::<_, i64>(
                    "INSERT INTO users (username, role, display_name) VALUES (?, ?, ?) RETURNING id",
                )
                .bind(&user.username)
                .bind(user.role.as_str())
                .bind(user.display_name.clone().unwrap_or_default())
                .fetch_one(&mut *conn)
                .await?;

                let token = format!("token-{}", user.username);
                sqlx::query(
                    "INSERT INTO user_sessions (user_id, token, created_at, expires_at) VALUES (?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(&token)
                .bind(now - Duration::hours(1))
                .bind(now + Duration::days(1))
                .execute(&mut *conn)
                .await?;

                user_id_map.insert(user.username.clone(), user_id);
                token_map.insert(user.username.clone(), token);
            }

            let mut course_id_map: HashMap<String, i64> = HashMap::new();
            let mut module_id_map: HashMap<String, Vec<i64>> = HashMap::new();
            let mut lesson_id_map: HashMap<i64, Vec<i64>> = HashMap::new();
            let mut question_id_map: HashMap<i64, Vec<i64>> = HashMap::new();

            for course in &self.courses {
                let course_id = create_course(&mut *conn, &course.title).await?.id;
                course_id_map.insert(course.title.clone(), course_id);

                for (module_index, module) in course.modules.iter().enumerate() {
                    let module_id = create_module(
                        &mut *conn,
                        course_id,
                        &module.title,
                        module_index as i64,
                        module.requires_quiz,
                    )
                    .await?
                    .id;
                    module_id_map
                        .entry(course.title.clone())
                        .or_default()
                        .push(module_id);

                    for lesson_index in 0..module.lessons {
                        let lesson = create_lesson(
                            &mut *conn,
                            module_id,
                            &format!("{} lesson {}", module.title, lesson_index + 1),
                            lesson_index as i64,
                        )
                        .await?;
                        lesson_id_map.entry(module_id).or_default().push(lesson.id);
                    }
                    lesson_id_map.entry(module_id).or_default();

                    for (question_index, question) in module.questions.iter().enumerate() {
                        let options: Vec<&str> =
                            question.options.iter().map(String::as_str).collect();
                        let explanation = format!("Option {} is right", question.correct_answer);
                        let question_id = create_quiz_question(
                            &mut *conn,
                            NewQuizQuestion {
                                module_id,
                                question: &question.question,
                                options: &options,
                                correct_answer: question.correct_answer,
                                explanation: Some(&explanation),
                                order_index: question_index as i64,
                            },
                        )
                        .await?;
                        question_id_map.entry(module_id).or_default().push(question_id);
                    }
                }
            }

            for (order_index, badge) in self.badges.iter().enumerate() {
                create_badge(
                    &mut *conn,
                    &badge.name,
                    &badge.requirement_type,
                    badge.requirement_value,
                    order_index as i64,
                )
                .await?;
            }

            for (username, course_title) in &self.enrollments {
                if let (Some(user_id), Some(course_id)) =
                    (user_id_map.get(username), course_id_map.get(course_title))
                {
                    create_enrollment(&mut *conn, *user_id, *course_id, now).await?;
                }
            }

            drop(conn);

            Ok(TestDb {
                pool,
                user_id_map,
                token_map,
                course_id_map,
                module_id_map,
                lesson_id_map,
                question_id_map,
            })
        }
    }

    pub struct TestDb {
        pub pool: Pool<Sqlite>,
        pub user_id_map: HashMap<String, i64>,
        pub token_map: HashMap<String, String>,
        pub course_id_map: HashMap<String, i64>,
        pub module_id_map: HashMap<String, Vec<i64>>,
        pub lesson_id_map: HashMap<i64, Vec<i64>>,
        pub question_id_map: HashMap<i64, Vec<i64>>,
    }

    impl TestDb {
        pub fn user_id(&self, username: &str) -> i64 {
            self.user_id_map[username]
        }

        pub fn token(&self, username: &str) -> String {
            format!("Bearer {}", self.token_map[username])
        }

        pub fn course_id(&self, title: &str) -> i64 {
            self.course_id_map[title]
        }

        pub fn module_ids(&self, course_title: &str) -> Vec<i64> {
            self.module_id_map[course_title].clone()
        }

        pub fn lesson_ids(&self, module_id: i64) -> Vec<i64> {
            self.lesson_id_map[&module_id].clone()
        }

        pub fn question_ids(&self, module_id: i64) -> Vec<i64> {
            self.question_id_map[&module_id].clone()
        }

        pub fn engine(&self) -> Engine {
            Engine::new(self.pool.clone(), EngineConfig::default())
        }

        pub async fn scalar(&self, sql: &str, id: i64) -> i64 {
            sqlx::query_scalar::<_, i64>(sql)
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .unwrap()
        }
    }

    /// Two modules of two lessons each. The first is gated by a five
    /// question quiz. `alice` is enrolled, `bob` is not.
    pub async fn create_standard_test_db() -> TestDb {
        let mut builder = TestDbBuilder::new()
            .student("alice", Some("Alice Liddell"))
            .student("bob", None)
            .instructor("ivan", Some("Ivan Instructor"))
            .admin("ada", Some("Ada Admin"))
            .course(STANDARD_COURSE)
            .module("Basics", 2, true);

        for (index, correct) in STANDARD_ANSWER_KEY.iter().enumerate() {
            builder = builder.question(
                &format!("Question {}", index + 1),
                &["first", "second", "third", "fourth"],
                *correct,
            );
        }

        builder
            .module("Ownership", 2, false)
            .badge("First Steps", "lessons_completed", 1)
            .badge("Centurion", "total_xp", 100)
            .enroll("alice", STANDARD_COURSE)
            .build()
            .await
            .expect("Failed to build standard test database")
    }

    /// Answers the standard quiz with the first `correct` answers right and
    /// the rest wrong.
    pub fn standard_answers(question_ids: &[i64], correct: usize) -> Vec<SubmittedAnswer> {
        question_ids
            .iter()
            .zip(STANDARD_ANSWER_KEY.iter())
            .enumerate()
            .map(|(index, (question_id, key))| SubmittedAnswer {
                question_id: *question_id,
                selected_answer: if index < correct { *key } else { (*key + 1) % 4 },
            })
            .collect()
    }

    pub async fn setup_test_client(test_db: TestDb) -> (Client, TestDb) {
        let rocket = init_rocket(test_db.pool.clone(), EngineConfig::default());
        let client = Client::tracked(rocket)
            .await
            .expect("Failed to create test client");
        (client, test_db)
    }
}
