#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::error::AppError;
    use crate::models::{HIDDEN_ANSWER, QuizAttempt, QuizQuestion};
    use crate::quiz::{
        SubmittedAnswer, best_attempt, grade, is_correct, sanitize, score_percentage,
        shuffle_options, validate_submission,
    };
    use crate::test::test_utils::{
        STANDARD_COURSE, TestDbBuilder, create_standard_test_db, standard_answers,
    };

    fn question(id: i64, correct_answer: i64) -> QuizQuestion {
        QuizQuestion {
            id,
            module_id: 1,
            question: format!("Question {}", id),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_answer,
            explanation: Some("because".into()),
            order_index: id,
            difficulty: "medium".into(),
            points: 1,
        }
    }

    fn bank() -> Vec<QuizQuestion> {
        (1..=5).map(|id| question(id, id % 4)).collect()
    }

    fn answer(question_id: i64, selected_answer: i64) -> SubmittedAnswer {
        SubmittedAnswer {
            question_id,
            selected_answer,
        }
    }

    #[test]
    fn test_scoring_four_of_five_passes() {
        let questions = bank();
        let answers: Vec<SubmittedAnswer> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| answer(q.id, if i < 4 { q.correct_answer } else { (q.correct_answer + 1) % 4 }))
            .collect();

        let result = grade(&questions, &answers);
        assert_eq!(result.correct_answers, 4);
        assert_eq!(result.total_questions, 5);
        assert_eq!(result.score, 80);
        assert!(result.passed(70));
    }

    #[test]
    fn test_scoring_three_of_five_fails() {
        let questions = bank();
        let answers: Vec<SubmittedAnswer> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| answer(q.id, if i < 3 { q.correct_answer } else { (q.correct_answer + 1) % 4 }))
            .collect();

        let result = grade(&questions, &answers);
        assert_eq!(result.score, 60);
        assert!(!result.passed(70));
    }

    #[test]
    fn test_unanswered_and_unknown_questions_count_as_wrong() {
        let questions = bank();
        let answers = vec![answer(1, 1), answer(2, 2), answer(999, 0)];

        let result = grade(&questions, &answers);
        assert_eq!(result.correct_answers, 2);
        assert_eq!(result.total_questions, 5);
        assert_eq!(result.score, 40);
        assert!(!result.records[2].is_correct);
        assert!(validate_submission(&questions, &answers).is_ok());
    }

    #[test]
    fn test_malformed_submissions_rejected() {
        let questions = bank();

        assert!(matches!(
            validate_submission(&questions, &[]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_submission(&questions, &[answer(1, 0), answer(1, 1)]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_submission(&questions, &[answer(1, 4)]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_submission(&questions, &[answer(1, -1)]),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_score_percentage_rounds() {
        assert_eq!(score_percentage(2, 3), 67);
        assert_eq!(score_percentage(1, 3), 33);
        assert_eq!(score_percentage(0, 0), 0);
    }

    #[test]
    fn test_shuffle_keeps_exactly_one_correct_option() {
        let original = question(7, 2);

        for seed in 0..50u64 {
            let shuffled = shuffle_options(&original, Some(seed));
            let q = &shuffled.question;

            let mut sorted = q.options.clone();
            sorted.sort();
            assert_eq!(sorted, original.options);
            assert_eq!(q.options[q.correct_answer as usize], "c");
            assert_eq!(q.options.iter().filter(|o| *o == "c").count(), 1);

            for (original_index, shown) in shuffled.permutation.forward.iter().enumerate() {
                assert_eq!(shuffled.permutation.inverse[*shown], original_index);
            }
        }
    }

    #[test]
    fn test_shuffled_answer_is_correct_iff_its_original_is() {
        let original = question(3, 1);

        for seed in 0..20u64 {
            let shuffled = shuffle_options(&original, Some(seed));
            for shown in 0..original.options.len() as i64 {
                let mapped = shuffled.permutation.to_original(shown).unwrap();
                assert_eq!(
                    is_correct(&shuffled.question, shown),
                    is_correct(&original, mapped),
                    "seed {} option {}",
                    seed,
                    shown
                );
                assert_eq!(shuffled.question.options[shown as usize], original.options[mapped as usize]);
            }
        }
    }

    #[test]
    fn test_grading_shuffled_answers_matches_original_order() {
        let questions = bank();

        for seed in 0..20u64 {
            let shuffled: Vec<_> = questions
                .iter()
                .map(|q| shuffle_options(q, Some(seed)))
                .collect();
            // Right on the first three, wrong on the rest, picked by shown position.
            let shown_answers: Vec<(i64, i64)> = shuffled
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let right = s.question.correct_answer;
                    let pick = if i < 3 { right } else { (right + 1) % 4 };
                    (s.question.id, pick)
                })
                .collect();

            let mapped: Vec<SubmittedAnswer> = shown_answers
                .iter()
                .zip(&shuffled)
                .map(|((id, pick), s)| answer(*id, s.permutation.to_original(*pick).unwrap()))
                .collect();
            let shuffled_bank: Vec<QuizQuestion> =
                shuffled.iter().map(|s| s.question.clone()).collect();
            let direct: Vec<SubmittedAnswer> =
                shown_answers.iter().map(|(id, pick)| answer(*id, *pick)).collect();

            let from_original = grade(&questions, &mapped);
            let from_shown = grade(&shuffled_bank, &direct);
            assert_eq!(from_original.correct_answers, 3);
            assert_eq!(from_original.score, from_shown.score);
            assert_eq!(from_original.passed(70), from_shown.passed(70));
            assert!(!from_original.passed(70));
        }
    }

    #[test]
    fn test_shuffle_is_deterministic_for_a_seed() {
        let original = question(3, 0);
        let first = shuffle_options(&original, Some(42));
        let second = shuffle_options(&original, Some(42));

        assert_eq!(first.question.options, second.question.options);
        assert_eq!(first.permutation, second.permutation);
        assert_eq!(first.seed, 42);
    }

    #[test]
    fn test_sanitize_hides_answer_key() {
        let hidden = sanitize(question(1, 3));
        assert_eq!(hidden.correct_answer, HIDDEN_ANSWER);
        assert!(hidden.explanation.is_none());
    }

    #[test]
    fn test_best_attempt_prefers_score_then_recency() {
        let now = Utc::now();
        let attempt = |id: i64, score: i64, minutes_ago: i64| QuizAttempt {
            id,
            user_id: 1,
            module_id: 1,
            score,
            total_questions: 5,
            correct_answers: score / 20,
            passed: score >= 70,
            answers: Vec::new(),
            completed_at: now - Duration::minutes(minutes_ago),
        };

        let attempts = vec![attempt(1, 80, 30), attempt(2, 60, 20), attempt(3, 80, 10)];
        assert_eq!(best_attempt(&attempts).map(|a| a.id), Some(3));
        assert!(best_attempt(&[]).is_none());
    }

    #[tokio::test]
    async fn test_submit_persists_attempt_and_awards_xp_once() {
        let test_db = create_standard_test_db().await;
        let engine = test_db.engine();
        let alice = test_db.user_id("alice");
        let module = test_db.module_ids(STANDARD_COURSE)[0];
        let questions = test_db.question_ids(module);

        let failed = engine
            .submit_quiz(alice, module, &standard_answers(&questions, 3), None)
            .await
            .unwrap();
        assert_eq!(failed.score, 60);
        assert!(!failed.passed);
        assert_eq!(failed.xp_awarded, 0);
        assert!(failed.answers.iter().all(|a| a.correct_answer.is_none()));

        let passed = engine
            .submit_quiz(alice, module, &standard_answers(&questions, 4), None)
            .await
            .unwrap();
        assert_eq!(passed.score, 80);
        assert!(passed.passed);
        assert!(passed.first_pass);
        assert_eq!(passed.xp_awarded, 50);
        assert!(passed.answers.iter().all(|a| a.correct_answer.is_some()));

        let again = engine
            .submit_quiz(alice, module, &standard_answers(&questions, 5), None)
            .await
            .unwrap();
        assert!(again.passed);
        assert!(!again.first_pass);
        assert_eq!(again.xp_awarded, 0);

        let history = engine.quiz_attempts(alice, module).await.unwrap();
        assert_eq!(history.attempts.len(), 3);
        assert_eq!(history.best_attempt.map(|a| a.score), Some(100));

        let quiz_events = test_db
            .scalar(
                "SELECT COUNT(*) FROM xp_events WHERE user_id = ? AND event_type = 'quiz_passed'",
                alice,
            )
            .await;
        assert_eq!(quiz_events, 1);
    }

    #[tokio::test]
    async fn test_submit_with_shuffle_seed_maps_answers_back() {
        let test_db = create_standard_test_db().await;
        let engine = test_db.engine();
        let alice = test_db.user_id("alice");
        let module = test_db.module_ids(STANDARD_COURSE)[0];
        let seed = 1234;

        let served = engine.quiz_questions(module, true, Some(seed)).await.unwrap();
        let answers: Vec<SubmittedAnswer> = served
            .iter()
            .map(|q| answer(q.question.id, q.question.correct_answer))
            .collect();

        let result = engine
            .submit_quiz(alice, module, &answers, Some(seed))
            .await
            .unwrap();
        assert_eq!(result.score, 100);
        for (feedback, served) in result.answers.iter().zip(served.iter()) {
            assert_eq!(feedback.correct_answer, Some(served.question.correct_answer));
        }
    }

    #[tokio::test]
    async fn test_questions_hide_answers_by_default() {
        let test_db = create_standard_test_db().await;
        let engine = test_db.engine();
        let module = test_db.module_ids(STANDARD_COURSE)[0];

        let served = engine.quiz_questions(module, false, None).await.unwrap();
        assert_eq!(served.len(), 5);
        assert!(served.iter().all(|q| q.question.correct_answer == HIDDEN_ANSWER));
        assert!(served.iter().all(|q| q.question.explanation.is_none()));
        assert!(served.windows(2).all(|w| w[0].question.order_index < w[1].question.order_index));
    }

    #[tokio::test]
    async fn test_submit_error_cases() {
        let test_db = create_standard_test_db().await;
        let engine = test_db.engine();
        let alice = test_db.user_id("alice");
        let bob = test_db.user_id("bob");
        let modules = test_db.module_ids(STANDARD_COURSE);
        let questions = test_db.question_ids(modules[0]);

        let not_enrolled = engine
            .submit_quiz(bob, modules[0], &standard_answers(&questions, 5), None)
            .await;
        assert!(matches!(not_enrolled, Err(AppError::Forbidden(_))));

        let no_questions = engine
            .submit_quiz(alice, modules[1], &[answer(1, 0)], None)
            .await;
        assert!(matches!(no_questions, Err(AppError::NotFound(_))));

        let missing_module = engine.submit_quiz(alice, 9999, &[answer(1, 0)], None).await;
        assert!(matches!(missing_module, Err(AppError::NotFound(_))));

        let duplicate = engine
            .submit_quiz(
                alice,
                modules[0],
                &[answer(questions[0], 0), answer(questions[0], 1)],
                None,
            )
            .await;
        assert!(matches!(duplicate, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_submit_in_locked_module_forbidden() {
        let test_db = TestDbBuilder::new()
            .student("carol", None)
            .course("Gated")
            .module("Intro", 1, false)
            .module("Advanced", 1, false)
            .question("Pick a", &["a", "b"], 0)
            .enroll("carol", "Gated")
            .build()
            .await
            .unwrap();
        let engine = test_db.engine();
        let carol = test_db.user_id("carol");
        let advanced = test_db.module_ids("Gated")[1];
        let question_id = test_db.question_ids(advanced)[0];

        let result = engine
            .submit_quiz(carol, advanced, &[answer(question_id, 0)], None)
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));

        let attempts = test_db
            .scalar("SELECT COUNT(*) FROM quiz_attempts WHERE user_id = ?", carol)
            .await;
        assert_eq!(attempts, 0);
    }
}
