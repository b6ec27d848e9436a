//! Question delivery, option shuffling and attempt scoring.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::certification::settle_course_completion;
use crate::db::{self, NewQuizAttempt};
use crate::engine::{Engine, load_course_state};
use crate::error::AppError;
use crate::gamification::{award_xp, evaluate_badges};
use crate::models::{AnswerRecord, Certificate, HIDDEN_ANSWER, QuizAttempt, QuizQuestion, XpEventType};
use crate::reset::ensure_no_pending_reset;
use crate::unlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedAnswer {
    pub question_id: i64,
    pub selected_answer: i64,
}

/// `forward[original] = shown`, `inverse[shown] = original`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permutation {
    pub forward: Vec<usize>,
    pub inverse: Vec<usize>,
}

impl Permutation {
    fn from_inverse(inverse: Vec<usize>) -> Self {
        let mut forward = vec![0; inverse.len()];
        for (shown, original) in inverse.iter().enumerate() {
            forward[*original] = shown;
        }
        Self { forward, inverse }
    }

    pub fn to_original(&self, shown: i64) -> Option<i64> {
        usize::try_from(shown)
            .ok()
            .and_then(|index| self.inverse.get(index))
            .map(|original| *original as i64)
    }

    pub fn to_shown(&self, original: i64) -> Option<i64> {
        usize::try_from(original)
            .ok()
            .and_then(|index| self.forward.get(index))
            .map(|shown| *shown as i64)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShuffledQuestion {
    pub question: QuizQuestion,
    pub permutation: Permutation,
    pub seed: u64,
}

fn question_seed(seed: u64, question_id: i64) -> u64 {
    seed.wrapping_add(question_id as u64)
}

/// Deterministic for a given seed; the remapped question keeps exactly one
/// correct option.
pub fn shuffle_options(question: &QuizQuestion, seed: Option<u64>) -> ShuffledQuestion {
    let seed = seed.unwrap_or_else(rand::random::<u64>);
    let mut rng = StdRng::seed_from_u64(question_seed(seed, question.id));

    let mut inverse: Vec<usize> = (0..question.options.len()).collect();
    inverse.shuffle(&mut rng);
    let permutation = Permutation::from_inverse(inverse);

    let mut shuffled = question.clone();
    shuffled.options = permutation
        .inverse
        .iter()
        .map(|original| question.options[*original].clone())
        .collect();
    shuffled.correct_answer = permutation
        .to_shown(question.correct_answer)
        .unwrap_or(HIDDEN_ANSWER);

    ShuffledQuestion {
        question: shuffled,
        permutation,
        seed,
    }
}

/// Strips the answer key before a question leaves the server.
pub fn sanitize(mut question: QuizQuestion) -> QuizQuestion {
    question.correct_answer = HIDDEN_ANSWER;
    question.explanation = None;
    question
}

pub fn is_correct(question: &QuizQuestion, selected_answer: i64) -> bool {
    question.correct_answer == selected_answer
}

pub fn score_percentage(correct: usize, total: usize) -> i64 {
    if total == 0 {
        return 0;
    }
    (100.0 * correct as f64 / total as f64).round() as i64
}

/// Rejects empty, duplicated or out-of-range submissions. Unknown question
/// ids pass through and are graded as incorrect.
pub fn validate_submission(
    questions: &[QuizQuestion],
    answers: &[SubmittedAnswer],
) -> Result<(), AppError> {
    if answers.is_empty() {
        return Err(AppError::Validation(
            "A quiz submission needs at least one answer".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for answer in answers {
        if !seen.insert(answer.question_id) {
            return Err(AppError::Validation(format!(
                "Question {} was answered more than once",
                answer.question_id
            )));
        }

        if let Some(question) = questions.iter().find(|q| q.id == answer.question_id) {
            let option_count = question.options.len() as i64;
            if !(0..option_count).contains(&answer.selected_answer) {
                return Err(AppError::Validation(format!(
                    "Answer {} is out of range for question {} with {} options",
                    answer.selected_answer, question.id, option_count
                )));
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grade {
    pub records: Vec<AnswerRecord>,
    pub correct_answers: i64,
    pub total_questions: i64,
    pub score: i64,
}

impl Grade {
    pub fn passed(&self, threshold: i64) -> bool {
        self.score >= threshold
    }
}

/// Scores against the whole bank: unanswered questions count as wrong.
/// Answers must already be in original option order.
pub fn grade(questions: &[QuizQuestion], answers: &[SubmittedAnswer]) -> Grade {
    let by_id: HashMap<i64, &QuizQuestion> = questions.iter().map(|q| (q.id, q)).collect();

    let records: Vec<AnswerRecord> = answers
        .iter()
        .map(|answer| AnswerRecord {
            question_id: answer.question_id,
            selected_answer: answer.selected_answer,
            is_correct: by_id
                .get(&answer.question_id)
                .is_some_and(|question| is_correct(question, answer.selected_answer)),
        })
        .collect();

    let correct = records.iter().filter(|r| r.is_correct).count();

    Grade {
        correct_answers: correct as i64,
        total_questions: questions.len() as i64,
        score: score_percentage(correct, questions.len()),
        records,
    }
}

/// Highest score wins; ties go to the most recent attempt.
pub fn best_attempt(attempts: &[QuizAttempt]) -> Option<&QuizAttempt> {
    attempts
        .iter()
        .max_by_key(|attempt| (attempt.score, attempt.completed_at, attempt.id))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServedQuestion {
    #[serde(flatten)]
    pub question: QuizQuestion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFeedback {
    pub question_id: i64,
    pub selected_answer: i64,
    pub is_correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub attempt_id: i64,
    pub score: i64,
    pub passed: bool,
    pub correct_answers: i64,
    pub total_questions: i64,
    pub first_pass: bool,
    pub xp_awarded: i64,
    pub answers: Vec<AnswerFeedback>,
    pub newly_unlocked_modules: Vec<i64>,
    pub course_completed: bool,
    pub certificate: Option<Certificate>,
    pub badges_unlocked: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptHistory {
    pub attempts: Vec<QuizAttempt>,
    pub best_attempt: Option<QuizAttempt>,
}

impl Engine {
    /// Ordered question bank. Answer keys are withheld unless
    /// `include_answers` is set; a seed shuffles every question's options.
    #[instrument(skip(self))]
    pub async fn quiz_questions(
        &self,
        module_id: i64,
        include_answers: bool,
        shuffle_seed: Option<u64>,
    ) -> Result<Vec<ServedQuestion>, AppError> {
        let mut conn = self.pool().acquire().await?;
        db::get_module(&mut *conn, module_id).await?;
        let questions = db::get_questions(&mut *conn, module_id).await?;
        if questions.is_empty() {
            return Err(AppError::NotFound(format!(
                "Module {} has no quiz questions",
                module_id
            )));
        }

        let served = questions
            .into_iter()
            .map(|question| {
                let question = match shuffle_seed {
                    Some(seed) => shuffle_options(&question, Some(seed)).question,
                    None => question,
                };
                let question = if include_answers {
                    question
                } else {
                    sanitize(question)
                };
                ServedQuestion {
                    question,
                    shuffle_seed,
                }
            })
            .collect();

        Ok(served)
    }

    /// Grades one submission and applies everything a pass unlocks, all in
    /// one transaction. `shuffle_seed` must be the seed the questions were
    /// served with; answers are then given in shown option order.
    #[instrument(skip(self, answers))]
    pub async fn submit_quiz(
        &self,
        user_id: i64,
        module_id: i64,
        answers: &[SubmittedAnswer],
        shuffle_seed: Option<u64>,
    ) -> Result<QuizResult, AppError> {
        let module = db::get_module(&mut *self.pool().acquire().await?, module_id).await?;
        let course_id = module.course_id;
        let _guard = self.lock_course(user_id, course_id).await;

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        db::require_enrollment(&mut *tx, user_id, course_id).await?;
        ensure_no_pending_reset(&mut *tx, user_id, course_id).await?;

        let questions = db::get_questions(&mut *tx, module_id).await?;
        if questions.is_empty() {
            return Err(AppError::NotFound(format!(
                "Module {} has no quiz questions",
                module_id
            )));
        }
        validate_submission(&questions, answers)?;

        let before = load_course_state(&mut *tx, user_id, course_id).await?;
        if !before.is_module_unlocked(module_id) {
            return Err(AppError::Forbidden(format!(
                "Module {} is locked for user {}",
                module_id, user_id
            )));
        }

        let permutations: HashMap<i64, Permutation> = match shuffle_seed {
            Some(seed) => questions
                .iter()
                .map(|q| (q.id, shuffle_options(q, Some(seed)).permutation))
                .collect(),
            None => HashMap::new(),
        };
        let canonical: Vec<SubmittedAnswer> = answers
            .iter()
            .map(|answer| SubmittedAnswer {
                question_id: answer.question_id,
                selected_answer: permutations
                    .get(&answer.question_id)
                    .and_then(|p| p.to_original(answer.selected_answer))
                    .unwrap_or(answer.selected_answer),
            })
            .collect();

        let grade = grade(&questions, &canonical);
        let passed = grade.passed(self.config().pass_threshold);
        let first_pass = passed && !before.passed_quizzes.contains(&module_id);

        let attempt = db::insert_quiz_attempt(
            &mut *tx,
            NewQuizAttempt {
                user_id,
                module_id,
                score: grade.score,
                total_questions: grade.total_questions,
                correct_answers: grade.correct_answers,
                passed,
                answers: &grade.records,
                completed_at: now,
            },
        )
        .await?;

        let mut xp_awarded = 0;
        let mut newly_unlocked_modules = Vec::new();
        let mut course_completed = false;
        let mut certificate = None;

        if first_pass {
            let award = award_xp(
                &mut *tx,
                self.config(),
                user_id,
                Some(course_id),
                XpEventType::QuizPassed,
                self.config().xp.quiz_passed,
                &format!("Passed quiz: {}", module.title),
                now,
            )
            .await?;
            xp_awarded += award.amount;

            let after = load_course_state(&mut *tx, user_id, course_id).await?;
            newly_unlocked_modules = unlock::newly_unlocked(&before.modules, &after.modules);
            let settlement =
                settle_course_completion(&mut *tx, self.config(), user_id, course_id, &after, now)
                    .await?;
            xp_awarded += settlement.xp_awarded;
            course_completed = settlement.course_completed;
            certificate = settlement.certificate;
        }

        let badges_unlocked = evaluate_badges(&mut *tx, self.config(), user_id, now).await?;
        tx.commit().await?;

        info!(
            user_id,
            module_id,
            score = grade.score,
            passed,
            first_pass,
            "Quiz attempt graded"
        );

        let by_id: HashMap<i64, &QuizQuestion> = questions.iter().map(|q| (q.id, q)).collect();
        let feedback = answers
            .iter()
            .zip(grade.records.iter())
            .map(|(submitted, record)| {
                let question = by_id.get(&record.question_id).filter(|_| passed);
                AnswerFeedback {
                    question_id: record.question_id,
                    selected_answer: submitted.selected_answer,
                    is_correct: record.is_correct,
                    correct_answer: question.map(|q| {
                        permutations
                            .get(&q.id)
                            .and_then(|p| p.to_shown(q.correct_answer))
                            .unwrap_or(q.correct_answer)
                    }),
                    explanation: question.and_then(|q| q.explanation.clone()),
                }
            })
            .collect();

        Ok(QuizResult {
            attempt_id: attempt.id,
            score: attempt.score,
            passed: attempt.passed,
            correct_answers: attempt.correct_answers,
            total_questions: attempt.total_questions,
            first_pass,
            xp_awarded,
            answers: feedback,
            newly_unlocked_modules,
            course_completed,
            certificate,
            badges_unlocked,
        })
    }

    #[instrument(skip(self))]
    pub async fn quiz_attempts(
        &self,
        user_id: i64,
        module_id: i64,
    ) -> Result<AttemptHistory, AppError> {
        let mut conn = self.pool().acquire().await?;
        db::get_module(&mut *conn, module_id).await?;
        let attempts = db::list_quiz_attempts(&mut *conn, user_id, module_id).await?;
        let best_attempt = best_attempt(&attempts).cloned();

        Ok(AttemptHistory {
            attempts,
            best_attempt,
        })
    }
}
