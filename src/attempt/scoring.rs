use std::collections::BTreeSet;

use super::model::{AnswerMap, Question};

/// Exact-set match: no partial credit.
pub fn is_correct(question: &Question, selected: &[usize]) -> bool {
    if selected.len() != question.correct_answers.len() {
        return false;
    }
    let selected: BTreeSet<usize> = selected.iter().copied().collect();
    let correct: BTreeSet<usize> = question.correct_answers.iter().copied().collect();
    selected == correct
}

/// Score as a rounded percentage in `0..=100`. A quiz worth zero points scores 0.
pub fn score_answers(questions: &[Question], answers: &AnswerMap) -> u32 {
    let mut total: u64 = 0;
    let mut earned: u64 = 0;

    for question in questions {
        total += u64::from(question.points);
        let correct = answers
            .get(&question.id)
            .map(|selected| is_correct(question, selected))
            .unwrap_or(false);
        if correct {
            earned += u64::from(question.points);
        }
    }

    if total == 0 {
        return 0;
    }

    // Round half up.
    ((earned * 200 + total) / (total * 2)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::model::QuestionKind;

    fn question(id: &str, correct: Vec<usize>, points: u32) -> Question {
        Question {
            id: id.to_string(),
            text: format!("Question {}", id),
            kind: if correct.len() > 1 {
                QuestionKind::MultipleChoice
            } else {
                QuestionKind::SingleChoice
            },
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_answers: correct,
            points,
        }
    }

    fn answers(pairs: &[(&str, Vec<usize>)]) -> AnswerMap {
        pairs
            .iter()
            .map(|(id, selected)| (id.to_string(), selected.clone()))
            .collect()
    }

    #[test]
    fn test_exact_set_match() {
        let q = question("q1", vec![0, 2], 2);

        assert!(is_correct(&q, &[0, 2]));
        assert!(is_correct(&q, &[2, 0]));
        assert!(!is_correct(&q, &[0]));
        assert!(!is_correct(&q, &[0, 1, 2]));
        assert!(!is_correct(&q, &[0, 0]));
    }

    #[test]
    fn test_percentage_is_rounded() {
        let questions = vec![question("q1", vec![0], 1), question("q2", vec![1], 1), question("q3", vec![2], 1)];

        let one = score_answers(&questions, &answers(&[("q1", vec![0])]));
        let two = score_answers(&questions, &answers(&[("q1", vec![0]), ("q2", vec![1])]));

        assert_eq!(one, 33);
        assert_eq!(two, 67);
    }

    #[test]
    fn test_weighted_points() {
        let questions = vec![question("q1", vec![0, 2], 2), question("q2", vec![1], 1)];
        let score = score_answers(&questions, &answers(&[("q1", vec![0, 2]), ("q2", vec![3])]));
        assert_eq!(score, 67);
    }

    #[test]
    fn test_zero_points_scores_zero() {
        let questions = vec![question("q1", vec![0], 0)];
        assert_eq!(score_answers(&questions, &answers(&[("q1", vec![0])])), 0);
        assert_eq!(score_answers(&[], &AnswerMap::new()), 0);
    }

    #[test]
    fn test_unanswered_and_unknown_questions() {
        let questions = vec![question("q1", vec![0], 1)];
        let score = score_answers(&questions, &answers(&[("other", vec![0])]));
        assert_eq!(score, 0);

        let perfect = score_answers(&questions, &answers(&[("q1", vec![0])]));
        assert_eq!(perfect, 100);
    }
}
