/// Deadline penalties and overall grade
///
/// Pure functions only. Intake stamps `penalty`/`overdue` with these, and
/// readers re-derive them the same way, so both sides always use the
/// submission's own timestamp as the evaluation instant.

use crate::types::{Assignment, Submission};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Lateness of one submission relative to an assignment's deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lateness {
    pub penalty: u64,
    pub overdue: bool,
}

/// Lateness plus the resulting overall grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Grade {
    pub penalty: u64,
    pub overdue: bool,
    pub overall: u64,
}

/// Whole days late, counting any started day, minimum one.
fn days_late(at: DateTime<Utc>, soft_deadline: DateTime<Utc>) -> u64 {
    let seconds = (at - soft_deadline).num_seconds().max(0);
    (seconds / SECONDS_PER_DAY) as u64 + 1
}

pub fn assess(at: DateTime<Utc>, assignment: &Assignment) -> Lateness {
    if at > assignment.hard_deadline {
        return Lateness {
            penalty: 0,
            overdue: true,
        };
    }
    if at <= assignment.soft_deadline {
        return Lateness {
            penalty: 0,
            overdue: false,
        };
    }
    Lateness {
        penalty: days_late(at, assignment.soft_deadline).saturating_mul(assignment.daily_penalty),
        overdue: false,
    }
}

/// Overall grade of a submission
///
/// Zero once overdue. Otherwise tests + teacher − penalty, clamped at zero.
/// A missing automated score counts as zero.
pub fn grade(submission: &Submission, assignment: &Assignment) -> Grade {
    let lateness = assess(submission.timestamp, assignment);
    let overall = if lateness.overdue {
        0
    } else {
        submission
            .score_by_tests
            .unwrap_or(0)
            .saturating_add(submission.score_by_teacher)
            .saturating_sub(lateness.penalty)
    };

    Grade {
        penalty: lateness.penalty,
        overdue: lateness.overdue,
        overall,
    }
}

/// Deadlines are given as dates and close at the last second of that day.
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    date.and_time(last_second).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn assignment(soft: DateTime<Utc>) -> Assignment {
        Assignment {
            id: "tema1".to_string(),
            subject_id: "pc".to_string(),
            name: "Tema 1".to_string(),
            image: "lxchecker/pc-tema1".to_string(),
            submission_path: "/submission/submission.zip".to_string(),
            timeout_secs: 30,
            soft_deadline: soft,
            hard_deadline: soft + Duration::days(5),
            daily_penalty: 10,
            max_score_by_tests: 100,
            max_score_by_teacher: 20,
        }
    }

    fn d0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 23, 59, 59).unwrap()
    }

    fn submission_at(at: DateTime<Utc>, tests: u64, teacher: u64) -> Submission {
        let mut s = Submission::new_pending("pc", "tema1", "student", at, Vec::new(), "a.zip");
        s.score_by_tests = Some(tests);
        s.score_by_teacher = teacher;
        s
    }

    #[test]
    fn test_thirty_hours_late_is_two_days() {
        let a = assignment(d0());
        let lateness = assess(d0() + Duration::hours(30), &a);
        assert_eq!(lateness.penalty, 20);
        assert!(!lateness.overdue);
    }

    #[test]
    fn test_any_fraction_of_a_day_counts() {
        let a = assignment(d0());
        assert_eq!(assess(d0() + Duration::seconds(1), &a).penalty, 10);
        assert_eq!(assess(d0() + Duration::hours(24) - Duration::seconds(1), &a).penalty, 10);
        assert_eq!(assess(d0() + Duration::hours(24), &a).penalty, 20);
    }

    #[test]
    fn test_on_or_before_soft_deadline_has_no_penalty() {
        let a = assignment(d0());
        assert_eq!(assess(d0(), &a).penalty, 0);
        assert_eq!(assess(d0() - Duration::days(3), &a).penalty, 0);
        assert!(!assess(d0(), &a).overdue);
    }

    #[test]
    fn test_hard_deadline_is_inclusive() {
        let a = assignment(d0());
        let at_hard = assess(a.hard_deadline, &a);
        assert!(!at_hard.overdue);
        assert_eq!(at_hard.penalty, 60);

        let after_hard = assess(a.hard_deadline + Duration::seconds(1), &a);
        assert!(after_hard.overdue);
    }

    #[test]
    fn test_overdue_forces_zero_grade() {
        let a = assignment(d0());
        let s = submission_at(a.hard_deadline + Duration::hours(1), 100, 20);
        let g = grade(&s, &a);
        assert!(g.overdue);
        assert_eq!(g.overall, 0);
    }

    #[test]
    fn test_overall_grade_subtracts_penalty() {
        let a = assignment(d0());
        let s = submission_at(d0() + Duration::hours(30), 80, 15);
        assert_eq!(
            grade(&s, &a),
            Grade {
                penalty: 20,
                overdue: false,
                overall: 75,
            }
        );
    }

    #[test]
    fn test_overall_grade_clamps_at_zero() {
        let mut a = assignment(d0());
        a.daily_penalty = 50;
        let s = submission_at(d0() + Duration::days(2), 30, 5);
        let g = grade(&s, &a);
        assert_eq!(g.penalty, 150);
        assert_eq!(g.overall, 0);
    }

    #[test]
    fn test_missing_test_score_counts_as_zero() {
        let a = assignment(d0());
        let mut s = submission_at(d0(), 0, 7);
        s.score_by_tests = None;
        assert_eq!(grade(&s, &a).overall, 7);
    }

    #[test]
    fn test_grading_is_repeatable() {
        let a = assignment(d0());
        let s = submission_at(d0() + Duration::hours(50), 60, 10);
        assert_eq!(grade(&s, &a), grade(&s, &a));
        assert_eq!(
            assess(s.timestamp, &a),
            Lateness {
                penalty: grade(&s, &a).penalty,
                overdue: grade(&s, &a).overdue,
            }
        );
    }

    #[test]
    fn test_end_of_day() {
        let date = NaiveDate::from_ymd_opt(2024, 10, 1).unwrap();
        assert_eq!(end_of_day(date), d0());
    }
}
