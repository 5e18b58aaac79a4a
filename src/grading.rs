use serde::Serialize;
use std::collections::HashSet;

/// One line of pasted grading text that yielded a name and a score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedScore {
    pub line_no: usize,
    pub name: String,
    pub score: i64,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnparsedLine {
    pub line_no: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkParse {
    pub rows: Vec<ParsedScore>,
    pub unparsed: Vec<UnparsedLine>,
}

fn is_sep(c: char) -> bool {
    c == ':' || c.is_whitespace()
}

/// Parses a single `name SEP score [SEP feedback]` line.
///
/// The name is the shortest non-empty prefix that is followed by a separator
/// run and at least one ASCII digit. Anything after the digits that does not
/// start with a separator is ignored, so `홍길동 95점` still reads as 95.
pub fn parse_score_line(line: &str) -> Option<(String, i64, Option<String>)> {
    let chars: Vec<char> = line.chars().collect();
    let n = chars.len();
    for i in 1..n {
        if !is_sep(chars[i]) {
            continue;
        }
        let mut j = i;
        while j < n && is_sep(chars[j]) {
            j += 1;
        }
        if j >= n || !chars[j].is_ascii_digit() {
            continue;
        }
        let mut k = j;
        while k < n && chars[k].is_ascii_digit() {
            k += 1;
        }
        let name: String = chars[..i].iter().collect::<String>().trim().to_string();
        if name.is_empty() {
            return None;
        }
        let digits: String = chars[j..k].iter().collect();
        let score = digits.parse::<i64>().ok()?;

        let mut feedback = None;
        if k < n && is_sep(chars[k]) {
            let mut m = k;
            while m < n && is_sep(chars[m]) {
                m += 1;
            }
            let rest: String = chars[m..].iter().collect::<String>().trim().to_string();
            if !rest.is_empty() {
                feedback = Some(rest);
            }
        }
        return Some((name, score, feedback));
    }
    None
}

pub fn parse_bulk_scores(text: &str) -> BulkParse {
    let mut out = BulkParse::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 1;
        match parse_score_line(line) {
            Some((name, score, feedback)) => out.rows.push(ParsedScore {
                line_no,
                name,
                score,
                feedback,
            }),
            None => out.unparsed.push(UnparsedLine {
                line_no,
                text: line.to_string(),
            }),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedScore {
    pub line_no: usize,
    pub student_id: String,
    pub student_name: String,
    pub score: i64,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub matched: Vec<MatchedScore>,
    pub unmatched: Vec<ParsedScore>,
}

/// Binds parsed rows to roster students by exact name, in input order.
/// A student is used at most once; a repeated name takes the next unused
/// student carrying that name.
pub fn match_roster(rows: &[ParsedScore], roster: &[RosterEntry]) -> MatchOutcome {
    let mut used: HashSet<&str> = HashSet::new();
    let mut out = MatchOutcome::default();
    for row in rows {
        let hit = roster
            .iter()
            .find(|s| s.name.trim() == row.name && !used.contains(s.id.as_str()));
        match hit {
            Some(student) => {
                used.insert(student.id.as_str());
                out.matched.push(MatchedScore {
                    line_no: row.line_no,
                    student_id: student.id.clone(),
                    student_name: student.name.clone(),
                    score: row.score,
                    feedback: row.feedback.clone(),
                });
            }
            None => out.unmatched.push(row.clone()),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBucket {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamStats {
    pub count: usize,
    pub average: Option<f64>,
    pub highest: Option<i64>,
    pub lowest: Option<i64>,
    pub distribution: Vec<DistributionBucket>,
}

/// Ten percent buckets (0-9, 10-19, ... 90-100) over `score / max_score`.
pub fn exam_stats(scores: &[i64], max_score: i64) -> ExamStats {
    let mut counts = [0usize; 10];
    if max_score > 0 {
        for &s in scores {
            let pct = (s.max(0) as f64) * 100.0 / (max_score as f64);
            let idx = ((pct / 10.0).floor() as usize).min(9);
            counts[idx] += 1;
        }
    }
    let distribution = counts
        .iter()
        .enumerate()
        .map(|(i, &count)| {
            let lo = i * 10;
            let hi = if i == 9 { 100 } else { lo + 9 };
            DistributionBucket {
                label: format!("{}-{}", lo, hi),
                count,
            }
        })
        .collect();

    let count = scores.len();
    let average = if count > 0 {
        let sum: i64 = scores.iter().sum();
        Some(round_2(sum as f64 / count as f64))
    } else {
        None
    };
    ExamStats {
        count,
        average,
        highest: scores.iter().copied().max(),
        lowest: scores.iter().copied().min(),
        distribution,
    }
}

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(names: &[(&str, &str)]) -> Vec<RosterEntry> {
        names
            .iter()
            .map(|(id, name)| RosterEntry {
                id: id.to_string(),
                name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn parses_all_separator_styles() {
        assert_eq!(
            parse_score_line("김민준 95"),
            Some(("김민준".to_string(), 95, None))
        );
        assert_eq!(
            parse_score_line("김민준:88:계산 실수 주의"),
            Some(("김민준".to_string(), 88, Some("계산 실수 주의".to_string())))
        );
        assert_eq!(
            parse_score_line("Lee Ji\t\t70 \t good"),
            Some(("Lee Ji".to_string(), 70, Some("good".to_string())))
        );
        assert_eq!(
            parse_score_line("김민준\t95\t잘했어요"),
            Some(("김민준".to_string(), 95, Some("잘했어요".to_string())))
        );
        assert_eq!(
            parse_score_line("박서연 : 100점"),
            Some(("박서연".to_string(), 100, None))
        );
    }

    #[test]
    fn shortest_name_prefix_wins() {
        let (name, score, feedback) = parse_score_line("Kim 2 95 retake").expect("parsed");
        assert_eq!(name, "Kim");
        assert_eq!(score, 2);
        assert_eq!(feedback.as_deref(), Some("95 retake"));
    }

    #[test]
    fn lines_without_score_are_unparsed() {
        let parsed = parse_bulk_scores("김민준 95\n\n이름만\n  \n:99\n최유나 80");
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[1].line_no, 6);
        assert_eq!(
            parsed.unparsed,
            vec![
                UnparsedLine { line_no: 3, text: "이름만".to_string() },
                UnparsedLine { line_no: 5, text: ":99".to_string() },
            ]
        );
    }

    #[test]
    fn duplicate_names_bind_to_distinct_students() {
        let rows = parse_bulk_scores("김민준 90\n김민준 80\n김민준 70\n없는학생 50").rows;
        let outcome = match_roster(
            &rows,
            &roster(&[("s1", "김민준"), ("s2", "이서준"), ("s3", "김민준")]),
        );
        let ids: Vec<&str> = outcome.matched.iter().map(|m| m.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert_eq!(outcome.matched[1].score, 80);
        let unmatched: Vec<usize> = outcome.unmatched.iter().map(|r| r.line_no).collect();
        assert_eq!(unmatched, vec![3, 4]);
    }

    #[test]
    fn stats_bucket_by_percent_of_max() {
        let stats = exam_stats(&[100, 95, 40, 0, 9], 100);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.highest, Some(100));
        assert_eq!(stats.lowest, Some(0));
        assert_eq!(stats.average, Some(48.8));
        assert_eq!(stats.distribution[0].count, 2);
        assert_eq!(stats.distribution[4].count, 1);
        assert_eq!(stats.distribution[9].count, 2);
        assert_eq!(stats.distribution[9].label, "90-100");

        let empty = exam_stats(&[], 50);
        assert_eq!(empty.average, None);
        assert!(empty.distribution.iter().all(|b| b.count == 0));
    }
}
