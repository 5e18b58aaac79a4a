use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, SecondsFormat,
    TimeZone, Timelike, Utc, Weekday,
};
use serde::Serialize;
use serde_json::Value;

pub const WEEKDAY_KEYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Minutes since midnight for `HH:MM` or `HH:MM:SS`. Seconds are dropped.
pub fn parse_time_of_day(s: &str) -> Option<u32> {
    let mut parts = s.trim().split(':');
    let h = parts.next()?.trim().parse::<u32>().ok()?;
    let m = parts.next()?.trim().parse::<u32>().ok()?;
    if let Some(sec) = parts.next() {
        let sec = sec.trim().parse::<u32>().ok()?;
        if sec > 59 {
            return None;
        }
    }
    if parts.next().is_some() || h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_time_of_day(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Stored timestamp format. Fixed width so string order equals time order.
pub fn to_stored(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn local_time(now: DateTime<Utc>, offset_minutes: i64) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt((offset_minutes * 60) as i32)
        .unwrap_or_else(|| Utc.fix());
    now.with_timezone(&offset)
}

pub fn minutes_of_day<T: Timelike>(t: &T) -> u32 {
    t.hour() * 60 + t.minute()
}

/// UTC instants bounding one local calendar day.
pub fn local_day_bounds(date: NaiveDate, offset_minutes: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_local = date.and_time(NaiveTime::MIN);
    let start = Utc.from_utc_datetime(&start_local) - Duration::minutes(offset_minutes);
    (start, start + Duration::days(1))
}

pub fn weekday_key(w: Weekday) -> &'static str {
    WEEKDAY_KEYS[w.num_days_from_monday() as usize]
}

pub fn weekday_korean(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "월",
        Weekday::Tue => "화",
        Weekday::Wed => "수",
        Weekday::Thu => "목",
        Weekday::Fri => "금",
        Weekday::Sat => "토",
        Weekday::Sun => "일",
    }
}

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    let t = s.trim().to_ascii_lowercase();
    let t = t.trim_end_matches("요일");
    match t {
        "monday" | "mon" | "월" => Some(Weekday::Mon),
        "tuesday" | "tue" | "화" => Some(Weekday::Tue),
        "wednesday" | "wed" | "수" => Some(Weekday::Wed),
        "thursday" | "thu" | "목" => Some(Weekday::Thu),
        "friday" | "fri" | "금" => Some(Weekday::Fri),
        "saturday" | "sat" | "토" => Some(Weekday::Sat),
        "sunday" | "sun" | "일" => Some(Weekday::Sun),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSlot {
    pub day: String,
    pub start_time: String,
    pub end_time: String,
}

impl ClassSlot {
    pub fn start_minutes(&self) -> u32 {
        parse_time_of_day(&self.start_time).unwrap_or(0)
    }

    pub fn end_minutes(&self) -> u32 {
        parse_time_of_day(&self.end_time).unwrap_or(0)
    }
}

/// Validates a weekly class schedule `[{day, startTime, endTime}]`.
pub fn parse_class_schedule(v: &Value) -> Result<Vec<ClassSlot>, String> {
    let Some(items) = v.as_array() else {
        return Err("schedule must be an array".to_string());
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = |key: &str| -> Result<String, String> {
            item.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .ok_or_else(|| format!("schedule[{}].{} must be string", i, key))
        };
        let day = field("day")?;
        if parse_weekday(&day).is_none() {
            return Err(format!("schedule[{}].day is not a weekday", i));
        }
        let start_time = field("startTime")?;
        let end_time = field("endTime")?;
        let (Some(start), Some(end)) = (parse_time_of_day(&start_time), parse_time_of_day(&end_time))
        else {
            return Err(format!("schedule[{}] times must be HH:MM", i));
        };
        if end <= start {
            return Err(format!("schedule[{}].endTime must be after startTime", i));
        }
        out.push(ClassSlot {
            day,
            start_time,
            end_time,
        });
    }
    Ok(out)
}

/// Schedule row for a weekday: the English key first, then the Korean day name.
pub fn slot_for_day(slots: &[ClassSlot], day: Weekday) -> Option<&ClassSlot> {
    let key = weekday_key(day);
    slots
        .iter()
        .find(|s| s.day.trim().eq_ignore_ascii_case(key))
        .or_else(|| {
            let ko = weekday_korean(day);
            slots
                .iter()
                .find(|s| s.day.trim().trim_end_matches("요일") == ko)
        })
}

/// Minutes scheduled across every date of a month.
pub fn monthly_scheduled_minutes(slots: &[ClassSlot], year: i32, month: u32) -> i64 {
    let Some(mut d) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return 0;
    };
    let mut total = 0i64;
    while d.month() == month {
        for slot in slots {
            if parse_weekday(&slot.day) == Some(d.weekday()) {
                total += i64::from(slot.end_minutes().saturating_sub(slot.start_minutes()));
            }
        }
        let Some(next) = d.succ_opt() else { break };
        d = next;
    }
    total
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Scheduled,
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "present" => Some(Self::Present),
            "late" => Some(Self::Late),
            "absent" => Some(Self::Absent),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
            Self::Excused => "excused",
        }
    }

    fn priority(self) -> u8 {
        match self {
            Self::Absent => 4,
            Self::Late => 3,
            Self::Present => 2,
            Self::Excused => 1,
            Self::Scheduled => 0,
        }
    }
}

/// Day status across several classes: absent > late > present > excused > scheduled.
pub fn aggregate_status<I>(statuses: I) -> AttendanceStatus
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    statuses
        .into_iter()
        .max_by_key(|s| s.priority())
        .unwrap_or(AttendanceStatus::Scheduled)
}

/// Seat check-in against a class start: late once the grace period has passed.
pub fn class_check_in_status(check_in_minutes: u32, start_minutes: u32, grace_minutes: u32) -> AttendanceStatus {
    if check_in_minutes > start_minutes + grace_minutes {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommuteStatus {
    Scheduled,
    Present,
    Late,
    Absent,
}

impl CommuteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
        }
    }
}

/// Compares the first check-in of the day with the scheduled check-in.
/// Without a check-in the student only counts as absent once `now_minutes`
/// is past the scheduled time.
pub fn derive_commute_status(
    scheduled_minutes: u32,
    first_check_in_minutes: Option<u32>,
    now_minutes: u32,
) -> CommuteStatus {
    match first_check_in_minutes {
        Some(m) if m <= scheduled_minutes => CommuteStatus::Present,
        Some(_) => CommuteStatus::Late,
        None if now_minutes > scheduled_minutes => CommuteStatus::Absent,
        None => CommuteStatus::Scheduled,
    }
}

/// Whole minutes between two instants, rounded up. Never negative.
pub fn duration_minutes_ceil(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let secs = (end - start).num_seconds().max(0);
    (secs + 59) / 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn time_of_day_accepts_optional_seconds() {
        assert_eq!(parse_time_of_day("09:30"), Some(570));
        assert_eq!(parse_time_of_day("18:05:59"), Some(1085));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("9"), None);
        assert_eq!(parse_time_of_day("10:00:00:00"), None);
        assert_eq!(format_time_of_day(570), "09:30");
    }

    #[test]
    fn commute_absent_only_after_scheduled_time() {
        let nine = 9 * 60;
        assert_eq!(derive_commute_status(nine, None, nine), CommuteStatus::Scheduled);
        assert_eq!(derive_commute_status(nine, None, nine + 1), CommuteStatus::Absent);
        assert_eq!(derive_commute_status(nine, Some(nine), nine + 30), CommuteStatus::Present);
        assert_eq!(derive_commute_status(nine, Some(nine + 1), nine + 30), CommuteStatus::Late);
    }

    #[test]
    fn aggregate_prefers_worst_status() {
        use AttendanceStatus::*;
        assert_eq!(aggregate_status([Present, Late, Excused]), Late);
        assert_eq!(aggregate_status([Present, Absent, Late]), Absent);
        assert_eq!(aggregate_status([Scheduled, Excused]), Excused);
        assert_eq!(aggregate_status(Vec::new()), Scheduled);
    }

    #[test]
    fn grace_period_is_inclusive() {
        assert_eq!(class_check_in_status(610, 600, 10), AttendanceStatus::Present);
        assert_eq!(class_check_in_status(611, 600, 10), AttendanceStatus::Late);
    }

    #[test]
    fn slot_lookup_falls_back_to_korean_day_name() {
        let slots = parse_class_schedule(&json!([
            {"day": "화", "startTime": "16:00", "endTime": "18:00"},
            {"day": "thursday", "startTime": "17:00", "endTime": "18:30"}
        ]))
        .expect("valid schedule");
        assert_eq!(slot_for_day(&slots, Weekday::Tue).map(|s| s.start_minutes()), Some(960));
        assert_eq!(slot_for_day(&slots, Weekday::Thu).map(|s| s.end_minutes()), Some(1110));
        assert!(slot_for_day(&slots, Weekday::Mon).is_none());
    }

    #[test]
    fn schedule_rejects_inverted_times() {
        let err = parse_class_schedule(&json!([
            {"day": "monday", "startTime": "18:00", "endTime": "17:00"}
        ]))
        .unwrap_err();
        assert!(err.contains("endTime"));
    }

    #[test]
    fn monthly_minutes_counts_each_matching_date() {
        let slots = vec![ClassSlot {
            day: "monday".to_string(),
            start_time: "10:00".to_string(),
            end_time: "11:30".to_string(),
        }];
        // March 2026 has five Mondays.
        assert_eq!(monthly_scheduled_minutes(&slots, 2026, 3), 5 * 90);
    }

    #[test]
    fn local_day_bounds_follow_offset() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        let (start, end) = local_day_bounds(date, 540);
        assert_eq!(to_stored(start), "2026-03-01T15:00:00Z");
        assert_eq!(to_stored(end), "2026-03-02T15:00:00Z");
    }

    #[test]
    fn ceil_minutes_rounds_partial_minutes_up() {
        let a = parse_instant("2026-03-02T09:00:00Z").expect("a");
        let b = parse_instant("2026-03-02T09:10:01Z").expect("b");
        assert_eq!(duration_minutes_ceil(a, b), 11);
        assert_eq!(duration_minutes_ceil(b, a), 0);
    }
}
