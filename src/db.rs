use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "academy.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS organizations(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            owner_name TEXT,
            address TEXT,
            phone TEXT,
            email TEXT,
            logo_url TEXT,
            subscription_plan TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            address TEXT,
            phone TEXT,
            manager_name TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'available',
            notes TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            org_id TEXT,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            phone TEXT,
            role TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_branches_org ON branches(org_id)",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_rooms_org ON rooms(org_id)", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            grade TEXT,
            student_code TEXT,
            parent_phone TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_org ON students(org_id)",
        [],
    )?;
    // Hour-pass columns arrived after the first roster release.
    ensure_students_pass_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS commute_schedules(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            weekday TEXT NOT NULL,
            check_in_time TEXT,
            check_out_time TEXT,
            notes TEXT,
            UNIQUE(student_id, weekday),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS consultations(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            student_grade TEXT,
            parent_name TEXT NOT NULL,
            parent_phone TEXT NOT NULL,
            parent_email TEXT,
            goals TEXT,
            preferred_times TEXT,
            scheduled_date TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            notes TEXT,
            result TEXT,
            enrolled_date TEXT,
            images_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_consultations_org ON consultations(org_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS waitlists(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            consultation_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS waitlist_consultations(
            id TEXT PRIMARY KEY,
            waitlist_id TEXT NOT NULL,
            consultation_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(waitlist_id, consultation_id),
            FOREIGN KEY(waitlist_id) REFERENCES waitlists(id),
            FOREIGN KEY(consultation_id) REFERENCES consultations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_waitlist_consultations_consultation
         ON waitlist_consultations(consultation_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            title TEXT NOT NULL,
            subject TEXT,
            description TEXT,
            class_id TEXT,
            exam_date TEXT NOT NULL,
            exam_time TEXT,
            max_score INTEGER NOT NULL DEFAULT 100,
            status TEXT NOT NULL DEFAULT 'scheduled',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_scores(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            notes TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(exam_id, student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expense_categories(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            color TEXT NOT NULL DEFAULT '#6b7280',
            is_active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(org_id, name),
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS revenue_categories(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(org_id, name),
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            amount REAL NOT NULL,
            expense_date TEXT NOT NULL,
            description TEXT NOT NULL,
            notes TEXT,
            is_recurring INTEGER NOT NULL DEFAULT 0,
            recurring_type TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(category_id) REFERENCES expense_categories(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_org_date ON expenses(org_id, expense_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT,
            subjects_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            employment_type TEXT NOT NULL DEFAULT 'full_time',
            salary_type TEXT NOT NULL DEFAULT 'monthly',
            salary_amount REAL NOT NULL DEFAULT 0,
            hire_date TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(org_id, email),
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_students(
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, student_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            subject TEXT,
            teacher_id TEXT,
            schedule_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            enrolled_at TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_enrollments_student ON class_enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS seat_config(
            org_id TEXT PRIMARY KEY,
            type_name TEXT NOT NULL,
            total_seats INTEGER NOT NULL,
            FOREIGN KEY(org_id) REFERENCES organizations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS seat_assignments(
            org_id TEXT NOT NULL,
            seat_number INTEGER NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'checked_out',
            session_start_time TEXT,
            allocated_minutes INTEGER,
            assigned_at TEXT NOT NULL,
            PRIMARY KEY(org_id, seat_number),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sleep_records(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            seat_number INTEGER NOT NULL,
            date TEXT NOT NULL,
            sleep_time TEXT NOT NULL,
            wake_time TEXT,
            duration_minutes INTEGER,
            status TEXT NOT NULL DEFAULT 'sleeping',
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS outing_records(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            seat_number INTEGER NOT NULL,
            date TEXT NOT NULL,
            outing_time TEXT NOT NULL,
            return_time TEXT,
            duration_minutes INTEGER,
            reason TEXT,
            status TEXT NOT NULL DEFAULT 'out',
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS call_records(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            seat_number INTEGER NOT NULL,
            date TEXT NOT NULL,
            call_time TEXT NOT NULL,
            acknowledged_time TEXT,
            message TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'calling',
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sleep_records_org_date ON sleep_records(org_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outing_records_org_date ON outing_records(org_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_call_records_org_date ON call_records(org_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_events(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            event_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // class_id '' stands for "no class" so the unique key also covers free study days.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            check_in_time TEXT,
            check_out_time TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(org_id, student_id, class_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_org_date ON attendance(org_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_logs(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            seat_number INTEGER,
            check_in_time TEXT NOT NULL,
            check_out_time TEXT,
            duration_minutes INTEGER,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_logs_student ON attendance_logs(student_id, check_in_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plans(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            description TEXT,
            price_monthly INTEGER NOT NULL DEFAULT 0,
            price_yearly INTEGER NOT NULL DEFAULT 0,
            max_users INTEGER NOT NULL DEFAULT 5,
            max_students INTEGER NOT NULL DEFAULT 30,
            max_teachers INTEGER NOT NULL DEFAULT 3,
            max_classes INTEGER NOT NULL DEFAULT 5,
            features_json TEXT NOT NULL DEFAULT '[]',
            is_active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS message_pricing(
            message_type TEXT PRIMARY KEY,
            price INTEGER NOT NULL,
            cost INTEGER,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    seed_message_pricing(&conn)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs(
            id TEXT PRIMARY KEY,
            admin_id TEXT,
            action TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT,
            changes_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_logs(
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            user_id TEXT,
            user_role TEXT,
            action_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            entity_name TEXT,
            description TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_logs_org ON activity_logs(org_id, created_at)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

pub fn settings_delete_prefix(conn: &Connection, prefix: &str) -> anyhow::Result<usize> {
    let pattern = format!("{}%", prefix);
    Ok(conn.execute("DELETE FROM settings WHERE key LIKE ?", [pattern])?)
}

fn seed_message_pricing(conn: &Connection) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    for (message_type, price, cost) in [("sms", 20_i64, 10_i64), ("kakao_alimtalk", 15, 7)] {
        conn.execute(
            "INSERT OR IGNORE INTO message_pricing(message_type, price, cost, updated_at)
             VALUES(?, ?, ?, ?)",
            (message_type, price, cost, &now),
        )?;
    }
    Ok(())
}

fn ensure_students_pass_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "pass_type")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN pass_type TEXT NOT NULL DEFAULT 'period'",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "remaining_minutes")? {
        conn.execute("ALTER TABLE students ADD COLUMN remaining_minutes INTEGER", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("{}-{}", prefix, nanos))
    }

    #[test]
    fn open_db_is_idempotent_and_seeds_pricing() {
        let ws = temp_workspace("academy-db-open");
        let conn = open_db(&ws).expect("first open");
        drop(conn);
        let conn = open_db(&ws).expect("second open");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_pricing", [], |r| r.get(0))
            .expect("count pricing");
        assert_eq!(n, 2);
        assert!(table_has_column(&conn, "students", "remaining_minutes").expect("pragma"));
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn settings_roundtrip_and_prefix_delete() {
        let ws = temp_workspace("academy-db-settings");
        let conn = open_db(&ws).expect("open");
        assert!(settings_get_json(&conn, "setup.o1.seats").expect("get").is_none());
        settings_set_json(&conn, "setup.o1.seats", &serde_json::json!({"a": 1})).expect("set");
        settings_set_json(&conn, "setup.o1.seats", &serde_json::json!({"a": 2})).expect("set");
        let v = settings_get_json(&conn, "setup.o1.seats").expect("get");
        assert_eq!(v, Some(serde_json::json!({"a": 2})));
        assert_eq!(settings_delete_prefix(&conn, "setup.o1.").expect("delete"), 1);
        let _ = std::fs::remove_dir_all(ws);
    }
}
