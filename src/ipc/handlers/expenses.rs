use crate::grading::round_2;
use crate::ipc::helpers::{
    commit_err, delete_err, get_optional_bool, get_optional_date, get_optional_f64,
    get_optional_i64, get_optional_str, get_required_date, get_required_f64, get_required_str,
    get_string_list, has_key, insert_err, is_unique_violation, new_id, now_stored, query_err,
    run_org, tx_err, update_err, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One of the two per-organization category lists.
struct CategoryKind {
    table: &'static str,
    label: &'static str,
    has_color: bool,
    defaults: &'static [(&'static str, &'static str)],
}

static EXPENSE_CATEGORIES: CategoryKind = CategoryKind {
    table: "expense_categories",
    label: "expense category",
    has_color: true,
    defaults: &[
        ("강사 급여", "#3b82f6"),
        ("임대료", "#8b5cf6"),
        ("관리비", "#ec4899"),
        ("교재/교구", "#f59e0b"),
        ("마케팅", "#10b981"),
        ("기타", "#6b7280"),
    ],
};

static REVENUE_CATEGORIES: CategoryKind = CategoryKind {
    table: "revenue_categories",
    label: "revenue category",
    has_color: false,
    defaults: &[("수강료", ""), ("자릿세", ""), ("룸이용료", ""), ("교재판매", "")],
};

const DEFAULT_COLOR: &str = "#6b7280";
const RECURRING_TYPES: [&str; 2] = ["weekly", "monthly"];

fn valid_color(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 7 && b[0] == b'#' && b[1..].iter().all(|c| c.is_ascii_hexdigit())
}

fn parse_color(params: &Value) -> Result<Option<String>, HandlerErr> {
    let c = get_optional_str(params, "color")?;
    if let Some(s) = c.as_deref() {
        if !valid_color(s) {
            return Err(HandlerErr::bad_params("color must be #rrggbb"));
        }
    }
    Ok(c.map(|s| s.to_ascii_lowercase()))
}

impl CategoryKind {
    fn columns(&self) -> &'static str {
        if self.has_color {
            "id, name, description, color, is_active, sort_order, created_at"
        } else {
            "id, name, description, NULL, is_active, sort_order, created_at"
        }
    }

    fn row_json(&self, r: &Row) -> rusqlite::Result<Value> {
        let mut v = json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "description": r.get::<_, Option<String>>(2)?,
            "isActive": r.get::<_, i64>(4)? != 0,
            "order": r.get::<_, i64>(5)?,
            "createdAt": r.get::<_, String>(6)?,
        });
        if self.has_color {
            v["color"] = json!(r.get::<_, String>(3)?);
        }
        Ok(v)
    }

    /// Seeds the default list the first time an organization touches it.
    fn ensure_defaults(&self, conn: &Connection, org_id: &str) -> Result<(), HandlerErr> {
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE org_id = ?", self.table),
                [org_id],
                |r| r.get(0),
            )
            .map_err(query_err)?;
        if count > 0 {
            return Ok(());
        }
        let now = now_stored();
        for (i, (name, color)) in self.defaults.iter().enumerate() {
            let inserted = if self.has_color {
                conn.execute(
                    &format!(
                        "INSERT INTO {}(id, org_id, name, color, is_active, sort_order, created_at)
                         VALUES(?, ?, ?, ?, 1, ?, ?)",
                        self.table
                    ),
                    (new_id(), org_id, name, color, i as i64, &now),
                )
            } else {
                conn.execute(
                    &format!(
                        "INSERT INTO {}(id, org_id, name, is_active, sort_order, created_at)
                         VALUES(?, ?, ?, 1, ?, ?)",
                        self.table
                    ),
                    (new_id(), org_id, name, i as i64, &now),
                )
            };
            inserted.map_err(insert_err(self.table))?;
        }
        Ok(())
    }

    fn load(&self, conn: &Connection, org_id: &str, id: &str) -> Result<Value, HandlerErr> {
        conn.query_row(
            &format!(
                "SELECT {} FROM {} WHERE id = ? AND org_id = ?",
                self.columns(),
                self.table
            ),
            (id, org_id),
            |r| self.row_json(r),
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found(self.label))
    }

    fn list(&self, ctx: &OrgCtx) -> Result<Value, HandlerErr> {
        self.ensure_defaults(ctx.conn, ctx.org_id)?;
        let mut stmt = ctx
            .conn
            .prepare(&format!(
                "SELECT {} FROM {} WHERE org_id = ? ORDER BY sort_order, created_at",
                self.columns(),
                self.table
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map([ctx.org_id], |r| self.row_json(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        Ok(json!({ "categories": rows }))
    }

    fn next_order(&self, conn: &Connection, org_id: &str) -> Result<i64, HandlerErr> {
        conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM {} WHERE org_id = ?",
                self.table
            ),
            [org_id],
            |r| r.get(0),
        )
        .map_err(query_err)
    }

    fn name_conflict(&self) -> impl Fn(rusqlite::Error) -> HandlerErr + '_ {
        move |e| {
            if is_unique_violation(&e) {
                HandlerErr::conflict(format!("{} name already exists", self.label))
            } else {
                insert_err(self.table)(e)
            }
        }
    }

    fn insert(
        &self,
        conn: &Connection,
        org_id: &str,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
    ) -> Result<String, HandlerErr> {
        self.ensure_defaults(conn, org_id)?;
        let id = new_id();
        let order = self.next_order(conn, org_id)?;
        let now = now_stored();
        let inserted = if self.has_color {
            conn.execute(
                &format!(
                    "INSERT INTO {}(id, org_id, name, description, color, is_active, sort_order, created_at)
                     VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
                    self.table
                ),
                (&id, org_id, name, description, color.unwrap_or(DEFAULT_COLOR), order, &now),
            )
        } else {
            conn.execute(
                &format!(
                    "INSERT INTO {}(id, org_id, name, description, is_active, sort_order, created_at)
                     VALUES(?, ?, ?, ?, 1, ?, ?)",
                    self.table
                ),
                (&id, org_id, name, description, order, &now),
            )
        };
        inserted.map_err(self.name_conflict())?;
        Ok(id)
    }

    fn create(&self, ctx: &OrgCtx) -> Result<Value, HandlerErr> {
        let name = get_required_str(ctx.params, "name")?;
        let description = get_optional_str(ctx.params, "description")?;
        let color = if self.has_color { parse_color(ctx.params)? } else { None };
        let id = self.insert(ctx.conn, ctx.org_id, &name, description.as_deref(), color.as_deref())?;
        Ok(json!({ "category": self.load(ctx.conn, ctx.org_id, &id)? }))
    }

    fn update(&self, ctx: &OrgCtx) -> Result<Value, HandlerErr> {
        let id = get_required_str(ctx.params, "id")?;
        self.load(ctx.conn, ctx.org_id, &id)?;
        let mut patch = Patch::default();
        patch.required_text(ctx.params, "name", "name")?;
        patch.text(ctx.params, "description", "description")?;
        if self.has_color && has_key(ctx.params, "color") {
            let color = parse_color(ctx.params)?;
            patch.set("color", color.unwrap_or_else(|| DEFAULT_COLOR.to_string()));
        }
        patch.bool(ctx.params, "isActive", "is_active")?;
        if let Some(order) = get_optional_i64(ctx.params, "order")? {
            patch.set("sort_order", order);
        }
        patch.execute(
            ctx.conn,
            self.table,
            "id = ? AND org_id = ?",
            vec![id.clone().into(), ctx.org_id.to_string().into()],
        )?;
        Ok(json!({ "category": self.load(ctx.conn, ctx.org_id, &id)? }))
    }

    fn delete(&self, ctx: &OrgCtx) -> Result<Value, HandlerErr> {
        let id = get_required_str(ctx.params, "id")?;
        self.load(ctx.conn, ctx.org_id, &id)?;
        if self.has_color {
            let used: i64 = ctx
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM expenses WHERE category_id = ?",
                    [&id],
                    |r| r.get(0),
                )
                .map_err(query_err)?;
            if used > 0 {
                return Err(HandlerErr::conflict(format!(
                    "{} is used by {} expenses",
                    self.label, used
                ))
                .with_details(json!({ "expenseCount": used })));
            }
        }
        ctx.conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ? AND org_id = ?", self.table),
                (&id, ctx.org_id),
            )
            .map_err(delete_err(self.table))?;
        Ok(json!({ "ok": true }))
    }

    /// Rejects an order that repeats an id or leaves a category out.
    fn check_complete_order(&self, ctx: &OrgCtx, ids: &[String]) -> Result<(), HandlerErr> {
        let mut stmt = ctx
            .conn
            .prepare(&format!("SELECT id FROM {} WHERE org_id = ?", self.table))
            .map_err(query_err)?;
        let existing: HashSet<String> = stmt
            .query_map([ctx.org_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<_, _>>())
            .map_err(query_err)?;
        let given: HashSet<&str> = ids.iter().map(String::as_str).collect();
        if given.len() != ids.len() {
            return Err(HandlerErr::bad_params("ids contains duplicates"));
        }
        if let Some(unknown) = ids.iter().find(|id| !existing.contains(id.as_str())) {
            return Err(HandlerErr::not_found(self.label).with_details(json!({ "id": unknown })));
        }
        if given.len() != existing.len() {
            let missing: Vec<&str> = existing
                .iter()
                .map(String::as_str)
                .filter(|id| !given.contains(id))
                .collect();
            return Err(HandlerErr::bad_params(format!("ids must list every {}", self.label))
                .with_details(json!({ "missingIds": missing })));
        }
        Ok(())
    }

    /// `ids` lists every category of the organization in the new order.
    fn reorder(&self, ctx: &OrgCtx) -> Result<Value, HandlerErr> {
        let ids = get_string_list(ctx.params, "ids")?
            .ok_or_else(|| HandlerErr::bad_params("missing ids"))?;
        self.ensure_defaults(ctx.conn, ctx.org_id)?;
        self.check_complete_order(ctx, &ids)?;
        let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
        for (i, id) in ids.iter().enumerate() {
            let n = tx
                .execute(
                    &format!(
                        "UPDATE {} SET sort_order = ? WHERE id = ? AND org_id = ?",
                        self.table
                    ),
                    (i as i64, id, ctx.org_id),
                )
                .map_err(update_err(self.table))?;
            if n == 0 {
                return Err(HandlerErr::not_found(self.label).with_details(json!({ "id": id })));
            }
        }
        tx.commit().map_err(commit_err)?;
        self.list(ctx)
    }
}

/// Finds an expense category by name, creating it when missing.
fn resolve_expense_category(conn: &Connection, org_id: &str, name: &str) -> Result<String, HandlerErr> {
    EXPENSE_CATEGORIES.ensure_defaults(conn, org_id)?;
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM expense_categories WHERE org_id = ? AND name = ?",
            (org_id, name),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    match found {
        Some(id) => Ok(id),
        None => EXPENSE_CATEGORIES.insert(conn, org_id, name, None, None),
    }
}

const EXPENSE_COLUMNS: &str = "e.id, e.category_id, c.name, c.color, e.amount, e.expense_date, \
                               e.description, e.notes, e.is_recurring, e.recurring_type, e.created_at";

struct ExpenseRow {
    category_id: String,
    category: String,
    color: String,
    amount: f64,
    expense_date: String,
    json: Value,
}

fn expense_row(r: &Row) -> rusqlite::Result<ExpenseRow> {
    let category_id: String = r.get(1)?;
    let category: String = r.get(2)?;
    let color: String = r.get(3)?;
    let amount: f64 = r.get(4)?;
    let expense_date: String = r.get(5)?;
    let json = json!({
        "id": r.get::<_, String>(0)?,
        "categoryId": category_id,
        "category": category,
        "categoryColor": color,
        "amount": amount,
        "expenseDate": expense_date,
        "description": r.get::<_, String>(6)?,
        "notes": r.get::<_, Option<String>>(7)?,
        "isRecurring": r.get::<_, i64>(8)? != 0,
        "recurringType": r.get::<_, Option<String>>(9)?,
        "createdAt": r.get::<_, String>(10)?,
    });
    Ok(ExpenseRow {
        category_id,
        category,
        color,
        amount,
        expense_date,
        json,
    })
}

fn load_expense(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} FROM expenses e JOIN expense_categories c ON c.id = e.category_id
                 WHERE e.id = ? AND e.org_id = ?",
                EXPENSE_COLUMNS
            ),
            (id, ctx.org_id),
            expense_row,
        )
        .optional()
        .map_err(query_err)?
        .map(|row| row.json)
        .ok_or_else(|| HandlerErr::not_found("expense"))
}

fn month_key(date: &str) -> &str {
    date.get(..7).unwrap_or(date)
}

fn parse_day(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// The days of the month before `key` that match the part of `key` the list
/// filter covers. Day numbers past the end of a shorter month fall on its last day.
fn previous_window(key: &str, start: Option<&str>, end: Option<&str>) -> Option<(String, String)> {
    let first = parse_day(&format!("{}-01", key))?;
    let prev_last = first.pred_opt()?;
    let last_day = prev_last.day();
    let day_in_month = |d: Option<&str>| {
        d.filter(|d| month_key(d) == key)
            .and_then(parse_day)
            .map(|d| d.day().min(last_day))
    };
    let from = prev_last.with_day(day_in_month(start).unwrap_or(1))?;
    let to = prev_last.with_day(day_in_month(end).unwrap_or(last_day))?;
    Some((
        from.format("%Y-%m-%d").to_string(),
        to.format("%Y-%m-%d").to_string(),
    ))
}

fn month_total(conn: &Connection, org_id: &str, start: &str, end: &str) -> Result<f64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM expenses
         WHERE org_id = ? AND expense_date >= ? AND expense_date <= ?",
        (org_id, start, end),
        |r| r.get(0),
    )
    .map_err(query_err)
}

fn monthly_summaries(
    conn: &Connection,
    org_id: &str,
    rows: &[ExpenseRow],
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<Value>, HandlerErr> {
    // month -> category id -> (name, color, amount)
    let mut months: BTreeMap<String, HashMap<String, (String, String, f64)>> = BTreeMap::new();
    for row in rows {
        let entry = months
            .entry(month_key(&row.expense_date).to_string())
            .or_default()
            .entry(row.category_id.clone())
            .or_insert_with(|| (row.category.clone(), row.color.clone(), 0.0));
        entry.2 += row.amount;
    }

    let mut out = Vec::with_capacity(months.len());
    for (month, cats) in months.iter().rev() {
        let total: f64 = cats.values().map(|c| c.2).sum();
        let mut categories: Vec<(&String, &(String, String, f64))> = cats.iter().collect();
        categories.sort_by(|a, b| {
            b.1 .2
                .partial_cmp(&a.1 .2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1 .0.cmp(&b.1 .0))
        });
        let categories: Vec<Value> = categories
            .into_iter()
            .map(|(id, (name, color, amount))| {
                json!({
                    "categoryId": id,
                    "category": name,
                    "color": color,
                    "amount": round_2(*amount),
                    "percent": if total > 0.0 { round_2(amount * 100.0 / total) } else { 0.0 },
                })
            })
            .collect();
        let previous_total = match previous_window(month, start, end) {
            Some((from, to)) => month_total(conn, org_id, &from, &to)?,
            None => 0.0,
        };
        let change_percent = if previous_total > 0.0 {
            Some(round_2((total - previous_total) * 100.0 / previous_total))
        } else {
            None
        };
        out.push(json!({
            "month": month,
            "total": round_2(total),
            "categories": categories,
            "previousMonthTotal": round_2(previous_total),
            "changePercent": change_percent,
        }));
    }
    Ok(out)
}

fn expenses_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let start = get_optional_date(ctx.params, "startDate")?;
    let end = get_optional_date(ctx.params, "endDate")?;
    let mut sql = format!(
        "SELECT {} FROM expenses e JOIN expense_categories c ON c.id = e.category_id
         WHERE e.org_id = ?",
        EXPENSE_COLUMNS
    );
    let mut binds: Vec<String> = vec![ctx.org_id.to_string()];
    if let Some(s) = start.as_ref() {
        sql.push_str(" AND e.expense_date >= ?");
        binds.push(s.clone());
    }
    if let Some(e) = end.as_ref() {
        sql.push_str(" AND e.expense_date <= ?");
        binds.push(e.clone());
    }
    sql.push_str(" ORDER BY e.expense_date DESC, e.created_at DESC");
    let mut stmt = ctx.conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), expense_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let summaries = monthly_summaries(ctx.conn, ctx.org_id, &rows, start.as_deref(), end.as_deref())?;
    let expenses: Vec<Value> = rows.into_iter().map(|r| r.json).collect();
    Ok(json!({ "expenses": expenses, "monthlySummaries": summaries }))
}

fn parse_amount(params: &Value, required: bool) -> Result<Option<f64>, HandlerErr> {
    let amount = if required {
        Some(get_required_f64(params, "amount")?)
    } else {
        get_optional_f64(params, "amount")?
    };
    if let Some(a) = amount {
        if a <= 0.0 {
            return Err(HandlerErr::bad_params("amount must be positive"));
        }
    }
    Ok(amount)
}

fn parse_recurring_type(params: &Value) -> Result<Option<String>, HandlerErr> {
    let t = get_optional_str(params, "recurringType")?;
    if let Some(s) = t.as_deref() {
        if !RECURRING_TYPES.contains(&s) {
            return Err(HandlerErr::bad_params("recurringType must be one of: weekly, monthly"));
        }
    }
    Ok(t)
}

fn expenses_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let category = get_required_str(ctx.params, "category")?;
    let amount = parse_amount(ctx.params, true)?.unwrap_or_default();
    let description = get_required_str(ctx.params, "description")?;
    let expense_date = get_required_date(ctx.params, "expenseDate")?;
    let is_recurring = get_optional_bool(ctx.params, "isRecurring")?.unwrap_or(false);
    let recurring_type = parse_recurring_type(ctx.params)?;
    if is_recurring && recurring_type.is_none() {
        return Err(HandlerErr::bad_params("recurringType is required for recurring expenses"));
    }

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let category_id = resolve_expense_category(&tx, ctx.org_id, &category)?;
    let id = new_id();
    tx.execute(
        "INSERT INTO expenses(id, org_id, category_id, amount, expense_date, description, notes,
                              is_recurring, recurring_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            ctx.org_id,
            category_id,
            amount,
            expense_date,
            description,
            get_optional_str(ctx.params, "notes")?,
            i64::from(is_recurring),
            if is_recurring { recurring_type } else { None },
            now_stored(),
        ],
    )
    .map_err(insert_err("expenses"))?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "expense": load_expense(ctx, &id)? }))
}

fn expenses_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_expense(ctx, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let mut patch = Patch::default();
    if has_key(ctx.params, "category") {
        let name = get_required_str(ctx.params, "category")?;
        patch.set("category_id", resolve_expense_category(&tx, ctx.org_id, &name)?);
    }
    if let Some(amount) = parse_amount(ctx.params, false)? {
        patch.set("amount", amount);
    }
    if has_key(ctx.params, "expenseDate") {
        patch.set("expense_date", get_required_date(ctx.params, "expenseDate")?);
    }
    patch.required_text(ctx.params, "description", "description")?;
    patch.text(ctx.params, "notes", "notes")?;
    match get_optional_bool(ctx.params, "isRecurring")? {
        Some(false) => {
            patch.set("is_recurring", 0i64);
            patch.set("recurring_type", Option::<String>::None);
        }
        Some(true) => {
            let t = parse_recurring_type(ctx.params)?.ok_or_else(|| {
                HandlerErr::bad_params("recurringType is required for recurring expenses")
            })?;
            patch.set("is_recurring", 1i64);
            patch.set("recurring_type", t);
        }
        None => {
            if has_key(ctx.params, "recurringType") {
                patch.set("recurring_type", parse_recurring_type(ctx.params)?);
            }
        }
    }
    patch.execute(
        &tx,
        "expenses",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "expense": load_expense(ctx, &id)? }))
}

fn expenses_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let n = ctx
        .conn
        .execute("DELETE FROM expenses WHERE id = ? AND org_id = ?", (&id, ctx.org_id))
        .map_err(delete_err("expenses"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("expense"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let (kind, op) = match req.method.as_str() {
        "expenses.list" => return Some(run_org(state, req, expenses_list)),
        "expenses.create" => return Some(run_org(state, req, expenses_create)),
        "expenses.update" => return Some(run_org(state, req, expenses_update)),
        "expenses.delete" => return Some(run_org(state, req, expenses_delete)),
        m => {
            let (prefix, op) = m.split_once('.')?;
            let kind = match prefix {
                "expenseCategories" => &EXPENSE_CATEGORIES,
                "revenueCategories" => &REVENUE_CATEGORIES,
                _ => return None,
            };
            (kind, op)
        }
    };
    let resp = match op {
        "list" => run_org(state, req, |ctx| kind.list(ctx)),
        "create" => run_org(state, req, |ctx| kind.create(ctx)),
        "update" => run_org(state, req, |ctx| kind.update(ctx)),
        "delete" => run_org(state, req, |ctx| kind.delete(ctx)),
        "reorder" => run_org(state, req, |ctx| kind.reorder(ctx)),
        _ => return None,
    };
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_are_hex_triplets() {
        assert!(valid_color("#3b82f6"));
        assert!(valid_color("#ABCDEF"));
        assert!(!valid_color("3b82f6"));
        assert!(!valid_color("#3b82f"));
        assert!(!valid_color("#3b82fg"));
    }

    #[test]
    fn previous_month_wraps_the_year() {
        assert_eq!(
            previous_window("2024-01", None, None),
            Some(("2023-12-01".to_string(), "2023-12-31".to_string()))
        );
        assert_eq!(
            previous_window("2024-03", None, None),
            Some(("2024-02-01".to_string(), "2024-02-29".to_string()))
        );
        assert_eq!(previous_window("garbage", None, None), None);
    }

    #[test]
    fn previous_window_follows_a_partial_month() {
        assert_eq!(
            previous_window("2026-03", Some("2026-03-08"), Some("2026-03-31")),
            Some(("2026-02-08".to_string(), "2026-02-28".to_string()))
        );
        assert_eq!(
            previous_window("2026-03", Some("2026-03-30"), None),
            Some(("2026-02-28".to_string(), "2026-02-28".to_string()))
        );
        // Bounds in other months leave this month whole.
        assert_eq!(
            previous_window("2026-03", Some("2026-01-15"), Some("2026-04-02")),
            Some(("2026-02-01".to_string(), "2026-02-28".to_string()))
        );
    }
}
