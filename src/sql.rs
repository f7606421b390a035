use chrono::NaiveDate;
use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

const DATE_FORMAT: &str = "%Y-%m-%d";

const USER_COLUMNS: [&str; 5] = ["id", "name", "email", "address", "country_code"];
const DELIVERY_COLUMNS: [&str; 3] = ["id", "user_id", "timeslot_id"];

/// Which deliveries a reporting query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFilter {
    Date(NaiveDate),
    WeekFrom(NaiveDate),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        address: String,
        country_code: String,
    },
    InsertDelivery {
        id: Ulid,
        user_id: Ulid,
        timeslot_id: Ulid,
    },
    DeleteDelivery {
        id: Ulid,
    },
    CompleteDelivery {
        id: Ulid,
    },
    SelectAvailability {
        user_id: Ulid,
        week_start: NaiveDate,
    },
    SelectDeliveries {
        filter: DeliveryFilter,
    },
    SelectTimeslots {
        date: Option<NaiveDate>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(&table.relation, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column → value pairs of a single-row INSERT. Without a column list the
/// values are taken in `defaults` order.
fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&str],
) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    Ok(columns.into_iter().zip(values.iter().cloned()).collect())
}

fn column<'a>(row: &'a [(String, Expr)], name: &'static str) -> Option<&'a Expr> {
    row.iter().find(|(c, _)| c == name).map(|(_, e)| e)
}

fn required<'a>(row: &'a [(String, Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    column(row, name).ok_or(SqlError::MissingColumn(name))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = insert_row(insert, "users", &USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: optional_id(column(&row, "id"))?,
                name: parse_text(required(&row, "name")?)?,
                email: parse_text(required(&row, "email")?)?,
                address: parse_text(required(&row, "address")?)?,
                country_code: parse_text(required(&row, "country_code")?)?,
            })
        }
        "deliveries" => {
            let row = insert_row(insert, "deliveries", &DELIVERY_COLUMNS)?;
            Ok(Command::InsertDelivery {
                id: optional_id(column(&row, "id"))?,
                user_id: parse_ulid(required(&row, "user_id")?)?,
                timeslot_id: parse_ulid(required(&row, "timeslot_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "deliveries" => Ok(Command::DeleteDelivery { id: extract_where_id(&delete.selection)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "deliveries" {
        return Err(SqlError::UnknownTable(table));
    }
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE deliveries sets only status".into()));
    };
    let target = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };
    if target.as_deref() != Some("status") {
        return Err(SqlError::Unsupported("UPDATE deliveries sets only status".into()));
    }
    let status = parse_text(&assignment.value)?;
    if !status.eq_ignore_ascii_case("completed") {
        return Err(SqlError::Unsupported(format!("status transition to '{status}'")));
    }
    Ok(Command::CompleteDelivery { id: extract_where_id(selection)? })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            user_id: parse_ulid(filter(&filters, "user_id")?)?,
            week_start: parse_date(filter(&filters, "week_start")?)?,
        }),
        "deliveries" => {
            let filter = match (column(&filters, "date"), column(&filters, "week_start")) {
                (Some(date), None) => DeliveryFilter::Date(parse_date(date)?),
                (None, Some(start)) => DeliveryFilter::WeekFrom(parse_date(start)?),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported("filter by date or week_start, not both".into()));
                }
                (None, None) => return Err(SqlError::MissingFilter("date or week_start")),
            };
            Ok(Command::SelectDeliveries { filter })
        }
        "timeslots" => Ok(Command::SelectTimeslots {
            date: column(&filters, "date").map(parse_date).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn filter<'a>(filters: &'a [(String, Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    column(filters, name).ok_or(SqlError::MissingFilter(name))
}

/// Flatten `a = x AND b = y ...` into column/value pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_eq_filters(sel, &mut filters)?;
    match filters.as_slice() {
        [(col, value)] if col == "id" => parse_ulid(value),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

fn optional_id(expr: Option<&Expr>) -> Result<Ulid, SqlError> {
    match expr {
        None => Ok(Ulid::new()),
        Some(e) if matches!(extract_value(e), Some(Value::Null)) => Ok(Ulid::new()),
        Some(e) => parse_ulid(e),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|_| SqlError::Parse(format!("bad date '{s}', expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parse_insert_user_with_columns() {
        let sql = format!(
            "INSERT INTO users (id, name, email, address, country_code) \
             VALUES ('{ID}', 'Dana', 'dana@example.com', 'Dizengoff 50, Tel Aviv', 'IL')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertUser { id, name, email, address, country_code } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(name, "Dana");
                assert_eq!(email, "dana@example.com");
                assert_eq!(address, "Dizengoff 50, Tel Aviv");
                assert_eq!(country_code, "IL");
            }
            cmd => panic!("expected InsertUser, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_user_reordered_columns_without_id() {
        let sql = "INSERT INTO users (country_code, address, email, name) \
                   VALUES ('IL', 'Herzl 1, Haifa', 'a@b.c', 'Avi')";
        match parse_sql(sql).unwrap() {
            Command::InsertUser { name, country_code, address, .. } => {
                assert_eq!(name, "Avi");
                assert_eq!(country_code, "IL");
                assert_eq!(address, "Herzl 1, Haifa");
            }
            cmd => panic!("expected InsertUser, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_user_missing_column() {
        let sql = "INSERT INTO users (name, email) VALUES ('Avi', 'a@b.c')";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("address"))));
    }

    #[test]
    fn parse_insert_delivery_positional() {
        let sql = format!("INSERT INTO deliveries VALUES ('{ID}', '{OTHER}', '{OTHER}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertDelivery {
                id: Ulid::from_string(ID).unwrap(),
                user_id: Ulid::from_string(OTHER).unwrap(),
                timeslot_id: Ulid::from_string(OTHER).unwrap(),
            }
        );
    }

    #[test]
    fn parse_insert_delivery_generates_id() {
        let sql = format!("INSERT INTO deliveries (user_id, timeslot_id) VALUES ('{ID}', '{OTHER}')");
        match parse_sql(&sql).unwrap() {
            Command::InsertDelivery { user_id, timeslot_id, .. } => {
                assert_eq!(user_id.to_string(), ID);
                assert_eq!(timeslot_id.to_string(), OTHER);
            }
            cmd => panic!("expected InsertDelivery, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_wrong_arity() {
        let sql = format!("INSERT INTO deliveries VALUES ('{ID}', '{OTHER}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("deliveries", 3, 2))));
    }

    #[test]
    fn parse_delete_delivery() {
        let sql = format!("DELETE FROM deliveries WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteDelivery { id: Ulid::from_string(ID).unwrap() }
        );
    }

    #[test]
    fn parse_delete_requires_id() {
        assert!(matches!(
            parse_sql("DELETE FROM deliveries"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM users WHERE id = 'x'"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_complete_delivery() {
        let sql = format!("UPDATE deliveries SET status = 'completed' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CompleteDelivery { id: Ulid::from_string(ID).unwrap() }
        );
    }

    #[test]
    fn parse_update_rejects_other_transitions() {
        let sql = format!("UPDATE deliveries SET status = 'scheduled' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = format!("UPDATE deliveries SET user_id = '{OTHER}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE user_id = '{ID}' AND week_start = '2021-07-19'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                user_id: Ulid::from_string(ID).unwrap(),
                week_start: day(2021, 7, 19),
            }
        );
    }

    #[test]
    fn parse_select_availability_missing_week() {
        let sql = format!("SELECT * FROM availability WHERE user_id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("week_start"))));
    }

    #[test]
    fn parse_select_deliveries_daily_and_weekly() {
        assert_eq!(
            parse_sql("SELECT * FROM deliveries WHERE date = '2021-07-20'").unwrap(),
            Command::SelectDeliveries { filter: DeliveryFilter::Date(day(2021, 7, 20)) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM deliveries WHERE week_start = '2021-07-19'").unwrap(),
            Command::SelectDeliveries { filter: DeliveryFilter::WeekFrom(day(2021, 7, 19)) }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM deliveries"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_timeslots() {
        assert_eq!(
            parse_sql("SELECT * FROM timeslots").unwrap(),
            Command::SelectTimeslots { date: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM timeslots WHERE date = '2021-07-19'").unwrap(),
            Command::SelectTimeslots { date: Some(day(2021, 7, 19)) }
        );
    }

    #[test]
    fn parse_bad_date() {
        assert!(matches!(
            parse_sql("SELECT * FROM timeslots WHERE date = '19/07/2021'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_unsupported_filter_operator() {
        assert!(matches!(
            parse_sql("SELECT * FROM timeslots WHERE date > '2021-07-19'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_unknown_table_and_garbage() {
        assert!(matches!(parse_sql("SELECT * FROM couriers"), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("NOT SQL AT ALL"), Err(SqlError::Parse(_))));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
