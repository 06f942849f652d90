use std::time::UNIX_EPOCH;

use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use ulid::Ulid;

use crate::model::*;

/// Session credential slots settable with `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Jwt,
    ApiSecret,
    ApiToken,
}

impl Credential {
    pub fn key(self) -> &'static str {
        match self {
            Credential::Jwt => "reservd.jwt",
            Credential::ApiSecret => "reservd.api_secret",
            Credential::ApiToken => "reservd.api_token",
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetCredential {
        credential: Credential,
        value: String,
    },
    /// Any other `SET`; acknowledged and ignored so drivers can tune their session.
    SetOther {
        name: String,
    },
    InsertReservation(NewReservation),
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
        page: PageRequest,
    },
    InsertSource {
        customer_id: Option<Ulid>,
        name: String,
        max_possible_duration: String,
    },
    UpdateSource {
        id: Ulid,
        patch: SourcePatch,
    },
    DeleteSource {
        id: Ulid,
    },
    SelectSource {
        id: Ulid,
    },
    SelectSources {
        filter: SourceFilter,
        page: PageRequest,
    },
    InsertCustomer {
        name: String,
        company: String,
        email: String,
    },
    UpdateCustomer {
        id: Ulid,
        patch: CustomerPatch,
    },
    DeleteCustomer {
        id: Ulid,
    },
    SelectCustomer {
        id: Ulid,
    },
    SelectCustomers {
        filter: CustomerFilter,
        page: PageRequest,
    },
    IssueSecret {
        customer_id: Option<Ulid>,
    },
    IssueToken {
        source_id: Ulid,
        customer_id: Option<Ulid>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
}

const RESERVATION_COLUMNS: &[&str] = &["from", "to", "reserver_id", "reservee_id", "source_id"];
const SOURCE_COLUMNS: &[&str] = &["name", "max_possible_duration", "customer_id"];
const CUSTOMER_COLUMNS: &[&str] = &["name", "company", "email"];
const SECRET_COLUMNS: &[&str] = &["customer_id"];
const TOKEN_COLUMNS: &[&str] = &["source_id", "customer_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if let Some(cmd) = parse_set(trimmed)? {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Split a simple-query string into statements on `;` tokens. Empty
/// statements are dropped. Input the tokenizer rejects is passed through
/// whole so the parser can report it.
pub fn split_statements(query: &str) -> Vec<&str> {
    let dialect = PostgreSqlDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, query).tokenize_with_location() else {
        return if query.trim().is_empty() {
            Vec::new()
        } else {
            vec![query]
        };
    };
    let mut semicolons = tokens
        .iter()
        .filter(|t| t.token == Token::SemiColon)
        .map(|t| t.span.start)
        .peekable();

    let mut out = Vec::new();
    let mut start = 0;
    let (mut line, mut column) = (1, 1);
    for (i, c) in query.char_indices() {
        if semicolons
            .next_if(|at| at.line == line && at.column == column)
            .is_some()
        {
            out.push(&query[start..i]);
            start = i + 1;
        }
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    out.push(&query[start..]);
    out.retain(|s| !s.trim().is_empty());
    out
}

/// `SET name = 'value'` / `SET name TO 'value'`. Parsed by hand: only the
/// credential names matter and their values are opaque strings.
fn parse_set(sql: &str) -> Result<Option<Command>, SqlError> {
    let Some(head) = sql.get(..4) else {
        return Ok(None);
    };
    if !head.eq_ignore_ascii_case("SET ") {
        return Ok(None);
    }
    let rest = sql[4..].trim_start();
    let name_end = rest
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(rest.len());
    let name = rest[..name_end].to_lowercase();
    let mut value = rest[name_end..].trim_start();
    if let Some(v) = value.strip_prefix('=') {
        value = v.trim_start();
    } else if value.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("TO ")) {
        value = value[3..].trim_start();
    }

    let credential = match name.as_str() {
        "jwt" => Credential::Jwt,
        "api_secret" => Credential::ApiSecret,
        "api_token" => Credential::ApiToken,
        _ => return Ok(Some(Command::SetOther { name })),
    };
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .ok_or_else(|| SqlError::Parse(format!("SET {name} expects a quoted string")))?
        .replace("''", "'");
    Ok(Some(Command::SetCredential { credential, value }))
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "reservations" => {
            let f = insert_fields(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation(NewReservation {
                from: f.timestamp("from")?,
                to: f.timestamp("to")?,
                reserver_id: f.string("reserver_id")?,
                reservee_id: f.string("reservee_id")?,
                source_id: f.ulid("source_id")?,
            }))
        }
        "sources" => {
            let f = insert_fields(insert, "sources", SOURCE_COLUMNS)?;
            Ok(Command::InsertSource {
                customer_id: f.opt_ulid("customer_id")?,
                name: f.string("name")?,
                max_possible_duration: f.string("max_possible_duration")?,
            })
        }
        "customers" => {
            let f = insert_fields(insert, "customers", CUSTOMER_COLUMNS)?;
            Ok(Command::InsertCustomer {
                name: f.string("name")?,
                company: f.opt_string("company")?.unwrap_or_default(),
                email: f.string("email")?,
            })
        }
        "secrets" => {
            let f = insert_fields(insert, "secrets", SECRET_COLUMNS)?;
            Ok(Command::IssueSecret {
                customer_id: f.opt_ulid("customer_id")?,
            })
        }
        "tokens" => {
            let f = insert_fields(insert, "tokens", TOKEN_COLUMNS)?;
            Ok(Command::IssueToken {
                source_id: f.ulid("source_id")?,
                customer_id: f.opt_ulid("customer_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column → value pairs of a single-row INSERT or an UPDATE's SET list.
/// NULL values are dropped, so they read as "not given".
struct Fields {
    values: Vec<(String, Expr)>,
}

impl Fields {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn opt_string(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_expr).transpose()
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        self.opt_string(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid_expr).transpose()
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn opt_timestamp(&self, column: &'static str) -> Result<Option<Ms>, SqlError> {
        self.get(column).map(parse_timestamp_expr).transpose()
    }

    fn timestamp(&self, column: &'static str) -> Result<Ms, SqlError> {
        self.opt_timestamp(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn opt_i64(&self, column: &'static str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64_expr).transpose()
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Named columns are matched by name; without a column list the values are
/// taken positionally in `columns` order.
fn insert_fields(
    insert: &ast::Insert,
    table: &'static str,
    columns: &[&str],
) -> Result<Fields, SqlError> {
    let row = extract_insert_values(insert)?;
    let names: Vec<String> = if insert.columns.is_empty() {
        if row.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
        columns[..row.len()].iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|i| i.value.to_lowercase()).collect()
    };
    if names.len() != row.len() {
        return Err(SqlError::WrongArity(table, names.len(), row.len()));
    }

    let mut values = Vec::with_capacity(row.len());
    for (name, expr) in names.into_iter().zip(row) {
        if !columns.contains(&name.as_str()) {
            return Err(SqlError::UnknownColumn { table, column: name });
        }
        if !is_null(&expr) {
            values.push((name, expr));
        }
    }
    Ok(Fields { values })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    match name.as_str() {
        "reservations" => {
            let f = assignment_fields(assignments, "reservations", &["from", "to"])?;
            Ok(Command::UpdateReservation {
                id,
                patch: ReservationPatch {
                    from: f.opt_timestamp("from")?,
                    to: f.opt_timestamp("to")?,
                },
            })
        }
        "sources" => {
            let f = assignment_fields(assignments, "sources", &["name", "max_possible_duration"])?;
            Ok(Command::UpdateSource {
                id,
                patch: SourcePatch {
                    name: f.opt_string("name")?,
                    max_possible_duration: f.opt_string("max_possible_duration")?,
                },
            })
        }
        "customers" => {
            let f = assignment_fields(
                assignments,
                "customers",
                &["name", "company", "email", "max_source_limit"],
            )?;
            Ok(Command::UpdateCustomer {
                id,
                patch: CustomerPatch {
                    name: f.opt_string("name")?,
                    company: f.opt_string("company")?,
                    email: f.opt_string("email")?,
                    max_source_limit: f.opt_i64("max_source_limit")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(name)),
    }
}

fn assignment_fields(
    assignments: &[Assignment],
    table: &'static str,
    columns: &[&str],
) -> Result<Fields, SqlError> {
    let mut values = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        if !columns.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn { table, column });
        }
        if !is_null(&assignment.value) {
            values.push((column, assignment.value.clone()));
        }
    }
    Ok(Fields { values })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id }),
        "sources" => Ok(Command::DeleteSource { id }),
        "customers" => Ok(Command::DeleteCustomer { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// WHERE clause of a listing: `col = value` terms joined by AND, `id IN (...)`,
/// and the `page` / `size` pseudo-columns.
#[derive(Default)]
struct Conditions {
    ids: Vec<Ulid>,
    id_by_eq: bool,
    columns: Vec<(String, Expr)>,
    page: Option<u32>,
    size: Option<u32>,
}

impl Conditions {
    fn page_request(&self) -> PageRequest {
        let default = PageRequest::default();
        PageRequest {
            page: self.page.unwrap_or(default.page),
            size: self.size.unwrap_or(default.size),
        }
    }

    /// `WHERE id = '...'` and nothing else reads one record.
    fn single_id(&self) -> Option<Ulid> {
        let plain = self.id_by_eq
            && self.ids.len() == 1
            && self.columns.is_empty()
            && self.page.is_none()
            && self.size.is_none();
        plain.then(|| self.ids[0])
    }

    fn check_columns(&self, table: &'static str, allowed: &[&str]) -> Result<(), SqlError> {
        match self.columns.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((column, _)) => Err(SqlError::UnknownColumn {
                table,
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }

    fn fields(self) -> Fields {
        Fields {
            values: self.columns,
        }
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut cond = Conditions::default();
    if let Some(selection) = &select.selection {
        collect_conditions(selection, &mut cond)?;
    }
    let page = cond.page_request();

    match table.as_str() {
        "reservations" => {
            if let Some(id) = cond.single_id() {
                return Ok(Command::SelectReservation { id });
            }
            cond.check_columns("reservations", &["reserver_id", "reservee_id", "source_id"])?;
            let ids = std::mem::take(&mut cond.ids);
            let f = cond.fields();
            Ok(Command::SelectReservations {
                filter: ReservationFilter {
                    ids,
                    reserver_id: f.opt_string("reserver_id")?,
                    reservee_id: f.opt_string("reservee_id")?,
                    source_id: f.opt_ulid("source_id")?,
                    customer_id: None,
                },
                page,
            })
        }
        "sources" => {
            if let Some(id) = cond.single_id() {
                return Ok(Command::SelectSource { id });
            }
            cond.check_columns("sources", &["name", "customer_id"])?;
            let ids = std::mem::take(&mut cond.ids);
            let f = cond.fields();
            Ok(Command::SelectSources {
                filter: SourceFilter {
                    ids,
                    name: f.opt_string("name")?,
                    customer_id: f.opt_ulid("customer_id")?,
                },
                page,
            })
        }
        "customers" => {
            if let Some(id) = cond.single_id() {
                return Ok(Command::SelectCustomer { id });
            }
            cond.check_columns("customers", &["name"])?;
            let ids = std::mem::take(&mut cond.ids);
            let f = cond.fields();
            Ok(Command::SelectCustomers {
                filter: CustomerFilter {
                    ids,
                    name: f.opt_string("name")?,
                },
                page,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn collect_conditions(expr: &Expr, out: &mut Conditions) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conditions(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_conditions(left, out)?;
            collect_conditions(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("comparison on {left}")))?;
            match column.as_str() {
                "id" => {
                    out.ids.push(parse_ulid_expr(right)?);
                    out.id_by_eq = true;
                }
                "page" => out.page = Some(parse_u32(right)?),
                "size" => out.size = Some(parse_u32(right)?),
                _ => out.columns.push((column, right.as_ref().clone())),
            }
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } if expr_column_name(expr).as_deref() == Some("id") => {
            for item in list {
                out.ids.push(parse_ulid_expr(item)?);
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

/// First VALUES row; an INSERT with no source (`DEFAULT VALUES`) is an empty row.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let Some(body) = insert.source.as_ref() else {
        return Ok(Vec::new());
    };
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::EscapedStringLiteral(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let raw = parse_string_expr(expr)?;
    Ulid::from_string(&raw).map_err(|e| SqlError::Parse(format!("bad ULID {raw:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// Integer milliseconds, or an RFC 3339 UTC string.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        let at = humantime::parse_rfc3339_weak(s)
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))?;
        let since_epoch = at
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SqlError::Parse(format!("timestamp {s:?} before 1970")))?;
        return Ms::try_from(since_epoch.as_millis())
            .map_err(|_| SqlError::Parse(format!("timestamp {s:?} out of range")));
    }
    parse_i64_expr(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_reservation_named() {
        let sql = format!(
            r#"INSERT INTO reservations ("from", "to", reserver_id, reservee_id, source_id) VALUES (1000, 2000, 'alice', 'bob', '{ID}')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation(NewReservation {
                from: 1000,
                to: 2000,
                reserver_id: "alice".into(),
                reservee_id: "bob".into(),
                source_id: id(),
            })
        );
    }

    #[test]
    fn parse_insert_reservation_reordered_and_rfc3339() {
        let sql = format!(
            r#"INSERT INTO reservations (source_id, reservee_id, reserver_id, "to", "from") VALUES ('{ID}', 'bob', 'alice', '2024-01-01T11:00:00Z', '2024-01-01T10:00:00Z')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation(r) => {
                assert_eq!(r.from, 1_704_103_200_000);
                assert_eq!(r.to, 1_704_106_800_000);
                assert_eq!(r.reserver_id, "alice");
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_positional() {
        let sql = format!("INSERT INTO reservations VALUES (1000, 2000, 'alice', 'bob', '{ID}')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertReservation(_)));
    }

    #[test]
    fn insert_reservation_missing_column() {
        let sql = format!(r#"INSERT INTO reservations ("from", "to", reserver_id, source_id) VALUES (1, 2, 'a', '{ID}')"#);
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("reservee_id"))
        ));
    }

    #[test]
    fn insert_unknown_column() {
        let sql = "INSERT INTO customers (name, email, shoe_size) VALUES ('a', 'a@b', 42)";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::UnknownColumn { table: "customers", .. })
        ));
    }

    #[test]
    fn insert_arity_mismatch() {
        let sql = "INSERT INTO customers (name, email) VALUES ('a')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity(..))));
    }

    #[test]
    fn parse_insert_source() {
        let sql = "INSERT INTO sources (name, max_possible_duration) VALUES ('Room 1', '2h')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertSource {
                customer_id: None,
                name: "Room 1".into(),
                max_possible_duration: "2h".into(),
            }
        );
    }

    #[test]
    fn parse_insert_customer_without_company() {
        let sql = "INSERT INTO customers (name, email) VALUES ('Acme', 'ops@acme.test')";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertCustomer {
                name: "Acme".into(),
                company: String::new(),
                email: "ops@acme.test".into(),
            }
        );
    }

    #[test]
    fn parse_credential_inserts() {
        let sql = format!("INSERT INTO secrets (customer_id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::IssueSecret {
                customer_id: Some(id())
            }
        );
        assert_eq!(
            parse_sql("INSERT INTO secrets DEFAULT VALUES").unwrap(),
            Command::IssueSecret { customer_id: None }
        );
        let sql = format!("INSERT INTO tokens (source_id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::IssueToken {
                source_id: id(),
                customer_id: None
            }
        );
    }

    #[test]
    fn parse_update_reservation() {
        let sql = format!(r#"UPDATE reservations SET "to" = 5000 WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateReservation {
                id: id(),
                patch: ReservationPatch {
                    from: None,
                    to: Some(5000)
                },
            }
        );
    }

    #[test]
    fn parse_update_customer_with_null() {
        let sql = format!(
            "UPDATE customers SET name = NULL, max_source_limit = 3 WHERE id = '{ID}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateCustomer {
                id: id(),
                patch: CustomerPatch {
                    max_source_limit: Some(3),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn update_requires_id() {
        let sql = "UPDATE sources SET name = 'x'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
        let sql = format!("UPDATE sources SET customer_id = '{ID}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn { .. })));
    }

    #[test]
    fn parse_deletes() {
        for (table, expect) in [
            ("reservations", Command::DeleteReservation { id: id() }),
            ("sources", Command::DeleteSource { id: id() }),
            ("customers", Command::DeleteCustomer { id: id() }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            assert_eq!(parse_sql(&sql).unwrap(), expect);
        }
        assert!(matches!(
            parse_sql("DELETE FROM reservations"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql(&format!("DELETE FROM holds WHERE id = '{ID}'")),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn select_single_by_id() {
        let sql = format!("SELECT * FROM reservations WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservation { id: id() }
        );
    }

    #[test]
    fn select_list_with_filters_and_paging() {
        let sql = format!(
            "SELECT * FROM reservations WHERE id IN ('{ID}', '{OTHER}') AND reserver_id = 'alice' AND source_id = '{ID}' AND page = 2 AND size = 50"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectReservations { filter, page } => {
                assert_eq!(filter.ids.len(), 2);
                assert_eq!(filter.reserver_id.as_deref(), Some("alice"));
                assert_eq!(filter.reservee_id, None);
                assert_eq!(filter.source_id, Some(id()));
                assert_eq!(page, PageRequest { page: 2, size: 50 });
            }
            other => panic!("expected SelectReservations, got {other:?}"),
        }
    }

    #[test]
    fn select_list_defaults() {
        match parse_sql("SELECT * FROM customers").unwrap() {
            Command::SelectCustomers { filter, page } => {
                assert_eq!(filter, CustomerFilter::default());
                assert_eq!(page, PageRequest::default());
            }
            other => panic!("expected SelectCustomers, got {other:?}"),
        }
    }

    #[test]
    fn select_id_with_paging_is_a_listing() {
        let sql = format!("SELECT * FROM sources WHERE id = '{ID}' AND page = 1");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectSources { .. }
        ));
    }

    #[test]
    fn select_rejects_unknown_filters() {
        assert!(matches!(
            parse_sql("SELECT * FROM customers WHERE email = 'x'"),
            Err(SqlError::UnknownColumn { .. })
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM reservations WHERE \"from\" > 5"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM reservations WHERE page = -1"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_set_credentials() {
        assert_eq!(
            parse_sql("SET jwt = 'a.b.c'").unwrap(),
            Command::SetCredential {
                credential: Credential::Jwt,
                value: "a.b.c".into()
            }
        );
        assert_eq!(
            parse_sql("set API_SECRET to 'it''s';").unwrap(),
            Command::SetCredential {
                credential: Credential::ApiSecret,
                value: "it's".into()
            }
        );
        assert_eq!(
            parse_sql("SET extra_float_digits = 3").unwrap(),
            Command::SetOther {
                name: "extra_float_digits".into()
            }
        );
        assert!(matches!(parse_sql("SET api_token = abc"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn split_respects_quotes() {
        assert_eq!(
            split_statements("SET jwt = 'a;b'; SET api_token = 'x';;"),
            vec!["SET jwt = 'a;b'", " SET api_token = 'x'"]
        );
        assert_eq!(
            split_statements(r#"SELECT * FROM sources WHERE name = 'it''s; here'"#).len(),
            1
        );
        assert!(split_statements("  ").is_empty());
    }

    #[test]
    fn split_across_lines_and_comments() {
        assert_eq!(
            split_statements("SET jwt = 'x';\n-- not; here\nSELECT * FROM sources;"),
            vec!["SET jwt = 'x'", "\n-- not; here\nSELECT * FROM sources"]
        );
        // Unterminated quote: handed over whole for the parser to reject.
        assert_eq!(split_statements("SET jwt = 'x; y"), vec!["SET jwt = 'x; y"]);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_sql("   "), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEKT"), Err(SqlError::Parse(_))));
        assert!(matches!(
            parse_sql("DROP TABLE reservations"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO reservations VALUES (1, 2, 'a', 'b', 'not-a-ulid')")),
            Err(SqlError::Parse(_))
        ));
    }
}
