use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::{AuthError, ServerPassword};
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::{STATEMENT_DURATION_SECONDS, STATEMENTS_TOTAL, command_label};
use crate::service::{Outcome, Service, ServiceError, Session};
use crate::sql;

pub struct ReservdHandler {
    service: Arc<Service>,
    query_parser: Arc<ReservdQueryParser>,
}

impl ReservdHandler {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            query_parser: Arc::new(ReservdQueryParser),
        }
    }

    /// Parse, execute against the connection's session credentials, and
    /// encode. `summary` appends the page summary to listings.
    async fn run<C>(&self, client: &mut C, query: &str, summary: bool) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Send,
    {
        let cmd = sql::parse_sql(query).map_err(|e| service_err(e.into()))?;
        let label = command_label(&cmd);
        debug!(command = label, "executing");
        let start = Instant::now();

        let mut session = Session::from_metadata(client.metadata());
        let result = self.service.execute(&mut session, cmd).await;
        session.write_metadata(client.metadata_mut());

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(STATEMENTS_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(STATEMENT_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        debug!(command = label, status, "finished");

        encode(result.map_err(service_err)?, summary)
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut responses = Vec::new();
        for statement in sql::split_statements(query) {
            responses.extend(self.run(client, statement, true).await?);
        }
        if responses.is_empty() {
            responses.push(Response::EmptyQuery);
        }
        Ok(responses)
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

/// A record type that encodes as one data row.
trait Row {
    fn schema() -> Vec<FieldInfo>;
    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()>;
}

impl Row for Reservation {
    fn schema() -> Vec<FieldInfo> {
        vec![
            text_field("id"),
            int_field("from"),
            int_field("to"),
            text_field("reserver_id"),
            text_field("reservee_id"),
            text_field("source_id"),
            int_field("created_at"),
            int_field("updated_at"),
        ]
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        encoder.encode_field(&self.id.to_string())?;
        encoder.encode_field(&self.from)?;
        encoder.encode_field(&self.to)?;
        encoder.encode_field(&self.reserver_id)?;
        encoder.encode_field(&self.reservee_id)?;
        encoder.encode_field(&self.source_id.to_string())?;
        encoder.encode_field(&self.created_at)?;
        encoder.encode_field(&self.updated_at)
    }
}

impl Row for Source {
    fn schema() -> Vec<FieldInfo> {
        vec![
            text_field("id"),
            text_field("name"),
            text_field("max_possible_duration"),
            text_field("customer_id"),
            int_field("created_at"),
            int_field("updated_at"),
        ]
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        encoder.encode_field(&self.id.to_string())?;
        encoder.encode_field(&self.name)?;
        encoder.encode_field(&self.max_possible_duration)?;
        encoder.encode_field(&self.customer_id.to_string())?;
        encoder.encode_field(&self.created_at)?;
        encoder.encode_field(&self.updated_at)
    }
}

impl Row for Customer {
    fn schema() -> Vec<FieldInfo> {
        vec![
            text_field("id"),
            text_field("name"),
            text_field("company"),
            text_field("email"),
            int_field("max_source_limit"),
            int_field("created_at"),
            int_field("updated_at"),
        ]
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        encoder.encode_field(&self.id.to_string())?;
        encoder.encode_field(&self.name)?;
        encoder.encode_field(&self.company)?;
        encoder.encode_field(&self.email)?;
        encoder.encode_field(&i64::from(self.max_source_limit))?;
        encoder.encode_field(&self.created_at)?;
        encoder.encode_field(&self.updated_at)
    }
}

impl Row for Secret {
    fn schema() -> Vec<FieldInfo> {
        vec![
            text_field("id"),
            text_field("customer_id"),
            text_field("secret"),
            int_field("created_at"),
        ]
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        encoder.encode_field(&self.id.to_string())?;
        encoder.encode_field(&self.customer_id.to_string())?;
        encoder.encode_field(&self.value)?;
        encoder.encode_field(&self.created_at)
    }
}

impl Row for ApiToken {
    fn schema() -> Vec<FieldInfo> {
        vec![
            text_field("id"),
            text_field("customer_id"),
            text_field("source_id"),
            text_field("token"),
            int_field("valid_until"),
            int_field("created_at"),
        ]
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        encoder.encode_field(&self.id.to_string())?;
        encoder.encode_field(&self.customer_id.to_string())?;
        encoder.encode_field(&self.source_id.to_string())?;
        encoder.encode_field(&self.value)?;
        encoder.encode_field(&self.valid_until)?;
        encoder.encode_field(&self.created_at)
    }
}

fn id_schema() -> Vec<FieldInfo> {
    vec![text_field("id")]
}

fn page_schema() -> Vec<FieldInfo> {
    vec![
        int_field("page"),
        int_field("size"),
        int_field("total"),
        int_field("count"),
    ]
}

fn rows<T: Row>(items: &[T]) -> Response {
    let schema = Arc::new(T::schema());
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            item.encode(&mut encoder)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn id_row(id: Ulid) -> Response {
    let schema = Arc::new(id_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&id.to_string()).map(|_| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn summary_row<T>(page: &Page<T>, size: u32) -> Response {
    let schema = Arc::new(page_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = (|| -> PgWireResult<_> {
        encoder.encode_field(&i64::from(page.page))?;
        encoder.encode_field(&i64::from(size))?;
        encoder.encode_field(&(page.total as i64))?;
        encoder.encode_field(&(page.count as i64))?;
        Ok(encoder.take_row())
    })();
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn listing<T: Row>(page: Page<T>, size: u32, summary: bool) -> Vec<Response> {
    let mut out = vec![rows(&page.content)];
    if summary {
        out.push(summary_row(&page, size));
    }
    out
}

fn encode(outcome: Outcome, summary: bool) -> PgWireResult<Vec<Response>> {
    Ok(match outcome {
        Outcome::Set => vec![Response::Execution(Tag::new("SET"))],
        Outcome::Inserted(id) | Outcome::Updated(id) | Outcome::Deleted(id) => vec![id_row(id)],
        Outcome::Secret(secret) => vec![rows(&[secret])],
        Outcome::Token(token) => vec![rows(&[token])],
        Outcome::Reservation(r) => vec![rows(&[r])],
        Outcome::Source(s) => vec![rows(&[s])],
        Outcome::Customer(c) => vec![rows(&[c])],
        Outcome::Reservations { page, size } => listing(page, size, summary),
        Outcome::Sources { page, size } => listing(page, size, summary),
        Outcome::Customers { page, size } => listing(page, size, summary),
    })
}

/// Result columns for a statement, judged from its verb and table so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let tokens: Vec<String> = sql
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| c == ';' || c == '(' || c == '"')
                .to_lowercase()
        })
        .collect();
    let after = |keyword: &str| {
        tokens
            .iter()
            .position(|t| t == keyword)
            .and_then(|i| tokens.get(i + 1))
            .map(String::as_str)
    };
    match tokens.first().map(String::as_str) {
        Some("select") => match after("from") {
            Some("reservations") => Reservation::schema(),
            Some("sources") => Source::schema(),
            Some("customers") => Customer::schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("secrets") => Secret::schema(),
            Some("tokens") => ApiToken::schema(),
            Some(_) => id_schema(),
            None => vec![],
        },
        Some("update") | Some("delete") => id_schema(),
        _ => vec![],
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservdQueryParser;

#[async_trait]
impl QueryParser for ReservdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservdHandler {
    type Statement = String;
    type QueryParser = ReservdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let responses = self.run(client, &sql, false).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced from the highest index down so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservdFactory {
    handler: Arc<ReservdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ServerPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReservdFactory {
    pub fn new(service: Arc<Service>, password: String) -> Self {
        let auth_source = ServerPassword::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservdHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<Service>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = ReservdFactory::new(service, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &ServiceError) -> &'static str {
    match e {
        ServiceError::Sql(_) => "42601",
        ServiceError::Auth(AuthError::Signing(_)) => "XX000",
        ServiceError::Auth(_) => "28000",
        ServiceError::Engine(e) => match e {
            EngineError::InvalidInput(_) => "22023",
            EngineError::InvalidInterval { .. } => "22007",
            EngineError::NotFound(..) => "P0002",
            EngineError::PolicyMalformed(_) => "22008",
            EngineError::PolicyViolation { .. } => "23514",
            EngineError::OverlapConflict(_) => "23P01",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Store(_) => "58030",
        },
    }
}

fn service_err(e: ServiceError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}
