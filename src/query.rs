//! JSON term evaluation for the database and table terms.
//!
//! A term is a JSON array `["name", [args...], {optargs}]`. Any argument that
//! is itself an array headed by a known term name is evaluated as a nested
//! term; everything else is a literal datum.

use std::collections::BTreeMap;
use std::fmt;

use futures::TryStreamExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::blueprint::PlanError;
use crate::ddl::{self, DbHandle, Durability, QueryEnv, Rows, TableCreateOptions, TableHandle};
use crate::metrics;
use crate::storage::{RowStream, StorageError};

/// Errors that can occur when evaluating a term.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    /// User-facing failure; the message is returned verbatim.
    #[error("{0}")]
    Generic(String),
    /// The table's shards cannot be placed on the live machines.
    #[error("{0}")]
    Plan(#[from] PlanError),
    #[error("Query interrupted, probably by user.")]
    Interrupted,
    /// A metadata invariant did not hold.
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0}")]
    Arity(String),
    #[error("{0}")]
    Type(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
}

impl QueryError {
    /// Outcome label recorded in the term counter.
    pub fn outcome(&self) -> &'static str {
        match self {
            QueryError::Interrupted => "interrupted",
            QueryError::Internal(_) | QueryError::Storage(_) => "internal",
            _ => "user_error",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Datum(Value),
    Term(Term),
}

impl Arg {
    fn from_json(value: &Value) -> Result<Self, QueryError> {
        let nested = value
            .as_array()
            .and_then(|items| items.first())
            .and_then(Value::as_str)
            .is_some_and(|name| arg_spec(name).is_some());
        if nested {
            Term::from_value(value).map(Arg::Term)
        } else {
            Ok(Arg::Datum(value.clone()))
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Datum(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Datum(Value::String(value.to_string()))
    }
}

impl From<Term> for Arg {
    fn from(term: Term) -> Self {
        Arg::Term(term)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Term {
    pub name: String,
    pub args: Vec<Arg>,
    pub optargs: BTreeMap<String, Arg>,
}

fn shape_error(value: &Value) -> QueryError {
    QueryError::Type(format!(
        "Expected a term of the form [name, [args...], {{optargs}}] but found {value}."
    ))
}

impl Term {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            optargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn optarg(mut self, key: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.optargs.insert(key.into(), arg.into());
        self
    }

    /// Parse a term from its JSON text.
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, QueryError> {
        let items = value.as_array().ok_or_else(|| shape_error(value))?;
        let name = match items.first() {
            Some(Value::String(name)) if items.len() <= 3 => name.clone(),
            _ => return Err(shape_error(value)),
        };
        let args = match items.get(1) {
            None => Vec::new(),
            Some(Value::Array(args)) => args.iter().map(Arg::from_json).collect::<Result<_, _>>()?,
            Some(_) => return Err(shape_error(value)),
        };
        let optargs = match items.get(2) {
            None => BTreeMap::new(),
            Some(Value::Object(optargs)) => optargs
                .iter()
                .map(|(key, arg)| Ok((key.clone(), Arg::from_json(arg)?)))
                .collect::<Result<_, QueryError>>()?,
            Some(_) => return Err(shape_error(value)),
        };
        Ok(Self {
            name,
            args,
            optargs,
        })
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match arg {
                Arg::Datum(v) => write!(f, "{v}")?,
                Arg::Term(t) => write!(f, "{t}")?,
            }
        }
        for (key, arg) in &self.optargs {
            match arg {
                Arg::Datum(v) => write!(f, ", {key}={v}")?,
                Arg::Term(t) => write!(f, ", {key}={t}")?,
            }
        }
        write!(f, ")")
    }
}

/// Accepted positional argument counts and optional argument names of a term.
#[derive(Clone, Copy, Debug)]
struct ArgSpec {
    min: usize,
    max: Option<usize>,
    optargs: &'static [&'static str],
}

impl ArgSpec {
    const fn exactly(n: usize, optargs: &'static [&'static str]) -> Self {
        Self {
            min: n,
            max: Some(n),
            optargs,
        }
    }

    const fn between(min: usize, max: usize, optargs: &'static [&'static str]) -> Self {
        Self {
            min,
            max: Some(max),
            optargs,
        }
    }

    const fn at_least(min: usize, optargs: &'static [&'static str]) -> Self {
        Self {
            min,
            max: None,
            optargs,
        }
    }

    fn check(&self, term: &Term) -> Result<(), QueryError> {
        let found = term.args.len();
        let fits = found >= self.min && self.max.is_none_or(|max| found <= max);
        if !fits {
            let expected = match self.max {
                Some(max) if max == self.min => {
                    let noun = if max == 1 { "argument" } else { "arguments" };
                    format!("{max} {noun}")
                }
                Some(max) => format!("between {} and {max} arguments", self.min),
                None => format!("{} or more arguments", self.min),
            };
            return Err(QueryError::Arity(format!(
                "Expected {expected} but found {found}."
            )));
        }
        if let Some(key) = term.optargs.keys().find(|k| !self.optargs.contains(&k.as_str())) {
            return Err(QueryError::Generic(format!(
                "Unrecognized optional argument `{key}`."
            )));
        }
        Ok(())
    }
}

fn arg_spec(name: &str) -> Option<ArgSpec> {
    let spec = match name {
        "db" | "db_create" | "db_drop" | "sync" => ArgSpec::exactly(1, &[]),
        "db_list" => ArgSpec::exactly(0, &[]),
        "table_create" => {
            ArgSpec::between(1, 2, &["db", "datacenter", "primary_key", "durability"])
        }
        "table_drop" => ArgSpec::between(1, 2, &["db"]),
        "table_list" => ArgSpec::between(0, 1, &["db"]),
        "table" => ArgSpec::between(1, 2, &["db", "use_outdated"]),
        "get" => ArgSpec::exactly(2, &[]),
        "get_all" => ArgSpec::at_least(2, &["index"]),
        _ => return None,
    };
    Some(spec)
}

/// An evaluated argument.
pub enum Val {
    Datum(Value),
    Db(DbHandle),
    Table(TableHandle),
    Stream(RowStream),
}

impl Val {
    fn type_name(&self) -> &'static str {
        match self {
            Val::Datum(Value::Null) => "NULL",
            Val::Datum(Value::Bool(_)) => "BOOL",
            Val::Datum(Value::Number(_)) => "NUMBER",
            Val::Datum(Value::String(_)) => "STRING",
            Val::Datum(Value::Array(_)) => "ARRAY",
            Val::Datum(Value::Object(_)) => "OBJECT",
            Val::Db(_) => "DATABASE",
            Val::Table(_) => "TABLE",
            Val::Stream(_) => "STREAM",
        }
    }

    fn type_error(&self, expected: &str) -> QueryError {
        QueryError::Type(format!(
            "Expected type {expected} but found {}.",
            self.type_name()
        ))
    }

    pub fn into_datum(self) -> Result<Value, QueryError> {
        match self {
            Val::Datum(v) => Ok(v),
            other => Err(other.type_error("DATUM")),
        }
    }

    pub fn into_string(self) -> Result<String, QueryError> {
        match self {
            Val::Datum(Value::String(s)) => Ok(s),
            other => Err(other.type_error("STRING")),
        }
    }

    pub fn into_bool(self) -> Result<bool, QueryError> {
        match self {
            Val::Datum(Value::Bool(b)) => Ok(b),
            other => Err(other.type_error("BOOL")),
        }
    }
}

/// Result of a top-level term.
pub enum QueryOutput {
    Datum(Value),
    /// Rows produced lazily, e.g. by a secondary-index `get_all`.
    Stream(RowStream),
}

impl QueryOutput {
    /// Drain the output into a single JSON value; streams become arrays.
    pub async fn collect(self) -> Result<Value, QueryError> {
        match self {
            QueryOutput::Datum(v) => Ok(v),
            QueryOutput::Stream(rows) => Ok(Value::Array(rows.try_collect().await?)),
        }
    }
}

impl From<Val> for QueryOutput {
    fn from(val: Val) -> Self {
        match val {
            Val::Datum(v) => QueryOutput::Datum(v),
            Val::Db(db) => QueryOutput::Datum(json!({
                "type": "DB",
                "id": db.id,
                "name": db.name,
            })),
            Val::Table(table) => QueryOutput::Datum(json!({
                "type": "TABLE",
                "id": table.id,
                "db": table.db.name,
                "name": table.name,
                "primary_key": table.primary_key,
            })),
            Val::Stream(rows) => QueryOutput::Stream(rows),
        }
    }
}

/// Evaluate a top-level term on behalf of `env`'s node.
#[tracing::instrument(skip(env, term), fields(term = %term.name))]
pub async fn run(env: &QueryEnv, term: &Term) -> Result<QueryOutput, QueryError> {
    let result = eval_term(env, term).await;
    let label = if arg_spec(&term.name).is_some() {
        term.name.as_str()
    } else {
        "unknown"
    };
    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.outcome(),
    };
    metrics::TERMS_TOTAL.with_label_values(&[label, outcome]).inc();
    match &result {
        Err(QueryError::Internal(msg)) => tracing::error!(%term, error = %msg, "term failed"),
        Err(err) => tracing::debug!(%term, error = %err, "term failed"),
        Ok(_) => {}
    }
    result.map(QueryOutput::from)
}

fn eval<'a>(env: &'a QueryEnv, arg: &'a Arg) -> BoxFuture<'a, Result<Val, QueryError>> {
    Box::pin(async move {
        match arg {
            Arg::Datum(v) => Ok(Val::Datum(v.clone())),
            Arg::Term(term) => eval_term(env, term).await,
        }
    })
}

async fn eval_string(env: &QueryEnv, arg: &Arg) -> Result<String, QueryError> {
    eval(env, arg).await?.into_string()
}

/// A database argument: a `db` term or a database name.
async fn eval_db(env: &QueryEnv, arg: &Arg) -> Result<DbHandle, QueryError> {
    match eval(env, arg).await? {
        Val::Db(db) => Ok(db),
        Val::Datum(Value::String(name)) => ddl::db(env, &name),
        other => Err(other.type_error("DATABASE")),
    }
}

/// A table argument: a `table` term or a table name in the default database.
async fn eval_table(env: &QueryEnv, arg: &Arg) -> Result<TableHandle, QueryError> {
    match eval(env, arg).await? {
        Val::Table(table) => Ok(table),
        Val::Datum(Value::String(name)) => {
            let db = ddl::db(env, env.default_db())?;
            ddl::table(env, &db, &name, false)
        }
        other => Err(other.type_error("TABLE")),
    }
}

async fn opt_string(env: &QueryEnv, term: &Term, key: &str) -> Result<Option<String>, QueryError> {
    match term.optargs.get(key) {
        Some(arg) => eval_string(env, arg).await.map(Some),
        None => Ok(None),
    }
}

/// The `db` optarg, or the session's default database.
async fn scope_db(env: &QueryEnv, term: &Term) -> Result<DbHandle, QueryError> {
    match term.optargs.get("db") {
        Some(arg) => eval_db(env, arg).await,
        None => ddl::db(env, env.default_db()),
    }
}

/// Split `[db,] name` arguments.
async fn scoped_name(env: &QueryEnv, term: &Term) -> Result<(DbHandle, String), QueryError> {
    match term.args.as_slice() {
        [db, name] => Ok((eval_db(env, db).await?, eval_string(env, name).await?)),
        [name] => Ok((scope_db(env, term).await?, eval_string(env, name).await?)),
        _ => Err(QueryError::Internal(format!(
            "`{}` evaluated with {} arguments",
            term.name,
            term.args.len()
        ))),
    }
}

async fn eval_term(env: &QueryEnv, term: &Term) -> Result<Val, QueryError> {
    let spec = arg_spec(&term.name)
        .ok_or_else(|| QueryError::Generic(format!("Unknown term `{}`.", term.name)))?;
    spec.check(term)?;
    let args = &term.args;

    match term.name.as_str() {
        "db" => {
            let name = eval_string(env, &args[0]).await?;
            Ok(Val::Db(ddl::db(env, &name)?))
        }
        "db_create" => {
            let name = eval_string(env, &args[0]).await?;
            ddl::db_create(env, &name).await.map(Val::Datum)
        }
        "db_drop" => {
            let name = eval_string(env, &args[0]).await?;
            ddl::db_drop(env, &name).await.map(Val::Datum)
        }
        "db_list" => Ok(Val::Datum(json!(ddl::db_list(env)))),
        "table_create" => {
            // Optargs are checked before the database and table name.
            let datacenter = opt_string(env, term, "datacenter").await?;
            if let Some(dc) = &datacenter {
                ddl::datacenter(env, dc)?;
            }
            let durability = match opt_string(env, term, "durability").await? {
                Some(raw) => Durability::parse(&raw)?,
                None => Durability::Hard,
            };
            let primary_key = opt_string(env, term, "primary_key").await?;
            let (db, name) = scoped_name(env, term).await?;
            let options = TableCreateOptions {
                datacenter,
                primary_key,
                durability,
            };
            ddl::table_create(env, &db, &name, options)
                .await
                .map(Val::Datum)
        }
        "table_drop" => {
            let (db, name) = scoped_name(env, term).await?;
            ddl::table_drop(env, &db, &name).await.map(Val::Datum)
        }
        "table_list" => {
            let db = match args.first() {
                Some(db) => eval_db(env, db).await?,
                None => scope_db(env, term).await?,
            };
            Ok(Val::Datum(json!(ddl::table_list(env, &db))))
        }
        "table" => {
            let (db, name) = scoped_name(env, term).await?;
            let use_outdated = match term.optargs.get("use_outdated") {
                Some(arg) => eval(env, arg).await?.into_bool()?,
                None => false,
            };
            Ok(Val::Table(ddl::table(env, &db, &name, use_outdated)?))
        }
        "get" => {
            let table = eval_table(env, &args[0]).await?;
            let key = eval(env, &args[1]).await?.into_datum()?;
            ddl::get(env, &table, &key).await.map(Val::Datum)
        }
        "get_all" => {
            let table = eval_table(env, &args[0]).await?;
            let mut keys = Vec::with_capacity(args.len() - 1);
            for arg in &args[1..] {
                keys.push(eval(env, arg).await?.into_datum()?);
            }
            let index = opt_string(env, term, "index").await?;
            match ddl::get_all(env, &table, keys, index).await? {
                Rows::Lazy(rows) => Ok(Val::Stream(rows)),
                Rows::Eager(rows) => Ok(Val::Datum(Value::Array(rows))),
            }
        }
        "sync" => {
            let table = eval_table(env, &args[0]).await?;
            ddl::sync(env, &table).await.map(Val::Datum)
        }
        other => Err(QueryError::Internal(format!("no evaluator for `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_terms_and_literals() {
        let term = Term::parse(
            r#"["get_all", [["table", ["users"], {"db": "prod"}], 1, ["a", []]], {"index": "email"}]"#,
        )
        .unwrap();
        assert_eq!(term.name, "get_all");
        let expected_table = Term::new("table").arg("users").optarg("db", "prod");
        assert_eq!(term.args[0], Arg::Term(expected_table));
        assert_eq!(term.args[1], Arg::Datum(json!(1)));
        // Arrays not headed by a term name stay literal.
        assert_eq!(term.args[2], Arg::Datum(json!(["a", []])));
        assert_eq!(term.optargs["index"], Arg::Datum(json!("email")));
    }

    #[test]
    fn rejects_malformed_terms() {
        for text in [r#"{"db": 1}"#, r#"[1, []]"#, r#"["db", "x"]"#, r#"["db", [], []]"#] {
            let err = Term::parse(text).unwrap_err();
            assert!(matches!(err, QueryError::Type(_)), "{text}: {err}");
        }
        assert!(matches!(Term::parse("[").unwrap_err(), QueryError::Parse(_)));
    }

    #[test]
    fn arity_messages() {
        let check = |term: Term| {
            arg_spec(&term.name)
                .unwrap()
                .check(&term)
                .unwrap_err()
                .to_string()
        };
        assert_eq!(
            check(Term::new("db").arg("a").arg("b")),
            "Expected 1 argument but found 2."
        );
        assert_eq!(
            check(Term::new("db_list").arg("a")),
            "Expected 0 arguments but found 1."
        );
        assert_eq!(
            check(Term::new("table_create").arg("a").arg("b").arg("c")),
            "Expected between 1 and 2 arguments but found 3."
        );
        assert_eq!(
            check(Term::new("get_all").arg("t")),
            "Expected 2 or more arguments but found 1."
        );
        assert_eq!(
            check(Term::new("table_drop").arg("t").optarg("durability", "soft")),
            "Unrecognized optional argument `durability`."
        );
        assert!(
            arg_spec("get_all")
                .unwrap()
                .check(&Term::new("get_all").arg("t").arg(json!(1)).arg(json!(2)).optarg("index", "x"))
                .is_ok()
        );
    }

    #[test]
    fn display_renders_call_syntax() {
        let term = Term::new("table_create")
            .arg(Term::new("db").arg("prod"))
            .arg("users")
            .optarg("durability", "soft");
        assert_eq!(
            term.to_string(),
            r#"table_create(db("prod"), "users", durability="soft")"#
        );
    }

    #[test]
    fn interruption_message() {
        assert_eq!(
            QueryError::Interrupted.to_string(),
            "Query interrupted, probably by user."
        );
        assert_eq!(QueryError::Interrupted.outcome(), "interrupted");
        assert_eq!(QueryError::Generic("x".into()).outcome(), "user_error");
    }
}
