/// Typed query builder over a remote resource endpoint.
///
/// Accumulates filter/sort/pagination/join clauses as a flat key=value
/// parameter list (PostgREST-style wire grammar) and executes as
/// fetch/insert/patch/delete or a lazy page stream. The grammar is fixed
/// by the remote service: `field=op.value`, `field=in.(v1,v2)`,
/// `or=(...)` / `and=(...)` groups, `select=*,alias:field(*)` joins,
/// `order=field.asc|desc`, `offset=n`, `limit=n`.
use crate::error::{Result, SyncError};
use crate::remote::http::Remote;
use futures_util::stream::{unfold, Stream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;

/// Backslash-escapes the query-delimiter characters so values can never
/// inject extra clauses.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '&' | ';' | ',' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    Ilike,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Neq => "neq",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Like => "like",
            Op::Ilike => "ilike",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// One filter clause: a field condition or an any/all compound group
#[derive(Debug, Clone)]
pub enum Cond {
    Cmp {
        field: String,
        op: Op,
        value: String,
    },
    In {
        field: String,
        values: Vec<String>,
    },
    Is {
        field: String,
        value: Option<bool>,
    },
    Any(Vec<Cond>),
    All(Vec<Cond>),
}

impl Cond {
    pub fn cmp(field: &str, op: Op, value: impl Into<String>) -> Self {
        Cond::Cmp {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    /// Set membership test (`in`)
    pub fn is_in(field: &str, values: Vec<String>) -> Self {
        Cond::In {
            field: field.to_string(),
            values,
        }
    }

    /// Null/boolean test (`is`); `None` renders as `null`
    pub fn is(field: &str, value: Option<bool>) -> Self {
        Cond::Is {
            field: field.to_string(),
            value,
        }
    }

    /// Compound group: at least one member must be satisfied
    pub fn any(conds: Vec<Cond>) -> Self {
        Cond::Any(conds)
    }

    /// Compound group: all members must be satisfied
    pub fn all(conds: Vec<Cond>) -> Self {
        Cond::All(conds)
    }

    /// Top-level rendering, `field=op.value` / `or=(...)`
    fn render_top(&self) -> String {
        match self {
            Cond::Cmp { field, op, value } => {
                format!("{}={}.{}", field, op.as_str(), escape_value(value))
            }
            Cond::In { field, values } => format!("{}=in.({})", field, Self::render_list(values)),
            Cond::Is { field, value } => format!("{}=is.{}", field, Self::render_bool(*value)),
            Cond::Any(conds) => format!("or=({})", Self::render_group(conds)),
            Cond::All(conds) => format!("and=({})", Self::render_group(conds)),
        }
    }

    /// Rendering inside a compound group, `field.op.value` / `or(...)`
    fn render_nested(&self) -> String {
        match self {
            Cond::Cmp { field, op, value } => {
                format!("{}.{}.{}", field, op.as_str(), escape_value(value))
            }
            Cond::In { field, values } => format!("{}.in.({})", field, Self::render_list(values)),
            Cond::Is { field, value } => format!("{}.is.{}", field, Self::render_bool(*value)),
            Cond::Any(conds) => format!("or({})", Self::render_group(conds)),
            Cond::All(conds) => format!("and({})", Self::render_group(conds)),
        }
    }

    fn render_group(conds: &[Cond]) -> String {
        conds
            .iter()
            .map(Cond::render_nested)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn render_list(values: &[String]) -> String {
        values
            .iter()
            .map(|v| escape_value(v))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn render_bool(value: Option<bool>) -> &'static str {
        match value {
            Some(true) => "true",
            Some(false) => "false",
            None => "null",
        }
    }
}

pub struct Query<T> {
    url: String,
    remote: Remote,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            remote: self.remote.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Query<T> {
    pub(crate) fn new(remote: Remote, resource_url: &str) -> Self {
        Self {
            url: format!("{}?", resource_url),
            remote,
            _marker: PhantomData,
        }
    }

    /// Adds one filter clause; all clauses must be satisfied
    pub fn filter(mut self, cond: Cond) -> Self {
        self.url.push_str(&cond.render_top());
        self.url.push('&');
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.url.push_str(&format!("offset={}&", n));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.url.push_str(&format!("limit={}&", n));
        self
    }

    /// Applies a limit only when `apply` holds
    pub fn limit_if(self, apply: bool, n: usize) -> Self {
        if apply {
            self.limit(n)
        } else {
            self
        }
    }

    pub fn order(mut self, field: &str, order: Order) -> Self {
        self.url.push_str(&format!("order={}.{}&", field, order.as_str()));
        self
    }

    /// Projects the full related record reached through `field` under
    /// `alias`. At most one join per query.
    pub fn join<U>(self, field: &str, alias: &str) -> Query<U> {
        let mut url = self.url;
        url.push_str(&format!("select=*,{}:{}(*)&", alias, escape_value(field)));
        Query {
            url,
            remote: self.remote,
            _marker: PhantomData,
        }
    }

    /// The accumulated request URL
    pub fn as_url(&self) -> &str {
        &self.url
    }
}

impl<T: DeserializeOwned> Query<T> {
    pub async fn fetch(&self) -> Result<Vec<T>> {
        let value = self.remote.transport().get(&self.url).await?;
        decode_rows(value, &self.url)
    }

    /// Inserts one row; the endpoint echoes the created record back
    pub async fn insert<B: Serialize>(&self, row: &B) -> Result<T> {
        let body = encode_body(row, &self.url)?;
        let value = self.remote.transport().post(&self.url, body).await?;
        let rows: Vec<T> = decode_rows(value, &self.url)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::Decode(format!("'{}': insert returned no rows", self.url)))
    }

    /// Updates all rows matching the accumulated filters and returns them;
    /// an empty result means no row satisfied the preconditions.
    pub async fn patch<B: Serialize>(&self, row: &B) -> Result<Vec<T>> {
        let body = encode_body(row, &self.url)?;
        let value = self.remote.transport().patch(&self.url, body).await?;
        decode_rows(value, &self.url)
    }

    pub async fn delete(&self) -> Result<Vec<T>> {
        let value = self.remote.transport().delete(&self.url).await?;
        decode_rows(value, &self.url)
    }

    /// Lazy, finite page stream ordered by `key`, starting strictly after
    /// (ascending) or before (descending) `start`. A page shorter than
    /// `page_size` signals exhaustion; restart from any checkpoint by
    /// passing the last seen key value.
    pub fn stream_by_key(
        self,
        key: &str,
        start: impl Into<String>,
        order: Order,
        page_size: usize,
    ) -> impl Stream<Item = Result<Vec<T>>> {
        let base = format!(
            "{}order={}.{}&limit={}&",
            self.url,
            key,
            order.as_str(),
            page_size
        );
        let op = match order {
            Order::Asc => Op::Gt,
            Order::Desc => Op::Lt,
        };
        let remote = self.remote;
        let key = key.to_string();

        unfold(Some(start.into()), move |cursor| {
            let remote = remote.clone();
            let base = base.clone();
            let key = key.clone();
            async move {
                let cursor = cursor?;
                let url = format!("{}{}={}.{}", base, key, op.as_str(), escape_value(&cursor));
                let value = match remote.transport().get(&url).await {
                    Ok(value) => value,
                    Err(e) => return Some((Err(e), None)),
                };
                // Pull the next cursor off the raw page before typed decode
                let next = match &value {
                    Value::Array(rows) if rows.len() >= page_size => rows
                        .last()
                        .and_then(|row| row.get(&key))
                        .map(cursor_value),
                    _ => None,
                };
                match decode_rows::<T>(value, &url) {
                    Ok(rows) => Some((Ok(rows), next)),
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
    }
}

fn cursor_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_body<B: Serialize>(row: &B, url: &str) -> Result<Value> {
    serde_json::to_value(row).map_err(|e| SyncError::Decode(format!("'{}': {}", url, e)))
}

fn decode_rows<T: DeserializeOwned>(value: Value, url: &str) -> Result<Vec<T>> {
    serde_json::from_value(value).map_err(|e| SyncError::Decode(format!("'{}': {}", url, e)))
}
