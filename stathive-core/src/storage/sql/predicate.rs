//! `WHERE` clause builder shared by the relational backends
//!
//! Produces numbered `$n` placeholders, which both Postgres and SQLite accept,
//! and keeps the bound values in placeholder order.

use chrono::{DateTime, Utc};
use sqlx::any::{Any, AnyArguments};
use sqlx::query::Query;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Int(i64),
    Text(String),
}

/// Conjunction of conditions over one table alias
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    alias: &'static str,
    clauses: Vec<String>,
    params: Vec<Param>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Qualify window and instance columns with `alias.`
    pub fn on(alias: &'static str) -> Self {
        Self {
            alias,
            ..Self::default()
        }
    }

    fn column(&self, name: &str) -> String {
        if self.alias.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.alias, name)
        }
    }

    fn push(&mut self, param: Param) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    /// Closed window overlaps the closed range `[from, to]`
    pub fn overlapping(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let to_ph = self.push(Param::Int(to.timestamp_millis()));
        let from_ph = self.push(Param::Int(from.timestamp_millis()));
        let clause = format!(
            "{} <= {to_ph} AND {} >= {from_ph}",
            self.column("window_start"),
            self.column("window_end")
        );
        self.clauses.push(clause);
        self
    }

    /// Window ended strictly before `cutoff`
    pub fn ended_before(mut self, cutoff: DateTime<Utc>) -> Self {
        let ph = self.push(Param::Int(cutoff.timestamp_millis()));
        let clause = format!("{} < {ph}", self.column("window_end"));
        self.clauses.push(clause);
        self
    }

    /// Exact instance tag, no condition for `None`
    pub fn instance(self, tag: Option<&str>) -> Self {
        match tag {
            Some(tag) => {
                let column = self.column("instance");
                self.equals(&column, tag)
            }
            None => self,
        }
    }

    /// `column = value` for an already qualified column
    pub fn equals(mut self, column: &str, value: &str) -> Self {
        let ph = self.push(Param::Text(value.to_string()));
        self.clauses.push(format!("{column} = {ph}"));
        self
    }

    /// The clause including the `WHERE` keyword, empty without conditions
    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Bind every value in placeholder order
    pub fn bind<'q>(&self, mut query: Query<'q, Any, AnyArguments<'q>>) -> Query<'q, Any, AnyArguments<'q>> {
        for param in &self.params {
            query = match param {
                Param::Int(v) => query.bind(*v),
                Param::Text(v) => query.bind(v.clone()),
            };
        }
        query
    }
}
