//! Typed predicates for the store's list endpoint.
//!
//! A [`Query`] is a conjunction of [`Clause`]s. Rendering quotes and escapes
//! every literal, so names containing `'` or `\` cannot change the shape of
//! the query.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::node::Node;

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    NameEquals(String),
    NameContains(String),
    InParents(String),
    MimeTypeEquals(String),
    Trashed(bool),
    ModifiedBefore(DateTime<Utc>),
    /// Operator-supplied query text, passed through as-is.
    Raw(String),
}

impl Clause {
    /// Client-side evaluation. `None` for raw text, which only the store
    /// can interpret.
    pub fn matches(&self, node: &Node) -> Option<bool> {
        let hit = match self {
            Clause::NameEquals(name) => node.name == *name,
            Clause::NameContains(fragment) => node.name.contains(fragment.as_str()),
            Clause::InParents(id) => node.parents.iter().any(|p| p == id),
            Clause::MimeTypeEquals(mime) => node.mime_type == *mime,
            Clause::Trashed(trashed) => node.trashed == *trashed,
            Clause::ModifiedBefore(t) => node.modified_time < *t,
            Clause::Raw(_) => return None,
        };
        Some(hit)
    }

    fn constrains_trashed(&self) -> bool {
        match self {
            Clause::Trashed(_) => true,
            Clause::Raw(text) => text.contains("trashed"),
            _ => false,
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::NameEquals(name) => write!(f, "name = {}", quote(name)),
            Clause::NameContains(fragment) => write!(f, "name contains {}", quote(fragment)),
            Clause::InParents(id) => write!(f, "{} in parents", quote(id)),
            Clause::MimeTypeEquals(mime) => write!(f, "mimeType = {}", quote(mime)),
            Clause::Trashed(trashed) => write!(f, "trashed = {}", trashed),
            Clause::ModifiedBefore(t) => write!(
                f,
                "modifiedTime < {}",
                quote(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
            ),
            Clause::Raw(text) => write!(f, "{}", text),
        }
    }
}

fn quote(literal: &str) -> String {
    format!("'{}'", literal.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn name_equals(self, name: &str) -> Self {
        self.and(Clause::NameEquals(name.to_string()))
    }

    pub fn name_contains(self, fragment: &str) -> Self {
        self.and(Clause::NameContains(fragment.to_string()))
    }

    pub fn in_parents(self, id: &str) -> Self {
        self.and(Clause::InParents(id.to_string()))
    }

    pub fn mime_type(self, mime: &str) -> Self {
        self.and(Clause::MimeTypeEquals(mime.to_string()))
    }

    pub fn trashed(self, trashed: bool) -> Self {
        self.and(Clause::Trashed(trashed))
    }

    pub fn modified_before(self, t: DateTime<Utc>) -> Self {
        self.and(Clause::ModifiedBefore(t))
    }

    pub fn raw(self, text: &str) -> Self {
        self.and(Clause::Raw(text.to_string()))
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Adds `trashed = false` unless the query already says something about
    /// trashed nodes.
    pub fn excluding_trashed(self) -> Self {
        if self.clauses.iter().any(Clause::constrains_trashed) {
            self
        } else {
            self.trashed(false)
        }
    }

    /// Client-side evaluation of the whole conjunction; `None` if any clause
    /// is raw text.
    pub fn matches(&self, node: &Node) -> Option<bool> {
        let mut all = true;
        for clause in &self.clauses {
            all &= clause.matches(node)?;
        }
        Some(all)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grouped = self.clauses.len() > 1;
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            match clause {
                Clause::Raw(text) if grouped => write!(f, "({})", text)?,
                other => write!(f, "{}", other)?,
            }
        }
        Ok(())
    }
}
