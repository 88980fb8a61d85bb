//! Configurable predicates applied to search results.
//!
//! Predicates are plain closures so that callers can inject arbitrary logic. For configuration
//! via CLI/environment, [`FilterSpec`] parses a small textual syntax: `[!]FIELD~REGEX`.

use crate::ticket::{Ticket, User};

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid filter specification `{0}', expected [!]FIELD~REGEX")]
    Syntax(String),
    #[error("Invalid regular expression in filter `{spec}'")]
    Regex {
        spec: String,
        #[source]
        e: regex::Error,
    },
    #[error("Cannot filter {kind} on unknown field `{field}'")]
    Field { kind: &'static str, field: String },
}

lazy_static! {
    static ref FILTERSPEC: Regex = Regex::new(r"^(!)?([a-z_0-9]+)~(.*)$").unwrap();
}

const TICKET_FIELDS: &[&str] = &[
    "summary",
    "description",
    "number",
    "hierarchy_type",
    "assigned_to_id",
];
const USER_FIELDS: &[&str] = &["id", "name", "login"];

/// Parsed `[!]FIELD~REGEX` expression
#[derive(Debug, Clone)]
pub struct FilterSpec {
    negate: bool,
    field: String,
    re: Regex,
}

impl FilterSpec {
    fn matches(&self, value: Option<String>) -> bool {
        value.map_or(false, |v| self.re.is_match(&v)) != self.negate
    }

    fn check_field(&self, kind: &'static str, known: &[&str]) -> Result<(), Error> {
        if known.contains(&self.field.as_str()) {
            Ok(())
        } else {
            Err(Error::Field {
                kind,
                field: self.field.clone(),
            })
        }
    }

    pub fn ticket_predicate(self) -> Result<Predicate<Ticket>, Error> {
        self.check_field("tickets", TICKET_FIELDS)?;
        Ok(Box::new(move |t: &Ticket| self.matches(t.field(&self.field))))
    }

    pub fn user_predicate(self) -> Result<Predicate<User>, Error> {
        self.check_field("users", USER_FIELDS)?;
        Ok(Box::new(move |u: &User| self.matches(u.field(&self.field))))
    }
}

impl FromStr for FilterSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cap = FILTERSPEC
            .captures(s.trim())
            .ok_or_else(|| Error::Syntax(s.to_owned()))?;
        let re = Regex::new(&cap[3]).map_err(|e| Error::Regex {
            spec: s.to_owned(),
            e,
        })?;
        Ok(Self {
            negate: cap.get(1).is_some(),
            field: cap[2].to_owned(),
            re,
        })
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let neg = if self.negate { "!" } else { "" };
        write!(f, "{}{}~{}", neg, self.field, self.re.as_str())
    }
}

/// Optional predicates threaded through ticket and user searches
#[derive(Default)]
pub struct Filters {
    /// Applied to every ticket search
    pub ticket: Option<Predicate<Ticket>>,
    /// Applied additionally when searching for parent tickets
    pub parent_ticket: Option<Predicate<Ticket>>,
    pub user: Option<Predicate<User>>,
}

impl Filters {
    /// Builds filters from parsed configuration specs
    pub fn from_specs(
        ticket: Option<FilterSpec>,
        parent_ticket: Option<FilterSpec>,
        user: Option<FilterSpec>,
    ) -> Result<Self, Error> {
        Ok(Self {
            ticket: ticket.map(FilterSpec::ticket_predicate).transpose()?,
            parent_ticket: parent_ticket.map(FilterSpec::ticket_predicate).transpose()?,
            user: user.map(FilterSpec::user_predicate).transpose()?,
        })
    }
}

impl fmt::Debug for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filters")
            .field("ticket", &self.ticket.is_some())
            .field("parent_ticket", &self.parent_ticket.is_some())
            .field("user", &self.user.is_some())
            .finish()
    }
}
