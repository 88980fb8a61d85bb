//! Assembla records as exchanged with the REST API.
//!
//! These are plain serde structs. Unknown fields in API responses are ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// `hierarchy_type` value Assembla uses for sub-tasks
pub const SUBTASK_HIERARCHY: u32 = 1;

/// Project workspace
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub name: String,
}

/// Work item inside a space.
///
/// `id` is stable across the whole installation while `number` is the sequence number shown to
/// users. Some endpoints key on the former, some on the latter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ticket {
    pub id: u64,
    pub number: u64,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub space_id: String,
    #[serde(default)]
    pub hierarchy_type: Option<u32>,
    #[serde(default)]
    pub assigned_to_id: Option<String>,
}

impl Ticket {
    /// String value of a named field, used by configurable filters
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "summary" => Some(self.summary.clone()),
            "description" => Some(self.description.clone().unwrap_or_default()),
            "number" => Some(self.number.to_string()),
            "hierarchy_type" => Some(
                self.hierarchy_type
                    .map(|h| h.to_string())
                    .unwrap_or_default(),
            ),
            "assigned_to_id" => Some(self.assigned_to_id.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(#{}) {}", self.number, self.summary)
    }
}

/// Space member
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub login: String,
}

impl User {
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            "login" => Some(self.login.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.login)
    }
}

/// Kind of link between two tickets. Assembla knows more kinds than the named ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Relationship(pub u32);

impl Relationship {
    pub const PARENT_CHILD: Self = Self(1);
    pub const STORY_SUBTASK: Self = Self(6);
}

impl Default for Relationship {
    fn default() -> Self {
        Self::PARENT_CHILD
    }
}

impl FromStr for Relationship {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directed edge between two existing tickets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub ticket1_id: u64,
    pub ticket2_id: u64,
    pub relationship: Relationship,
}

/// Comment as returned after creation. Assembla sends a lot more; we keep what we show.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Caller-supplied fields for ticket creation, usually straight from a submitted form
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewTicket {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub parent_issue_id: Option<String>,
    #[serde(default)]
    pub relationship: Option<Relationship>,
}

/// Treats unset form fields (empty or blank strings) as absent
pub(crate) fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl NewTicket {
    pub fn assignee(&self) -> Option<&str> {
        present(&self.assignee)
    }

    pub fn parent(&self) -> Option<&str> {
        present(&self.parent_issue_id)
    }
}

// === Tests ===
