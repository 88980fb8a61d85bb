//! Host-facing side: configuration and issue forms, create/link actions, autocompletion.
//!
//! Every method resolves a ticket client for the acting identity first. Without a linked
//! identity nothing touches the network.

use crate::cache::UserCache;
use crate::client::{self, Assembla, SearchKind};
use crate::filter::Filters;
use crate::form::{Choice, Field, FieldType};
use crate::ticket::{present, NewTicket, Relationship, Space, Ticket};
use crate::tracker::{self, Transport};

use colored::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub const TICKETS_URL: &str = "https://app.assembla.com/spaces";

const ERR_AUTH_NOT_CONFIGURED: &str =
    "You still need to associate an Assembla identity with this account.";

const HELP_NO_SPACE_ACCESS: &str = "\
This plugin has been configured for an Assembla space that either you don't have access to or \
doesn't exist. You can edit the configuration, but you will not be able to change it back to the \
current configuration unless a teammate grants you access to the space in Assembla.";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}", ERR_AUTH_NOT_CONFIGURED)]
    IdentityRequired,
    #[error("Invalid space value")]
    InvalidSpace,
    #[error("No Assembla space configured for this project")]
    NotConfigured,
    #[error("No Assembla ticket selected")]
    NoTicketSelected,
    /// User-facing error reported by Assembla
    #[error("{0}")]
    Plugin(String),
    /// The ticket was created but linking it to its parent failed
    #[error("{message}")]
    Unlinked { id: u64, number: u64, message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Extracts a readable message from an Assembla error document
pub fn error_message_from_json(data: &Value) -> String {
    if let Some(e) = data.get("error").and_then(Value::as_str) {
        return e.to_owned();
    }
    let base: Vec<&str> = data
        .pointer("/errors/base")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if base.is_empty() {
        "unknown error".to_owned()
    } else {
        base.join(" ")
    }
}

fn transport_message(e: &tracker::Error) -> String {
    match e {
        tracker::Error::Status { status, body } => match serde_json::from_str::<Value>(body) {
            Ok(v) => error_message_from_json(&v),
            Err(_) => format!("Assembla returned {}", status),
        },
        e => format!("Error communicating with Assembla: {}", e),
    }
}

impl From<client::Error> for Error {
    fn from(e: client::Error) -> Self {
        let msg = match &e {
            client::Error::Transport(t) => transport_message(t),
            client::Error::Association { ticket, source } => {
                let message = format!(
                    "Ticket #{} was created but could not be linked to its parent: {}",
                    ticket.number,
                    transport_message(source)
                );
                warn!("{} (ticket id {})", message, ticket.id);
                return Error::Unlinked {
                    id: ticket.id,
                    number: ticket.number,
                    message,
                };
            }
            client::Error::Api { .. } => e.to_string(),
        };
        warn!("{}", msg);
        Error::Plugin(msg)
    }
}

/// Per-project plugin settings as stored by the host
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub space: Option<String>,
    /// Ticket number preselected as parent for new tickets
    #[serde(default)]
    pub parent_issue_number: Option<String>,
    #[serde(default)]
    pub relationship: Option<Relationship>,
}

/// Reference to a linked ticket as expected by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueRef {
    pub title: String,
    pub label: String,
    pub url: String,
}

/// Form fields that support autocompletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Autocomplete {
    IssueId,
    ParentIssueId,
    Assignee,
}

impl Autocomplete {
    pub fn from_field(name: &str) -> Option<Self> {
        match name {
            "issue_id" => Some(Autocomplete::IssueId),
            "parent_issue_id" => Some(Autocomplete::ParentIssueId),
            "assignee" => Some(Autocomplete::Assignee),
            _ => None,
        }
    }
}

pub fn issue_label(ticket: &Ticket) -> String {
    format!("Assembla ticket (#{})", ticket.number)
}

pub fn issue_url(space: &str, number: u64) -> String {
    format!("{}/{}/tickets/{}", TICKETS_URL, space, number)
}

pub fn space_choices(spaces: &[Space]) -> Vec<(String, String)> {
    spaces
        .iter()
        .map(|s| (s.id.clone(), s.name.clone()))
        .collect()
}

pub fn has_space_access(space: &str, choices: &[(String, String)]) -> bool {
    choices.iter().any(|(id, _)| id == space)
}

pub fn relationship_choices() -> Vec<(String, String)> {
    vec![
        (Relationship::PARENT_CHILD.to_string(), "Parent - Child".into()),
        (Relationship::STORY_SUBTASK.to_string(), "Story - Subtask".into()),
    ]
}

/// Checks submitted configuration before the host stores it
pub fn validate_config(mut options: Options) -> Result<Options> {
    let space = present(&options.space)
        .map(str::to_owned)
        .ok_or(Error::InvalidSpace)?;
    options.space = Some(space);
    options.parent_issue_number = present(&options.parent_issue_number).map(str::to_owned);
    Ok(options)
}

pub struct Plugin<T> {
    pub options: Options,
    /// Authenticated transport of the acting user, `None` if no identity is linked
    auth: Option<T>,
    users: Arc<UserCache>,
    filters: Filters,
}

impl<T: Transport> Plugin<T> {
    pub fn new(options: Options, auth: Option<T>, users: Arc<UserCache>, filters: Filters) -> Self {
        Self {
            options,
            auth,
            users,
            filters,
        }
    }

    pub fn client(&self) -> Result<Assembla<&T>> {
        match &self.auth {
            Some(t) => Ok(Assembla::with_cache(t, self.users.clone())),
            None => Err(Error::IdentityRequired),
        }
    }

    pub fn is_configured(&self) -> bool {
        present(&self.options.space).is_some()
    }

    fn space(&self) -> Result<&str> {
        present(&self.options.space).ok_or(Error::NotConfigured)
    }

    /// Choices for the space select; an inaccessible configured space is appended so that the
    /// current value stays selectable. The flag tells whether that happened.
    fn space_select(&self, spaces: &[Space]) -> (Vec<(String, String)>, bool) {
        let mut choices = space_choices(spaces);
        match present(&self.options.space) {
            Some(space) if !has_space_access(space, &choices) => {
                choices.push((space.to_owned(), space.to_owned()));
                (choices, true)
            }
            _ => (choices, false),
        }
    }

    /// Plugin configuration screen
    pub fn config_fields(&self) -> Result<Vec<Field>> {
        let client = self.client()?;
        let spaces = client.spaces()?;
        let (choices, inaccessible) = self.space_select(&spaces);
        let default = present(&self.options.space)
            .map(str::to_owned)
            .or_else(|| spaces.first().map(|s| s.id.clone()));
        Ok(vec![
            Field::new("space", "Space", FieldType::Select)
                .choices(choices)
                .default(default)
                .help(if inaccessible {
                    Some(HELP_NO_SPACE_ACCESS)
                } else {
                    None
                }),
            Field::new(
                "parent_issue_number",
                "Parent ticket (enter a ticket number)",
                FieldType::Number,
            )
            .required(false)
            .placeholder("(Optional) Enter a parent ticket number which will be selected by default"),
            Field::new("relationship", "Default relationship", FieldType::Select)
                .choices(relationship_choices())
                .required(false)
                .placeholder(
                    "(Optional) Set the default relationship between the new ticket and parent",
                ),
        ])
    }

    /// Form for creating a new ticket from an issue
    pub fn new_issue_fields(&self, title: &str, description: &str) -> Result<Vec<Field>> {
        let client = self.client()?;
        let space = self.space()?;
        let spaces = client.spaces()?;
        let (choices, _) = self.space_select(&spaces);
        let parent = match present(&self.options.parent_issue_number) {
            Some(n) => client.ticket_by_number(space, n)?,
            None => None,
        };
        let relationship = self
            .options
            .relationship
            .unwrap_or(Relationship::STORY_SUBTASK);
        let mut parent_field = Field::new("parent_issue_id", "Parent ticket", FieldType::Select)
            .required(false)
            .placeholder("Start typing to search for a ticket in this space");
        parent_field = match parent {
            Some(p) => parent_field
                .default(Some(p.id.to_string()))
                .choices(vec![(p.id.to_string(), p.to_string())])
                .autocomplete(false)
                .readonly(true),
            None => parent_field.autocomplete(true).readonly(false),
        };
        Ok(vec![
            Field::new("space", "Assembla Space", FieldType::Select)
                .default(Some(space))
                .choices(choices)
                .readonly(true),
            Field::new("title", "Summary", FieldType::Text)
                .default(Some(title))
                .required(true),
            Field::new("description", "Description", FieldType::Textarea)
                .default(Some(description))
                .required(false),
            Field::new("relationship", "Relationship", FieldType::Select)
                .default(Some(relationship.to_string()))
                .choices(relationship_choices())
                .required(false)
                .placeholder("Select the type of relationship"),
            parent_field,
            Field::new("assignee", "Assign to", FieldType::Select)
                .autocomplete(true)
                .required(false)
                .placeholder("Start typing to search for a user"),
        ])
    }

    /// Form for linking an existing ticket
    pub fn link_issue_fields(&self, group_url: &str) -> Vec<Field> {
        vec![
            Field::new("issue_id", "Ticket", FieldType::Select)
                .default(Some(""))
                .autocomplete(true),
            Field::new("comment", "Comment", FieldType::Textarea)
                .default(Some(group_url))
                .help(Some(
                    "Leave blank if you don't want to add a comment to the Assembla issue.",
                ))
                .required(false),
        ]
    }

    /// Creates a ticket from a submitted form and returns its id
    pub fn create_issue(&self, form: &NewTicket) -> Result<u64> {
        let client = self.client()?;
        let space = self.space()?;
        let ticket = client.create_ticket(space, form)?;
        Ok(ticket.id)
    }

    /// Links an existing ticket, optionally leaving a comment on it
    pub fn link_issue(&self, issue_id: &str, comment: Option<&str>) -> Result<IssueRef> {
        let client = self.client()?;
        let space = self.space()?;
        let ticket = client
            .ticket(space, issue_id)?
            .ok_or(Error::NoTicketSelected)?;
        if let Some(text) = comment.map(str::trim).filter(|c| !c.is_empty()) {
            client.create_comment(space, &ticket, text)?;
            info!("{}: commented on {}", space.yellow(), ticket.to_string().green());
        }
        Ok(IssueRef {
            title: ticket.summary.clone(),
            label: issue_label(&ticket),
            url: issue_url(space, ticket.number),
        })
    }

    /// Suggestions for an autocomplete field, keyed by the field name
    pub fn autocomplete(&self, field: &str, query: &str) -> Result<BTreeMap<String, Vec<Choice>>> {
        let client = self.client()?;
        let space = self.space()?;
        let results = match Autocomplete::from_field(field) {
            Some(kind @ Autocomplete::IssueId) | Some(kind @ Autocomplete::ParentIssueId) => {
                let search = if kind == Autocomplete::ParentIssueId {
                    SearchKind::Parent
                } else {
                    SearchKind::Regular
                };
                client
                    .search_tickets(space, query, search, &self.filters)?
                    .into_iter()
                    .map(|t| Choice {
                        text: t.to_string(),
                        id: json!(t.id),
                    })
                    .collect()
            }
            Some(Autocomplete::Assignee) => client
                .search_users(space, query, &self.filters)?
                .into_iter()
                .map(|u| Choice {
                    text: u.to_string(),
                    id: json!(u.id),
                })
                .collect(),
            None => Vec::new(),
        };
        let mut res = BTreeMap::new();
        res.insert(field.to_owned(), results);
        Ok(res)
    }
}
