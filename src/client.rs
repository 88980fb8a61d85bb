//! Ticket operations against the Assembla REST API.

use crate::cache::UserCache;
use crate::filter::Filters;
use crate::ticket::{Association, Comment, NewTicket, Space, Ticket, User, SUBTASK_HIERARCHY};
use crate::tracker::{self, Transport};

use colored::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] tracker::Error),
    #[error("Unexpected Assembla API response: {res}")]
    Api {
        res: String,
        #[source]
        e: serde_json::Error,
    },
    /// The ticket exists but could not be linked to its parent
    #[error("Ticket #{} was created but could not be linked to its parent", .ticket.number)]
    Association {
        ticket: Box<Ticket>,
        #[source]
        source: tracker::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Assembla's fixed page size for ticket listings
pub const PAGE_SIZE: usize = 100;

/// Upper bound on pages fetched by a single ticket search
pub const MAX_PAGES: u32 = 100;

/// Which ticket form field a search is run for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    /// Candidate parent tickets; the parent filter applies too
    Parent,
    Regular,
}

fn decode<T: DeserializeOwned>(v: Value) -> Result<T> {
    T::deserialize(&v).map_err(|e| Error::Api {
        res: v.to_string(),
        e,
    })
}

/// Decodes a listing. Empty responses mean empty lists.
fn decode_list<T: DeserializeOwned>(v: Value) -> Result<Vec<T>> {
    match v {
        Value::Null => Ok(Vec::new()),
        v => decode(v),
    }
}

fn contains_ci(haystack: &str, needle_lc: &str) -> bool {
    haystack.to_lowercase().contains(needle_lc)
}

pub struct Assembla<T> {
    transport: T,
    users: Arc<UserCache>,
}

impl<T: Transport> Assembla<T> {
    /// Client with its own private user cache
    pub fn new(transport: T) -> Self {
        Self::with_cache(transport, Arc::new(UserCache::new()))
    }

    /// Client sharing `users` with other clients of the same process
    pub fn with_cache(transport: T, users: Arc<UserCache>) -> Self {
        Self { transport, users }
    }

    /// All spaces visible to the token owner
    pub fn spaces(&self) -> Result<Vec<Space>> {
        decode_list(self.transport.get("/spaces.json", &[])?)
    }

    /// Looks up a ticket by its stable id. Unset ids (empty strings) yield `None` without a request.
    pub fn ticket(&self, space: &str, id: &str) -> Result<Option<Ticket>> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let v = self
            .transport
            .get(&format!("/spaces/{}/tickets/id/{}", space, id), &[])?;
        decode(v).map(Some)
    }

    /// Looks up a ticket by its per-space number. Same empty-input rule as [`Self::ticket`].
    pub fn ticket_by_number(&self, space: &str, number: &str) -> Result<Option<Ticket>> {
        let number = number.trim();
        if number.is_empty() {
            return Ok(None);
        }
        let v = self
            .transport
            .get(&format!("/spaces/{}/tickets/{}", space, number), &[])?;
        decode(v).map(Some)
    }

    /// Creates a ticket and links it to its parent if one is given.
    ///
    /// If the parent cannot be fetched, the new ticket is returned unlinked. A failing
    /// association request is reported as [`Error::Association`], which still carries the new
    /// ticket: there is no rollback.
    pub fn create_ticket(&self, space: &str, data: &NewTicket) -> Result<Ticket> {
        let mut fields = Map::new();
        fields.insert("summary".into(), json!(data.title));
        fields.insert("description".into(), json!(data.description));
        fields.insert("space_id".into(), json!(space));
        if data.parent().is_some() {
            fields.insert("hierarchy_type".into(), json!(SUBTASK_HIERARCHY));
        }
        if let Some(assignee) = data.assignee() {
            fields.insert("assigned_to_id".into(), json!(assignee));
        }
        let v = self.transport.post(
            &format!("/spaces/{}/tickets", space),
            &json!({ "ticket": fields }),
        )?;
        let ticket: Ticket = decode(v)?;
        info!(
            "{}: created ticket {}",
            space.yellow(),
            format!("#{}", ticket.number).green()
        );
        let parent_id = match data.parent() {
            Some(p) => p,
            None => return Ok(ticket),
        };
        let parent = match self.ticket(space, parent_id) {
            Ok(Some(p)) => p,
            res => {
                let reason = match res {
                    Err(e) => e.to_string(),
                    _ => "no such ticket".to_owned(),
                };
                warn!(
                    "{}: not linking #{} to parent {}: {}",
                    space.yellow(),
                    ticket.number,
                    parent_id,
                    reason
                );
                return Ok(ticket);
            }
        };
        let assoc = Association {
            ticket1_id: parent.id,
            ticket2_id: ticket.id,
            relationship: data.relationship.unwrap_or_default(),
        };
        match self.transport.post(
            &format!(
                "/spaces/{}/tickets/{}/ticket_associations",
                space, parent.number
            ),
            &json!(assoc),
        ) {
            Ok(_) => {
                debug!(
                    "linked #{} to parent #{} ({})",
                    ticket.number, parent.number, assoc.relationship
                );
                Ok(ticket)
            }
            Err(source) => Err(Error::Association {
                ticket: Box::new(ticket),
                source,
            }),
        }
    }

    /// Adds a comment. The endpoint is keyed on the ticket number, not its id.
    pub fn create_comment(&self, space: &str, ticket: &Ticket, comment: &str) -> Result<Comment> {
        let v = self.transport.post(
            &format!("/spaces/{}/tickets/{}/ticket_comments", space, ticket.number),
            &json!({"ticket_comment": {"comment": comment}}),
        )?;
        match v {
            Value::Null => Ok(Comment::default()),
            v => decode(v),
        }
    }

    fn tickets_page(&self, space: &str, page: u32) -> Result<Vec<Ticket>> {
        decode_list(self.transport.get(
            &format!("/spaces/{}/tickets.json", space),
            &[("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())],
        )?)
    }

    /// Searches ticket summaries (case-insensitive substring).
    ///
    /// Assembla has no server-side search, so this scans every page of the space until a short
    /// page comes back, at most [`MAX_PAGES`] pages.
    pub fn search_tickets(
        &self,
        space: &str,
        query: &str,
        kind: SearchKind,
        filters: &Filters,
    ) -> Result<Vec<Ticket>> {
        let query = query.to_lowercase();
        let mut found = Vec::new();
        for page in 1..=MAX_PAGES {
            let tickets = self.tickets_page(space, page)?;
            let full = tickets.len() >= PAGE_SIZE;
            found.extend(tickets.into_iter().filter(|t| {
                contains_ci(&t.summary, &query)
                    && filters.ticket.as_ref().map_or(true, |f| f(t))
                    && (kind != SearchKind::Parent
                        || filters.parent_ticket.as_ref().map_or(true, |f| f(t)))
            }));
            if !full {
                return Ok(found);
            }
        }
        warn!(
            "{}: ticket search stopped after {} pages",
            space.yellow(),
            MAX_PAGES
        );
        Ok(found)
    }

    /// Searches space members by name or login (case-insensitive substring).
    ///
    /// The member list is fetched once per space and then served from the shared cache.
    pub fn search_users(&self, space: &str, query: &str, filters: &Filters) -> Result<Vec<User>> {
        let users = self.users.get_or_try_insert_with(space, || {
            debug!("{}: fetching users", space.yellow());
            decode_list(
                self.transport
                    .get(&format!("/spaces/{}/users.json", space), &[])?,
            )
        })?;
        let query = query.to_lowercase();
        Ok(users
            .iter()
            .filter(|u| contains_ci(&u.name, &query) || contains_ci(&u.login, &query))
            .filter(|u| filters.user.as_ref().map_or(true, |f| f(*u)))
            .cloned()
            .collect())
    }

    /// Drops cached users of `space` so that the next search refetches them.
    ///
    /// Library hook for long-running embedders sharing one cache; the one-shot CLI starts with an
    /// empty cache anyway and never calls this.
    #[allow(unused)]
    pub fn invalidate_users(&self, space: &str) -> bool {
        self.users.invalidate(space)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::{status, ticket, tickets_json, user, Call, FakeTransport};
    use crate::ticket::Relationship;
    use assert_matches::assert_matches;
    use reqwest::StatusCode;
    use serde_json::json;

    fn client(t: &FakeTransport) -> Assembla<&FakeTransport> {
        Assembla::new(t)
    }

    fn paged(sizes: &'static [usize]) -> FakeTransport {
        FakeTransport::new(move |c: &Call| {
            let page: usize = c.param("page").unwrap().parse().unwrap();
            let size = sizes.get(page - 1).copied().unwrap_or(0);
            let start = (page - 1) * PAGE_SIZE;
            Ok(tickets_json(start..start + size))
        })
    }

    #[test]
    fn list_spaces() {
        let t = FakeTransport::new(|_| Ok(json!([{"id": "sp1", "name": "Web"}])));
        let spaces = client(&t).spaces().unwrap();
        assert_eq!(spaces[0].name, "Web");
        assert_eq!(t.calls()[0], Call::get("/spaces.json"));
    }

    #[test]
    fn empty_ids_skip_request() {
        let t = FakeTransport::new(|_| panic!("no request expected"));
        let c = client(&t);
        assert_eq!(c.ticket("sp1", "").unwrap(), None);
        assert_eq!(c.ticket("sp1", "  ").unwrap(), None);
        assert_eq!(c.ticket_by_number("sp1", "").unwrap(), None);
        assert!(t.calls().is_empty());
    }

    #[test]
    fn ticket_by_id_and_number() {
        let t = FakeTransport::new(|_| Ok(json!({"id": 55, "number": 3, "summary": "x"})));
        let c = client(&t);
        assert_eq!(c.ticket("sp1", "55").unwrap().unwrap().number, 3);
        assert_eq!(c.ticket_by_number("sp1", "3").unwrap().unwrap().id, 55);
        assert_eq!(
            t.paths(),
            vec!["/spaces/sp1/tickets/id/55", "/spaces/sp1/tickets/3"]
        );
    }

    #[test]
    fn not_found_is_transport_error() {
        let t = FakeTransport::new(|_| Err(status(404, "")));
        assert_matches!(
            client(&t).ticket("sp1", "9"),
            Err(Error::Transport(tracker::Error::Status { status, .. })) if status == StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn create_without_parent_posts_once() {
        let t = FakeTransport::new(|_| Ok(json!({"id": 10, "number": 1, "summary": "Boom"})));
        let nt = NewTicket {
            title: "Boom".into(),
            description: "stack trace".into(),
            assignee: Some("u1".into()),
            ..NewTicket::default()
        };
        let created = client(&t).create_ticket("sp1", &nt).unwrap();
        assert_eq!(created.id, 10);
        assert_eq!(
            t.calls(),
            vec![Call::post(
                "/spaces/sp1/tickets",
                json!({"ticket": {
                    "summary": "Boom",
                    "description": "stack trace",
                    "space_id": "sp1",
                    "assigned_to_id": "u1"
                }})
            )]
        );
    }

    #[test]
    fn create_with_parent_links_tickets() {
        let t = FakeTransport::new(|c: &Call| match c.path.as_str() {
            "/spaces/sp1/tickets" => Ok(json!({"id": 10, "number": 11, "summary": "Child"})),
            "/spaces/sp1/tickets/id/77" => Ok(json!({"id": 77, "number": 5, "summary": "Parent"})),
            _ => Ok(json!({})),
        });
        let nt = NewTicket {
            title: "Child".into(),
            parent_issue_id: Some("77".into()),
            ..NewTicket::default()
        };
        client(&t).create_ticket("sp1", &nt).unwrap();
        let calls = t.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[0].body.as_ref().unwrap()["ticket"]["hierarchy_type"],
            json!(1)
        );
        assert_eq!(calls[1], Call::get("/spaces/sp1/tickets/id/77"));
        assert_eq!(
            calls[2],
            Call::post(
                "/spaces/sp1/tickets/5/ticket_associations",
                json!({"ticket1_id": 77, "ticket2_id": 10, "relationship": 1})
            )
        );
    }

    #[test]
    fn create_with_explicit_relationship() {
        let t = FakeTransport::new(|c: &Call| match c.path.as_str() {
            "/spaces/sp1/tickets/id/77" => Ok(json!({"id": 77, "number": 5, "summary": "P"})),
            _ => Ok(json!({"id": 10, "number": 11, "summary": "C"})),
        });
        let nt = NewTicket {
            title: "C".into(),
            parent_issue_id: Some("77".into()),
            relationship: Some(Relationship::STORY_SUBTASK),
            ..NewTicket::default()
        };
        client(&t).create_ticket("sp1", &nt).unwrap();
        assert_eq!(t.calls()[2].body.as_ref().unwrap()["relationship"], json!(6));
    }

    #[test]
    fn parent_fetch_failure_keeps_ticket() {
        let t = FakeTransport::new(|c: &Call| match c.path.as_str() {
            "/spaces/sp1/tickets" => Ok(json!({"id": 10, "number": 11, "summary": "C"})),
            _ => Err(status(404, "{\"error\": \"Not found\"}")),
        });
        let nt = NewTicket {
            title: "C".into(),
            parent_issue_id: Some("77".into()),
            ..NewTicket::default()
        };
        assert_eq!(client(&t).create_ticket("sp1", &nt).unwrap().id, 10);
        // no association attempted
        assert_eq!(t.calls().len(), 2);
    }

    #[test]
    fn association_failure_is_distinct() {
        let t = FakeTransport::new(|c: &Call| match c.path.as_str() {
            "/spaces/sp1/tickets" => Ok(json!({"id": 10, "number": 11, "summary": "C"})),
            "/spaces/sp1/tickets/id/77" => Ok(json!({"id": 77, "number": 5, "summary": "P"})),
            _ => Err(status(422, "{\"error\": \"invalid relationship\"}")),
        });
        let nt = NewTicket {
            title: "C".into(),
            parent_issue_id: Some("77".into()),
            ..NewTicket::default()
        };
        let err = client(&t).create_ticket("sp1", &nt).unwrap_err();
        assert_matches!(
            err,
            Error::Association { ticket, source: tracker::Error::Status { .. } } if ticket.id == 10
        );
    }

    #[test]
    fn create_failure_propagates() {
        let t = FakeTransport::new(|_| Err(status(500, "")));
        let nt = NewTicket {
            title: "C".into(),
            parent_issue_id: Some("77".into()),
            ..NewTicket::default()
        };
        assert_matches!(
            client(&t).create_ticket("sp1", &nt),
            Err(Error::Transport(_))
        );
        assert_eq!(t.calls().len(), 1);
    }

    #[test]
    fn comment_uses_ticket_number() {
        let t = FakeTransport::new(|_| Ok(json!({"id": 1, "comment": "see sentry"})));
        let tkt = ticket(9999, 42, "x");
        let c = client(&t).create_comment("sp1", &tkt, "see sentry").unwrap();
        assert_eq!(c.comment.as_deref(), Some("see sentry"));
        assert_eq!(
            t.calls(),
            vec![Call::post(
                "/spaces/sp1/tickets/42/ticket_comments",
                json!({"ticket_comment": {"comment": "see sentry"}})
            )]
        );
    }

    #[test]
    fn search_walks_all_pages() {
        let t = paged(&[100, 100, 50]);
        let found = client(&t)
            .search_tickets("sp1", "TICKET 1", SearchKind::Regular, &Filters::default())
            .unwrap();
        assert_eq!(t.calls().len(), 3);
        assert_eq!(t.calls()[2].param("per_page").unwrap(), "100");
        // "Ticket 1", "Ticket 10".."Ticket 19", "Ticket 100".."Ticket 199"
        assert_eq!(found.len(), 1 + 10 + 100);
        let numbers: Vec<u64> = found.iter().map(|t| t.number).collect();
        let mut sorted = numbers.clone();
        sorted.sort();
        assert_eq!(numbers, sorted);
        assert_eq!(found[0].summary, "Ticket 1");
    }

    #[test]
    fn search_stops_after_empty_page() {
        let t = paged(&[100, 100]);
        let found = client(&t)
            .search_tickets("sp1", "", SearchKind::Regular, &Filters::default())
            .unwrap();
        assert_eq!(t.calls().len(), 3);
        assert_eq!(found.len(), 200);
    }

    #[test]
    fn search_handles_no_content() {
        let t = FakeTransport::new(|_| Ok(Value::Null));
        let found = client(&t)
            .search_tickets("sp1", "x", SearchKind::Regular, &Filters::default())
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(t.calls().len(), 1);
    }

    #[test]
    fn search_is_capped() {
        let t = FakeTransport::new(|c: &Call| {
            let page: usize = c.param("page").unwrap().parse().unwrap();
            Ok(tickets_json((page - 1) * PAGE_SIZE..page * PAGE_SIZE))
        });
        client(&t)
            .search_tickets("sp1", "nomatch", SearchKind::Regular, &Filters::default())
            .unwrap();
        assert_eq!(t.calls().len(), MAX_PAGES as usize);
    }

    #[test]
    fn parent_filter_only_for_parent_searches() {
        let t = paged(&[20]);
        let filters = Filters {
            ticket: Some(Box::new(|t: &Ticket| t.number % 2 == 0)),
            parent_ticket: Some(Box::new(|t: &Ticket| t.number < 10)),
            user: None,
        };
        let c = client(&t);
        let regular = c
            .search_tickets("sp1", "ticket", SearchKind::Regular, &filters)
            .unwrap();
        assert_eq!(regular.len(), 10);
        let parents = c
            .search_tickets("sp1", "ticket", SearchKind::Parent, &filters)
            .unwrap();
        let numbers: Vec<u64> = parents.iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn users_fetched_once() {
        let t = FakeTransport::new(|_| {
            Ok(json!([
                {"id": "u1", "name": "Ann", "login": "a1"},
                {"id": "u2", "name": "Ben", "login": "b2"}
            ]))
        });
        let c = client(&t);
        let f = Filters::default();
        assert_eq!(c.search_users("sp1", "an", &f).unwrap(), vec![user("u1", "Ann", "a1")]);
        assert_eq!(c.search_users("sp1", "B2", &f).unwrap(), vec![user("u2", "Ben", "b2")]);
        assert_eq!(c.search_users("sp1", "", &f).unwrap().len(), 2);
        assert_eq!(t.calls(), vec![Call::get("/spaces/sp1/users.json")]);
        c.search_users("sp2", "x", &f).unwrap();
        assert_eq!(t.calls().len(), 2);
    }

    #[test]
    fn users_cache_shared_and_invalidated() {
        let t = FakeTransport::new(|_| Ok(json!([{"id": "u1", "name": "Ann", "login": "a1"}])));
        let cache = Arc::new(UserCache::new());
        let c1 = Assembla::with_cache(&t, cache.clone());
        let c2 = Assembla::with_cache(&t, cache);
        let f = Filters::default();
        c1.search_users("sp1", "a", &f).unwrap();
        c2.search_users("sp1", "a", &f).unwrap();
        assert_eq!(t.calls().len(), 1);
        assert!(c2.invalidate_users("sp1"));
        c1.search_users("sp1", "a", &f).unwrap();
        assert_eq!(t.calls().len(), 2);
    }

    #[test]
    fn user_filter_applies() {
        let t = FakeTransport::new(|_| {
            Ok(json!([
                {"id": "u1", "name": "Ann", "login": "a1"},
                {"id": "u2", "name": "Anna Bot", "login": "bot-anna"}
            ]))
        });
        let f = Filters {
            user: Some(Box::new(|u: &User| !u.login.starts_with("bot-"))),
            ..Filters::default()
        };
        let found = client(&t).search_users("sp1", "ann", &f).unwrap();
        assert_eq!(found, vec![user("u1", "Ann", "a1")]);
    }

    #[test]
    fn malformed_response_keeps_body() {
        let t = FakeTransport::new(|_| Ok(json!({"unexpected": true})));
        assert_matches!(
            client(&t).spaces(),
            Err(Error::Api { res, .. }) if res.contains("unexpected")
        );
        let t = FakeTransport::new(|_| Ok(json!({"id": "not a number"})));
        assert_matches!(client(&t).ticket("sp1", "5"), Err(Error::Api { .. }));
    }
}
