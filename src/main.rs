#[macro_use]
extern crate log;

mod cache;
mod client;
mod filter;
mod form;
mod oauth;
mod plugin;
mod ticket;
mod tracker;

use crate::cache::UserCache;
use crate::filter::{FilterSpec, Filters};
use crate::oauth::Authenticator;
use crate::plugin::{Options, Plugin};
use crate::ticket::{NewTicket, Relationship};
use crate::tracker::Http;

use anyhow::{bail, Context, Error};
use env_logger::Env;
use serde::Serialize;
use serde_json::json;
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, StructOpt)]
#[structopt(
    rename_all = "kebab",
    after_help = "\
    Settings may also be placed into a .env file in the current directory.
    Set RUST_LOG=assembla_link=debug in the environment to get full logging output.
    "
)]
pub struct Opt {
    /// Assembla access token of the acting user
    #[structopt(short, long, global = true, env = "ASSEMBLA_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// OAuth client id
    #[structopt(long, global = true, env = "ASSEMBLA_CLIENT_ID")]
    client_id: Option<String>,
    /// OAuth client secret
    #[structopt(long, global = true, env = "ASSEMBLA_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
    /// Assembla space configured for this project
    #[structopt(short, long, global = true, env = "ASSEMBLA_SPACE")]
    space: Option<String>,
    /// Ticket number preselected as parent for new tickets
    #[structopt(long, global = true, value_name = "NUMBER", env = "ASSEMBLA_PARENT_TICKET")]
    parent_ticket: Option<String>,
    /// Default relationship between new tickets and their parent (1: parent/child, 6: story/subtask)
    #[structopt(long, global = true, env = "ASSEMBLA_RELATIONSHIP")]
    relationship: Option<Relationship>,
    /// Only offer tickets matching [!]FIELD~REGEX
    #[structopt(long, global = true, value_name = "FILTER", env = "ASSEMBLA_TICKET_FILTER")]
    ticket_filter: Option<FilterSpec>,
    /// Additionally applied when searching parent tickets
    #[structopt(
        long,
        global = true,
        value_name = "FILTER",
        env = "ASSEMBLA_PARENTTICKET_FILTER"
    )]
    parent_ticket_filter: Option<FilterSpec>,
    /// Only offer users matching [!]FIELD~REGEX
    #[structopt(long, global = true, value_name = "FILTER", env = "ASSEMBLA_USERS_FILTER")]
    users_filter: Option<FilterSpec>,
    /// REST API base URL
    #[structopt(
        long,
        global = true,
        value_name = "URL",
        env = "ASSEMBLA_API_URL",
        default_value = "https://api.assembla.com/v1"
    )]
    api_url: String,
    /// OAuth authorization server [default: https://api.assembla.com]
    #[structopt(long, global = true, value_name = "URL", env = "ASSEMBLA_OAUTH_URL")]
    oauth_url: Option<String>,
    /// HTTP request timeout in seconds [default: 30]
    #[structopt(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,
    #[structopt(subcommand)]
    command: Cmd,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Cmd {
    /// Lists spaces accessible to the token owner.
    Spaces,
    /// Shows the plugin configuration form.
    Config,
    /// Checks the plugin configuration given by --space etc.
    ValidateConfig,
    /// Shows the form for creating a ticket.
    NewIssueFields {
        /// Prefilled ticket summary
        #[structopt(long, default_value = "")]
        title: String,
        /// Prefilled ticket description
        #[structopt(long, default_value = "")]
        description: String,
    },
    /// Shows the form for linking an existing ticket.
    LinkIssueFields {
        /// Issue URL proposed as comment
        #[structopt(value_name = "URL", default_value = "")]
        group_url: String,
    },
    /// Creates a ticket, optionally as child of another one.
    Create(Create),
    /// Links an existing ticket by id, optionally leaving a comment.
    Link {
        #[structopt(value_name = "TICKET_ID")]
        issue_id: String,
        #[structopt(short, long)]
        comment: Option<String>,
    },
    /// Adds a comment to a ticket given by number.
    Comment {
        #[structopt(value_name = "NUMBER")]
        number: String,
        text: String,
    },
    /// Suggests tickets (issue_id, parent_issue_id) or users (assignee).
    Autocomplete {
        #[structopt(value_name = "FIELD")]
        field: String,
        #[structopt(value_name = "QUERY", default_value = "")]
        query: String,
    },
    /// Prints the URL to send users to for authorization.
    AuthUrl {
        #[structopt(long)]
        state: Option<String>,
    },
    /// Exchanges an authorization code for tokens.
    Exchange { code: String },
    /// Obtains a fresh access token.
    Refresh { refresh_token: String },
    /// Shows the account behind --token.
    Whoami,
}

#[derive(Debug, Clone, StructOpt)]
pub struct Create {
    /// Ticket summary
    title: String,
    #[structopt(short, long, default_value = "")]
    description: String,
    /// User id to assign the ticket to
    #[structopt(short, long)]
    assignee: Option<String>,
    /// Id of the parent ticket
    #[structopt(short, long, value_name = "TICKET_ID")]
    parent: Option<String>,
}

impl Opt {
    fn options(&self) -> Options {
        Options {
            space: self.space.clone(),
            parent_issue_number: self.parent_ticket.clone(),
            relationship: self.relationship,
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout.map_or(tracker::TIMEOUT, Duration::from_secs)
    }

    fn filters(&self) -> Result<Filters> {
        Ok(Filters::from_specs(
            self.ticket_filter.clone(),
            self.parent_ticket_filter.clone(),
            self.users_filter.clone(),
        )?)
    }

    fn authenticator(&self) -> Result<Authenticator> {
        Ok(Authenticator::new(
            self.client_id.as_deref(),
            self.client_secret.as_deref(),
            self.oauth_url.as_deref().unwrap_or(oauth::OAUTH_URL),
            self.timeout(),
        )?)
    }
}

fn create_plugin(opt: &Opt) -> Result<Plugin<Http>> {
    let auth = match &opt.token {
        Some(token) => Some(Http::new(token, &opt.api_url, opt.timeout())?),
        None => None,
    };
    let p = Plugin::new(
        opt.options(),
        auth,
        Arc::new(UserCache::new()),
        opt.filters()?,
    );
    if !p.is_configured() {
        info!("No Assembla space configured");
    }
    Ok(p)
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    serde_json::to_writer_pretty(stdout().lock(), value).context("broken pipe")?;
    println!();
    Ok(())
}

fn run() -> Result<()> {
    dotenv::dotenv().ok();
    let opt = Opt::from_args();
    if opt.client_id.is_none() || opt.client_secret.is_none() {
        info!("Assembla client id or secret not set");
    }
    match &opt.command {
        Cmd::Spaces => print(&create_plugin(&opt)?.client()?.spaces()?),
        Cmd::Config => print(&create_plugin(&opt)?.config_fields()?),
        Cmd::ValidateConfig => print(&plugin::validate_config(opt.options())?),
        Cmd::NewIssueFields { title, description } => {
            print(&create_plugin(&opt)?.new_issue_fields(title, description)?)
        }
        Cmd::LinkIssueFields { group_url } => {
            print(&create_plugin(&opt)?.link_issue_fields(group_url))
        }
        Cmd::Create(c) => {
            let form = NewTicket {
                title: c.title.clone(),
                description: c.description.clone(),
                assignee: c.assignee.clone(),
                parent_issue_id: c.parent.clone(),
                relationship: opt.relationship,
            };
            match create_plugin(&opt)?.create_issue(&form) {
                Ok(id) => print(&json!({ "id": id })),
                Err(plugin::Error::Unlinked {
                    id,
                    number,
                    message,
                }) => {
                    print(&json!({ "id": id, "number": number, "linked": false }))?;
                    bail!(message)
                }
                Err(e) => Err(e.into()),
            }
        }
        Cmd::Link { issue_id, comment } => {
            print(&create_plugin(&opt)?.link_issue(issue_id, comment.as_deref())?)
        }
        Cmd::Comment { number, text } => {
            let p = create_plugin(&opt)?;
            let space = match opt.space.as_deref() {
                Some(s) => s,
                None => bail!("No space given either as option or via ASSEMBLA_SPACE"),
            };
            let client = p.client()?;
            match client.ticket_by_number(space, number)? {
                Some(t) => print(&client.create_comment(space, &t, text)?),
                None => bail!("No ticket number given"),
            }
        }
        Cmd::Autocomplete { field, query } => {
            print(&create_plugin(&opt)?.autocomplete(field, query)?)
        }
        Cmd::AuthUrl { state } => {
            println!("{}", opt.authenticator()?.authorization_url(state.as_deref())?);
            Ok(())
        }
        Cmd::Exchange { code } => print(&opt.authenticator()?.exchange_code(code)?),
        Cmd::Refresh { refresh_token } => print(&opt.authenticator()?.refresh(refresh_token)?),
        Cmd::Whoami => match &opt.token {
            Some(token) => print(&opt.authenticator()?.identity(token)?),
            None => bail!(
                "No Assembla access token given either as option or via the ASSEMBLA_TOKEN \
                 environment variable"
            ),
        },
    }
}

fn main() {
    env_logger::from_env(Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        for e in err.chain() {
            error!("{}", e);
            // reqwest seems to fold all causes into its head error
            if e.downcast_ref::<reqwest::Error>().is_some() {
                break;
            }
        }
        std::process::exit(1);
    }
}
