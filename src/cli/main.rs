//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Repo-IMAP.
//
// Repo-IMAP is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Repo-IMAP is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Repo-IMAP. If not, see <http://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, LevelFilter};
use structopt::StructOpt;

use super::fixture::Fixture;
use crate::imap::model::ViewMode;
use crate::imap::service::DELIMITER;
use crate::imap::ImapService;
use crate::repository::memory::MemoryRepository;
use crate::repository::Repository;
use crate::support::sysexits::*;
use crate::support::system_config::ImapConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// A log4rs configuration file [default: logging.toml if present]
    #[structopt(long, parse(from_os_str))]
    logging: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Parse a configuration file and print the effective configuration.
    CheckConfig(CheckConfigSubcommand),
    /// Compute the status of a folder described by a fixture.
    ///
    /// The fixture is loaded into an in-memory repository, then the status
    /// is computed through the same path a mail session would use.
    Status(StatusSubcommand),
    /// List the mailboxes of a fixture, as `LIST` or `LSUB` would.
    List(ListSubcommand),
}

#[derive(StructOpt)]
struct CheckConfigSubcommand {
    /// The configuration file to check.
    #[structopt(long, parse(from_os_str))]
    config: PathBuf,
}

#[derive(StructOpt)]
struct StatusSubcommand {
    /// The fixture describing the repository contents.
    #[structopt(long, parse(from_os_str))]
    fixture: PathBuf,

    /// The full name of the folder, e.g. `INBOX.Sub`.
    #[structopt(long)]
    folder: String,

    /// The user whose view to compute.
    #[structopt(long, default_value = "user")]
    user: String,

    /// archive, virtual or mixed
    #[structopt(long, default_value = "archive")]
    mode: ViewMode,

    /// Configuration file [default: built-in defaults]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
}

#[derive(StructOpt)]
struct ListSubcommand {
    /// The fixture describing the repository contents.
    #[structopt(long, parse(from_os_str))]
    fixture: PathBuf,

    /// `*` matches anything, `%` anything but the hierarchy delimiter.
    #[structopt(long, default_value = "*")]
    pattern: String,

    /// The user whose view to list.
    #[structopt(long, default_value = "user")]
    user: String,

    /// Only list subscribed mailboxes.
    #[structopt(long)]
    subscribed: bool,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    init_log(options.logging.as_deref());

    let result = match options.command {
        Command::CheckConfig(cmd) => check_config(cmd),
        Command::Status(cmd) => status(cmd),
        Command::List(cmd) => list(cmd),
    };

    if let Err(exit) = result {
        exit.exit();
    }
}

fn init_log(path: Option<&Path>) {
    let default_path = Path::new("logging.toml");
    let path = match path {
        Some(path) => Some(path),
        None if default_path.is_file() => Some(default_path),
        None => None,
    };

    match path {
        Some(path) => {
            if let Err(e) = log4rs::init_file(
                path,
                log4rs::file::Deserializers::default(),
            ) {
                eprintln!(
                    "Failed to initialise logging from '{}': {}",
                    path.display(),
                    e
                );
                EX_CONFIG.exit();
            }
        }
        None => crate::init_simple_log(LevelFilter::Info),
    }
}

fn load_config(path: &Path) -> Result<ImapConfig, Sysexit> {
    ImapConfig::load(path).map_err(|e| {
        eprintln!("Error in config file at '{}': {}", path.display(), e);
        EX_CONFIG
    })
}

fn check_config(cmd: CheckConfigSubcommand) -> Result<(), Sysexit> {
    let config = load_config(&cmd.config)?;
    match toml::to_string_pretty(&config) {
        Ok(s) => {
            print!("{}", s);
            Ok(())
        }
        Err(e) => {
            error!("Failed to format configuration: {}", e);
            Err(EX_SOFTWARE)
        }
    }
}

fn load_fixture(
    path: &Path,
    config: &ImapConfig,
) -> Result<(Arc<MemoryRepository>, ImapService), Sysexit> {
    let fixture = Fixture::load(path).map_err(|e| {
        eprintln!("Error reading '{}': {}", path.display(), e);
        if let crate::support::error::Error::Io(_) = e {
            EX_NOINPUT
        } else {
            EX_DATAERR
        }
    })?;

    let repo = Arc::new(MemoryRepository::new());
    let service =
        ImapService::new(Arc::clone(&repo) as Arc<dyn Repository>, config);
    fixture.apply(&repo, &service).map_err(|e| {
        eprintln!("Failed to load fixture: {}", e);
        EX_DATAERR
    })?;

    Ok((repo, service))
}

fn status(cmd: StatusSubcommand) -> Result<(), Sysexit> {
    let config = match cmd.config {
        Some(ref path) => load_config(path)?,
        None => ImapConfig::default(),
    };

    let (repo, service) = load_fixture(&cmd.fixture, &config)?;
    let root = repo.root();
    let log_prefix = format!("{}:{}", cmd.user, cmd.folder);
    let result = service.transactions().run(true, &log_prefix, |tx| {
        let folder = service.resolve_mailbox(tx, root, &cmd.folder)?;
        service.folder_status(tx, &cmd.user, folder, cmd.mode)
    });

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            eprintln!("{}: {}", cmd.folder, e);
            return Err(if e.is_not_found() {
                EX_DATAERR
            } else {
                EX_SOFTWARE
            });
        }
    };

    println!("folder: {}", cmd.folder);
    println!("messages: {}", status.message_count);
    println!("recent: {}", status.recent_count);
    println!("unseen: {}", status.unseen_count);
    println!("first unseen: {}", status.first_unseen);
    println!("uidvalidity: {}", status.uid_validity);
    println!("uidnext: {}", status.uid_next());
    let uids: Vec<String> =
        status.search.keys().map(|uid| uid.to_string()).collect();
    println!("uids: {}", uids.join(" "));

    debug!(
        "{} {} status computations, {} cached statuses",
        log_prefix,
        service.status_computations(),
        service.cache().len()
    );
    Ok(())
}

fn list(cmd: ListSubcommand) -> Result<(), Sysexit> {
    let (repo, service) = load_fixture(&cmd.fixture, &ImapConfig::default())?;
    let root = repo.root();
    let result = service.transactions().run(true, &cmd.user, |tx| {
        if cmd.subscribed {
            service.list_subscribed_mailboxes(
                tx,
                &cmd.user,
                root,
                &cmd.pattern,
            )
        } else {
            service.list_mailboxes(tx, &cmd.user, root, &cmd.pattern)
        }
    });

    let mailboxes = result.map_err(|e| {
        eprintln!("{}: {}", cmd.pattern, e);
        EX_SOFTWARE
    })?;

    for mailbox in mailboxes {
        let mut attributes = Vec::new();
        if !mailbox.selectable {
            attributes.push("\\Noselect");
        }
        attributes.push(if mailbox.has_children {
            "\\HasChildren"
        } else {
            "\\HasNoChildren"
        });
        if mailbox.subscribed && !cmd.subscribed {
            attributes.push("\\Subscribed");
        }

        println!(
            "({}) \"{}\" {}",
            attributes.join(" "),
            DELIMITER,
            mailbox.name
        );
    }
    Ok(())
}
