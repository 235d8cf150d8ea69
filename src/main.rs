//! Rapport CLI - a social follow graph with profile pictures.

use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use rapport::{
    Client, Daemon, DaemonConfig, FollowGraph, FollowingPage, FsBlobStore, IdentityVerifier, NewUser, PictureCollection,
    Profile, Store, TokenVerifier, TrustedVerifier, UploadPolicy, User, UserListing, UserSummary, is_daemon_running,
    maintenance,
};
use std::fs;
use std::path::{Path, PathBuf};

mod cli;

use cli::{Cli, Command};

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rapport")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("rapport.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn get_store_dir(cli: &Cli) -> PathBuf {
    cli.dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Where user-facing commands run: in-process, or through the daemon.
enum Backend {
    Local {
        store: Store,
        blobs: FsBlobStore,
        actor: Option<String>,
    },
    Remote {
        client: Client,
        credential: String,
    },
}

impl Backend {
    fn open(root: &Path, credential: Option<String>, remote: bool) -> Result<Self> {
        if remote {
            let credential = credential.unwrap_or_default();
            let client = Client::connect(root, credential.clone(), true).context("Failed to connect to daemon")?;
            return Ok(Backend::Remote { client, credential });
        }

        let store = Store::open(root).context("Failed to open store")?;
        let blob_dir = store.config().blob_dir(root);
        let blobs = FsBlobStore::new(&blob_dir)
            .map_err(|e| eyre::eyre!("Failed to open blob directory {}: {}", blob_dir.display(), e))?;

        let actor = match credential {
            Some(credential) => {
                let tokens = TokenVerifier::new(store.config().tokens.clone());
                let resolved = if tokens.is_empty() {
                    TrustedVerifier.verify(&credential)
                } else {
                    tokens.verify(&credential)
                };
                Some(resolved.map_err(|e| eyre::eyre!(e))?)
            }
            None => None,
        };

        Ok(Backend::Local { store, blobs, actor })
    }

    /// The acting user id, for local runs.
    fn actor(&self) -> Result<String> {
        match self {
            Backend::Local { actor: Some(actor), .. } => Ok(actor.clone()),
            Backend::Local { actor: None, .. } => bail!("No acting user; pass --as <user id>"),
            Backend::Remote { credential, .. } if !credential.is_empty() => Ok(credential.clone()),
            Backend::Remote { .. } => bail!("No credential; pass --as <credential>"),
        }
    }

    fn create_user(&mut self, username: &str, email: &str) -> Result<User> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, .. } => store.create_user(&NewUser::new(actor, username, email)),
            Backend::Remote { client, .. } => client.create_user(username, email),
        }
    }

    fn users(&mut self) -> Result<Vec<UserListing>> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, .. } => store.list_all(&actor),
            Backend::Remote { client, .. } => client.list_users(),
        }
    }

    fn profile(&mut self, target: &str) -> Result<Profile> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, .. } => store.profile(&actor, target),
            Backend::Remote { client, .. } => client.profile(target),
        }
    }

    fn follow(&mut self, target: &str) -> Result<Profile> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, .. } => store.follow(&actor, target),
            Backend::Remote { client, .. } => client.follow(target),
        }
    }

    fn unfollow(&mut self, target: &str) -> Result<Profile> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, .. } => store.unfollow(&actor, target),
            Backend::Remote { client, .. } => client.unfollow(target),
        }
    }

    fn following(&mut self, id: Option<String>, page: Option<u32>, limit: Option<u32>) -> Result<FollowingPage> {
        let id = match id {
            Some(id) => id,
            None => self.actor()?,
        };
        match self {
            Backend::Local { store, .. } => {
                let request = store.config().paging.request(page, limit);
                store.following(&id, request)
            }
            Backend::Remote { client, .. } => client.following(&id, page, limit),
        }
    }

    fn add_picture(&mut self, data: Vec<u8>, content_type: &str) -> Result<User> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, blobs, .. } => store.add_picture(&actor, &data, content_type, blobs),
            Backend::Remote { client, .. } => client.add_picture(data, content_type),
        }
    }

    fn remove_picture(&mut self, picture_id: &str) -> Result<User> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, blobs, .. } => store.remove_picture(&actor, picture_id, blobs),
            Backend::Remote { client, .. } => client.remove_picture(picture_id),
        }
    }

    fn set_primary(&mut self, picture_id: &str) -> Result<User> {
        let actor = self.actor()?;
        match self {
            Backend::Local { store, .. } => store.set_primary_picture(&actor, picture_id),
            Backend::Remote { client, .. } => client.set_primary_picture(picture_id),
        }
    }
}

fn format_counts(user: &UserSummary) -> String {
    format!(
        "{} followers, {} following",
        user.followers_count, user.following_count
    )
}

fn print_profile(profile: &Profile) {
    println!("{}: {}", "ID".bold(), profile.user.id.cyan());
    println!("{}: {}", "Username".bold(), profile.user.username);
    println!("{}: {}", "Email".bold(), profile.user.email);
    println!("{}: {}", "Counts".bold(), format_counts(&profile.user));
    println!(
        "{}: {}",
        "Following".bold(),
        if profile.is_following { "yes".green() } else { "no".dimmed() }
    );
    if !profile.pictures.is_empty() {
        println!("{}:", "Pictures".bold());
        for picture in &profile.pictures {
            let marker = if picture.is_primary { "*".yellow() } else { " ".normal() };
            println!("  {} {} {}", marker, picture.id.cyan(), picture.url.dimmed());
        }
    }
}

fn print_pictures(user: &User) {
    if user.pictures.is_empty() {
        println!("{}", "No pictures".dimmed());
        return;
    }
    for picture in &user.pictures {
        let marker = if picture.is_primary { "*".yellow() } else { " ".normal() };
        println!("  {} {} {}", marker, picture.id.cyan(), picture.url.dimmed());
    }
}

fn run(cli: Cli) -> Result<()> {
    let store_dir = get_store_dir(&cli);

    match cli.command {
        Command::Init => {
            Store::init(&store_dir).context("Failed to initialize rapport store")?;
            println!("{} Initialized rapport store in {}", "✓".green(), store_dir.display());
        }

        Command::CreateUser { username, email } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let user = backend
                .create_user(&username, &email)
                .context("Failed to create user")?;
            println!("{} Created: {} {}", "✓".green(), user.id.cyan(), user.username);
        }

        Command::Users => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let users = backend.users().context("Failed to list users")?;

            if users.is_empty() {
                println!("{}", "No users found".dimmed());
            } else {
                for listing in users {
                    let marker = if listing.is_following { "→".green() } else { " ".normal() };
                    println!(
                        "{} {} {} {}",
                        marker,
                        listing.user.id.cyan(),
                        listing.user.username,
                        format!("({})", format_counts(&listing.user)).dimmed()
                    );
                }
            }
        }

        Command::Profile { target } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let profile = backend.profile(&target).context("Failed to get profile")?;
            print_profile(&profile);
        }

        Command::Follow { target } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let profile = backend.follow(&target).context("Failed to follow")?;
            println!(
                "{} Now following {} ({})",
                "✓".green(),
                profile.user.id.cyan(),
                format_counts(&profile.user)
            );
        }

        Command::Unfollow { target } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let profile = backend.unfollow(&target).context("Failed to unfollow")?;
            println!(
                "{} No longer following {} ({})",
                "✓".green(),
                profile.user.id.cyan(),
                format_counts(&profile.user)
            );
        }

        Command::Following { id, page, limit } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let result = backend
                .following(id, page, limit)
                .context("Failed to list following")?;

            if result.following.is_empty() {
                println!("{}", "Not following anyone on this page".dimmed());
            } else {
                println!(
                    "{} page {} ({} per page, {} total):",
                    "→".blue(),
                    result.page,
                    result.limit,
                    result.total
                );
                for user in result.following {
                    println!("  {} {}", user.id.cyan(), user.username);
                }
            }
        }

        Command::AddPicture { path, content_type } => {
            let content_type = match content_type {
                Some(ct) => ct,
                None => match UploadPolicy::content_type_for(&path) {
                    Some(ct) => ct.to_string(),
                    None => bail!("Cannot guess content type of {}; pass --content-type", path.display()),
                },
            };
            let data = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;

            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let user = backend
                .add_picture(data, &content_type)
                .context("Failed to add picture")?;
            println!("{} Added picture for {}", "✓".green(), user.id.cyan());
            print_pictures(&user);
        }

        Command::RemovePicture { picture_id } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let user = backend
                .remove_picture(&picture_id)
                .context("Failed to remove picture")?;
            println!("{} Removed {}", "✓".green(), picture_id.cyan());
            print_pictures(&user);
        }

        Command::SetPrimary { picture_id } => {
            let mut backend = Backend::open(&store_dir, cli.acting_as, cli.remote)?;
            let user = backend
                .set_primary(&picture_id)
                .context("Failed to set primary picture")?;
            println!("{} {} is now primary", "✓".green(), picture_id.cyan());
            print_pictures(&user);
        }

        Command::Check { repair } => {
            let mut store = Store::open(&store_dir).context("Failed to open store")?;
            let report = maintenance::check(&store).context("Failed to check store")?;

            println!(
                "{} users, {} edges, {} pictures",
                report.users, report.edges, report.pictures
            );

            if report.is_consistent() {
                println!("{} Store is consistent", "✓".green());
            } else {
                for drift in &report.count_drift {
                    println!(
                        "  {} {} counts {}/{} but sets hold {}/{}",
                        "✗".red(),
                        drift.user_id.cyan(),
                        drift.followers_count,
                        drift.following_count,
                        drift.followers_actual,
                        drift.following_actual
                    );
                }
                for half in &report.half_edges {
                    println!(
                        "  {} {} → {} recorded on the {:?} side only",
                        "✗".red(),
                        half.actor.cyan(),
                        half.target.cyan(),
                        half.present
                    );
                }
                for id in &report.primary_violations {
                    println!("  {} {} does not have exactly one primary picture", "✗".red(), id.cyan());
                }
                for id in &report.over_capacity {
                    println!("  {} {} holds too many pictures", "✗".red(), id.cyan());
                }

                if repair {
                    let result = maintenance::repair(&mut store).context("Failed to repair store")?;
                    println!(
                        "{} Repaired: {} edge(s) completed, {} dropped, {} count(s) and {} primary flag(s) fixed",
                        "✓".green(),
                        result.edges_completed,
                        result.edges_dropped,
                        result.counts_fixed,
                        result.primaries_fixed
                    );
                } else {
                    println!("{} Run with --repair to fix", "→".blue());
                    std::process::exit(1);
                }
            }
        }

        Command::Vacuum => {
            let result = maintenance::vacuum(&store_dir).context("Failed to vacuum store")?;
            println!(
                "{} Vacuumed: {} → {} bytes ({} users, {} edges, {} pictures)",
                "✓".green(),
                result.size_before,
                result.size_after,
                result.users,
                result.edges,
                result.pictures
            );
        }

        Command::Daemon => {
            println!("{} Starting daemon for {}", "→".blue(), store_dir.display());

            let config = DaemonConfig::new(&store_dir);
            let mut daemon = Daemon::new(config).context("Failed to create daemon")?;

            // Run daemon in async runtime
            let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
            rt.block_on(async { daemon.run().await }).context("Daemon error")?;
        }

        Command::DaemonStop => {
            if !is_daemon_running(&store_dir) {
                println!("{} Daemon is not running", "✗".red());
                std::process::exit(1);
            }

            let mut client = Client::connect(&store_dir, "", false).context("Failed to connect to daemon")?;
            client.shutdown().context("Failed to shutdown daemon")?;
            println!("{} Daemon stopped", "✓".green());
        }

        Command::DaemonStatus => {
            if is_daemon_running(&store_dir) {
                println!("{} Daemon is running", "✓".green());

                // Try to ping
                if let Ok(mut client) = Client::connect(&store_dir, "", false)
                    && client.ping().is_ok()
                {
                    println!("  {} Responding to requests", "✓".green());
                }
            } else {
                println!("{} Daemon is not running", "✗".red());
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    info!("Command: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
