//! CLI argument parsing for Rapport.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rapport",
    about = "A social follow graph with profile pictures",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/rapport/logs/rapport.log"
)]
pub struct Cli {
    /// Path to the rapport store directory (default: current directory)
    #[arg(short = 'd', long, global = true)]
    pub dir: Option<PathBuf>,

    /// Credential to act as (a user id, or a token when tokens are configured)
    #[arg(short = 'a', long = "as", global = true)]
    pub acting_as: Option<String>,

    /// Route requests through the daemon, starting it if needed
    #[arg(short = 'r', long, global = true)]
    pub remote: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a new rapport store in the current directory
    Init,

    /// Create the user for the acting credential
    CreateUser {
        /// Unique username (3-20 letters, digits or underscores)
        username: String,

        /// Unique email address
        email: String,
    },

    /// List all users
    Users,

    /// Show a user's profile
    Profile {
        /// User ID
        target: String,
    },

    /// Follow a user
    Follow {
        /// User ID to follow
        target: String,
    },

    /// Unfollow a user
    Unfollow {
        /// User ID to unfollow
        target: String,
    },

    /// List who a user follows (default: the acting user)
    Following {
        /// User ID
        id: Option<String>,

        /// Page number, starting at 1
        #[arg(short, long)]
        page: Option<u32>,

        /// Entries per page
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Upload a profile picture
    AddPicture {
        /// Image file
        path: PathBuf,

        /// Content type (guessed from the extension if omitted)
        #[arg(short = 't', long)]
        content_type: Option<String>,
    },

    /// Remove a profile picture
    RemovePicture {
        /// Picture ID
        picture_id: String,
    },

    /// Make a picture the primary one
    SetPrimary {
        /// Picture ID
        picture_id: String,
    },

    /// Check follower counts, edges and primary flags
    Check {
        /// Fix what the check finds
        #[arg(long)]
        repair: bool,
    },

    /// Compact the SQLite database
    Vacuum,

    /// Run the daemon in foreground
    Daemon,

    /// Stop the running daemon
    DaemonStop,

    /// Check daemon status
    DaemonStatus,
}
