//! CLI command definitions

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the batch server until interrupted
    Serve,

    /// Manage registered source repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand)]
pub enum RepoCommands {
    /// Register a repository and run the clone pipeline to completion
    Register {
        /// Unique repository name (also the directory name)
        name: String,

        /// Git remote URL to clone from
        url: String,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,

        /// Bootstrap the semantic index after cloning
        #[arg(long)]
        cidx: bool,
    },

    /// List registered repositories
    List,

    /// Remove a repository and its on-disk directory
    Unregister {
        /// Repository name
        name: String,
    },
}
