use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use screen_rewards::config::AppCategory;

/// Screen-time rewards
///
/// Children earn points in learning apps and spend them on earned time in
/// reward apps.
#[derive(Parser, Debug)]
#[command(name = "screen-rewards")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (platform default when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a configuration file from the example
    Init {
        /// Where to write the file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Device id to put in the file
        #[arg(long)]
        device_id: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show a child's balances
    Balance {
        child: String,
    },
    /// Show a child's ledger entries, most recent first
    History {
        child: String,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Add or remove points by hand
    Adjust {
        child: String,

        /// Signed number of points
        #[arg(allow_hyphen_values = true)]
        points: i64,

        /// Why the correction is made (recorded in the audit log)
        #[arg(short, long)]
        reason: String,

        /// Scope the adjustment to one app instead of the global pool
        #[arg(long)]
        app: Option<String>,
    },
    /// Spend points on earned time
    Redeem {
        child: String,

        points: i64,

        /// Reward app whose conversion rate applies
        #[arg(long)]
        app: Option<String>,
    },
    /// Show earned-time windows and balances
    Status {
        /// Only this child
        child: Option<String>,
    },
    /// Revoke a child's earned time
    Cancel {
        child: String,
    },
    /// Show the audit log, most recent first
    Audit {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Classify an app
    Classify {
        app: String,

        #[arg(value_enum)]
        category: CategoryArg,

        /// Name shown to parents
        #[arg(long)]
        name: Option<String>,
    },
    /// Derive the app id for a platform app token
    AppId {
        token: String,
    },
    /// Restore windows and process activity events from stdin until Ctrl-C
    Run,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CategoryArg {
    Learning,
    Reward,
    Neutral,
}

impl From<CategoryArg> for AppCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Learning => AppCategory::Learning,
            CategoryArg::Reward => AppCategory::Reward,
            CategoryArg::Neutral => AppCategory::Neutral,
        }
    }
}
