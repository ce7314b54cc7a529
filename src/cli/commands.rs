use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::query::{ExportFormat, SearchField};
use crate::session::SessionStatus;

#[derive(Parser)]
#[command(
    name = "claude-relay",
    about = "Multi-agent session recording, query, and streaming",
    version
)]
pub struct Cli {
    /// Instances root directory.
    #[arg(long, global = true, default_value = "instances")]
    pub instances_root: PathBuf,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and maintain recorded sessions.
    #[command(subcommand)]
    Sessions(SessionCommands),
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// List sessions of an instance, newest first.
    List {
        instance: String,
        #[arg(long, value_enum)]
        status: Option<StatusFilterArg>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one session's metadata, statistics, and subsessions.
    Show {
        instance: String,
        session_id: String,
        /// Include a message transcript.
        #[arg(long)]
        messages: bool,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Search sessions by prompt or result text.
    Search {
        instance: String,
        query: String,
        #[arg(long, value_enum, default_value = "initial-prompt")]
        field: SearchFieldArg,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Export a session to a file.
    Export {
        instance: String,
        session_id: String,
        output: PathBuf,
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormatArg,
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        include_messages: bool,
    },
    /// Print the parent/child session tree.
    Tree {
        instance: String,
        session_id: String,
        #[arg(long, default_value_t = 10)]
        max_depth: usize,
    },
    /// Aggregate statistics across the instance's sessions.
    Stats {
        instance: String,
        #[arg(long)]
        recent_days: Option<u32>,
    },
    /// Delete sessions older than the retention window.
    Cleanup {
        instance: String,
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilterArg {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl From<StatusFilterArg> for SessionStatus {
    fn from(arg: StatusFilterArg) -> Self {
        match arg {
            StatusFilterArg::Running => Self::Running,
            StatusFilterArg::Completed => Self::Completed,
            StatusFilterArg::Failed => Self::Failed,
            StatusFilterArg::Interrupted => Self::Interrupted,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SearchFieldArg {
    InitialPrompt,
    Result,
}

impl From<SearchFieldArg> for SearchField {
    fn from(arg: SearchFieldArg) -> Self {
        match arg {
            SearchFieldArg::InitialPrompt => Self::InitialPrompt,
            SearchFieldArg::Result => Self::Result,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExportFormatArg {
    Json,
    Jsonl,
    Text,
}

impl From<ExportFormatArg> for ExportFormat {
    fn from(arg: ExportFormatArg) -> Self {
        match arg {
            ExportFormatArg::Json => Self::Json,
            ExportFormatArg::Jsonl => Self::Jsonl,
            ExportFormatArg::Text => Self::Text,
        }
    }
}
