use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use claude_relay::cli::{Cli, Commands, Display, SessionCommands};
use claude_relay::error::Result;
use claude_relay::query::SessionQuery;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("claude_relay=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("claude_relay=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();

    match cli.command {
        Commands::Sessions(command) => run_sessions(&display, &cli.instances_root, command),
    }
}

fn query_for(instance: &str, instances_root: &Path) -> Result<SessionQuery> {
    SessionQuery::new(instance, instances_root, None)
}

fn run_sessions(display: &Display, instances_root: &Path, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::List {
            instance,
            status,
            limit,
            offset,
        } => {
            let query = query_for(&instance, instances_root)?;
            let sessions = query.list_sessions(status.map(Into::into), limit, offset)?;
            display.print_header(&format!("Sessions: {}", instance));
            display.print_sessions_table(&sessions);
            Ok(())
        }
        SessionCommands::Show {
            instance,
            session_id,
            messages,
            limit,
        } => {
            let query = query_for(&instance, instances_root)?;
            let details = query.get_session_details(&session_id, messages, Some(limit))?;
            display.print_session_detail(&details);
            Ok(())
        }
        SessionCommands::Search {
            instance,
            query: needle,
            field,
            limit,
        } => {
            let query = query_for(&instance, instances_root)?;
            let sessions = query.search_sessions(&needle, field.into(), limit)?;
            display.print_header(&format!("Search: \"{}\"", needle));
            display.print_sessions_table(&sessions);
            Ok(())
        }
        SessionCommands::Export {
            instance,
            session_id,
            output,
            format,
            include_messages,
        } => {
            let query = query_for(&instance, instances_root)?;
            query.export_session(&session_id, &output, format.into(), include_messages)?;
            display.print_success(&format!("Exported {} to {}", session_id, output.display()));
            Ok(())
        }
        SessionCommands::Tree {
            instance,
            session_id,
            max_depth,
        } => {
            let query = query_for(&instance, instances_root)?;
            let tree = query.build_session_tree(&session_id, None, false, max_depth)?;
            display.print_header(&format!("Session tree: {}", session_id));
            display.print_tree(&tree.flatten());
            Ok(())
        }
        SessionCommands::Stats {
            instance,
            recent_days,
        } => {
            let query = query_for(&instance, instances_root)?;
            let summary = query.get_statistics_summary(recent_days)?;
            display.print_summary(&summary);
            Ok(())
        }
        SessionCommands::Cleanup {
            instance,
            retention_days,
            dry_run,
        } => {
            let query = query_for(&instance, instances_root)?;
            let report = query.cleanup_sessions(retention_days, dry_run)?;
            display.print_cleanup_report(&report);
            Ok(())
        }
    }
}
