use console::{Style, style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::query::{FlatNode, SessionDetails, StatisticsSummary};
use crate::session::manager::CleanupReport;
use crate::session::{SessionMetadata, SessionStatus};
use crate::utils::string::truncate_chars;
use crate::utils::time::format_iso_millis;

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_success(&self, text: &str) {
        println!("{} {}", style("✓").green().bold(), text);
    }

    pub fn print_warning(&self, text: &str) {
        println!("{} {}", style("!").yellow().bold(), text);
    }

    pub fn print_error(&self, text: &str) {
        eprintln!("{} {}", style("✗").red().bold(), text);
    }

    pub fn print_info(&self, text: &str) {
        println!("{} {}", style("·").dim(), text);
    }

    pub fn create_spinner(&self, message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(std::time::Duration::from_millis(100));
        spinner
    }

    pub fn print_sessions_table(&self, sessions: &[SessionMetadata]) {
        if sessions.is_empty() {
            self.print_info("No sessions found.");
            return;
        }

        println!(
            "{:<34} {:<12} {:>5}  {}",
            style("SESSION").bold(),
            style("STATUS").bold(),
            style("DEPTH").bold(),
            style("PROMPT").bold()
        );
        for session in sessions {
            println!(
                "{:<34} {:<12} {:>5}  {}",
                session.session_id,
                self.status_style(session.status)
                    .apply_to(session.status.to_string()),
                session.depth,
                truncate_chars(&session.initial_prompt.replace('\n', " "), 48)
            );
        }
    }

    pub fn print_session_detail(&self, details: &SessionDetails) {
        let metadata = &details.metadata;
        self.print_header(&format!("Session: {}", metadata.session_id));

        println!("Instance:  {}", style(&metadata.instance_name).bold());
        println!(
            "Status:    {}",
            self.status_style(metadata.status)
                .apply_to(metadata.status.to_string())
        );
        println!("Depth:     {}", metadata.depth);
        if let Some(parent) = &metadata.parent_session_id {
            println!("Parent:    {}", style(parent).dim());
        }
        if let Some(resume_of) = &metadata.resume_of {
            println!("Resume of: {}", style(resume_of).dim());
        }
        println!("Started:   {}", format_iso_millis(&metadata.start_time));
        if let Some(end_time) = metadata.end_time {
            println!("Ended:     {}", format_iso_millis(&end_time));
        }
        println!();
        println!("Prompt:    {}", truncate_chars(&metadata.initial_prompt, 120));

        let stats = &details.statistics;
        println!();
        println!("Messages:  {}", stats.num_messages);
        println!("Tools:     {}", stats.num_tool_calls);
        println!("Duration:  {}ms", stats.total_duration_ms);
        println!(
            "Tokens:    {} in / {} out",
            stats.tokens_in, stats.tokens_out
        );
        if let Some(cost) = stats.cost_usd {
            println!("Cost:      ${:.4}", cost);
        }

        if !details.subsessions.is_empty() {
            println!();
            println!("{}", style("Subsessions").bold());
            for link in &details.subsessions {
                println!(
                    "  {} {} ({})",
                    style("↳").dim(),
                    link.session_id,
                    link.instance_name
                );
            }
        }

        if !details.messages.is_empty() {
            println!();
            println!("{}", style("Transcript").bold());
            for (seq, message) in details.messages.iter().enumerate() {
                println!(
                    "  [{}] {} {}",
                    seq,
                    style(message.message_type()).cyan(),
                    style(format_iso_millis(&message.timestamp)).dim()
                );
                for part in message.payload.text_parts() {
                    println!("      {}", truncate_chars(part, 100));
                }
            }
        }
        println!();
    }

    pub fn print_tree(&self, nodes: &[FlatNode]) {
        for node in nodes {
            let indent = "  ".repeat(node.depth as usize);
            match &node.error {
                Some(error) => println!(
                    "{}{} {} ({}) {}",
                    indent,
                    style("✗").red(),
                    node.session_id,
                    node.instance_name,
                    style(error).red().dim()
                ),
                None => println!(
                    "{}{} {} ({})",
                    indent,
                    style("●").cyan(),
                    node.session_id,
                    node.instance_name
                ),
            }
        }
    }

    pub fn print_summary(&self, summary: &StatisticsSummary) {
        self.print_header("Session Statistics");
        if let Some(days) = summary.recent_days {
            self.print_info(&format!("Window: last {} days", days));
        }
        println!("Sessions:   {}", summary.total_sessions);
        println!(
            "  completed {}, failed {}, running {}",
            style(summary.completed_sessions).green(),
            style(summary.failed_sessions).red(),
            summary.running_sessions
        );
        println!("Messages:   {}", summary.total_messages);
        println!("Tool calls: {}", summary.total_tool_calls);
        println!("Total cost: ${:.4}", summary.total_cost_usd);
        println!("Avg turn:   {:.0}ms", summary.avg_duration_ms);
        println!();
    }

    pub fn print_cleanup_report(&self, report: &CleanupReport) {
        if report.dry_run {
            self.print_warning(&format!(
                "Dry run: {} sessions ({:.2} MB) would be deleted",
                report.deleted, report.total_size_mb
            ));
        } else {
            self.print_success(&format!(
                "Deleted {} sessions ({:.2} MB)",
                report.deleted, report.total_size_mb
            ));
        }
        for entry in &report.sessions {
            self.print_info(&format!("{} ({} bytes)", entry.session_id, entry.size_bytes));
        }
    }

    fn status_style(&self, status: SessionStatus) -> Style {
        match status {
            SessionStatus::Running => Style::new().cyan(),
            SessionStatus::Completed => Style::new().green(),
            SessionStatus::Failed => Style::new().red(),
            SessionStatus::Interrupted => Style::new().yellow(),
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
