//! CLI inbound adapter that translates command-line arguments into application service calls.

mod help;

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};

use crate::{
    cli::{
        Commands, CredentialArgs, FlowCommand, HelpArgs, HelpFormat, HelpTopic, ProjectCommand,
        ResultsArgs, RunArgs, StatusArgs, UserCommand,
    },
    core::{
        domain::{ResultStatus, TestResult},
        ports::{
            ExecutionService, FlowStatusView, NewFlow, NewProject, ResultListing, RunFlowRequest,
            RunMode, RunResponse,
        },
    },
};

/// CLI adapter that consumes the `ExecutionService` to execute commands.
pub struct CliAdapter {
    service: Arc<dyn ExecutionService>,
}

impl CliAdapter {
    pub fn new(service: Arc<dyn ExecutionService>) -> Self {
        Self { service }
    }

    /// Execute a CLI command by dispatching to the appropriate service method.
    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run(args) => self.run_command(args).await,
            Commands::Status(args) => self.status_command(args).await,
            Commands::Results(args) => self.results_command(args).await,
            Commands::Project(ProjectCommand::Create(args)) => {
                let id = self
                    .service
                    .create_project(NewProject {
                        name: args.name,
                        owner_id: args.owner_id,
                        github_url: args.github_url,
                        staging_url: args.staging_url,
                    })
                    .await?;
                println!("{id}");
                Ok(())
            }
            Commands::Flow(FlowCommand::Create(args)) => {
                let id = self
                    .service
                    .create_flow(NewFlow {
                        project_id: args.project_id,
                        name: args.name,
                        description: args.description,
                        category: args.category,
                        methods: args.methods,
                    })
                    .await?;
                println!("{id}");
                Ok(())
            }
            Commands::User(UserCommand::Credential(args)) => self.credential_command(args).await,
            Commands::Help(args) => help_command(args),
            Commands::Serve(_) => {
                // Serve is handled separately in main.rs since it needs the server and scheduler.
                Err(anyhow!(
                    "Serve command should be handled by the composition root"
                ))
            }
        }
    }

    async fn run_command(&self, args: RunArgs) -> Result<()> {
        let response = self
            .service
            .request_run(RunFlowRequest {
                flow_id: args.flow_id.clone(),
                user_id: args.user_id,
                mode: RunMode::Immediate,
            })
            .await?;

        match response {
            RunResponse::Completed(result) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                if result.status == ResultStatus::Failed {
                    bail!(
                        "Flow {} failed: {}",
                        args.flow_id,
                        result.error_message.as_deref().unwrap_or("unknown error")
                    );
                }
                Ok(())
            }
            RunResponse::AlreadyRunning => bail!("Flow {} is already running", args.flow_id),
            RunResponse::Queued { job_id } => {
                println!("Queued job {job_id}");
                Ok(())
            }
        }
    }

    async fn status_command(&self, args: StatusArgs) -> Result<()> {
        let view = self
            .service
            .flow_status(&args.flow_id)
            .await?
            .ok_or_else(|| anyhow!("Flow {} not found", args.flow_id))?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&view)?);
        } else {
            print!("{}", render_status(&view));
        }
        Ok(())
    }

    async fn results_command(&self, args: ResultsArgs) -> Result<()> {
        let listing = self
            .service
            .list_results(&args.flow_id, args.page, args.limit)
            .await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        } else {
            print!("{}", render_results(&listing));
        }
        Ok(())
    }

    async fn credential_command(&self, args: CredentialArgs) -> Result<()> {
        if args.token.trim().is_empty() {
            bail!("token must not be empty");
        }
        self.service
            .link_credential(&args.user_id, args.token.trim())
            .await?;
        println!("Stored credential for {}", args.user_id);
        Ok(())
    }
}

/// Renders topic help. Needs no engine.
pub fn help_command(args: HelpArgs) -> Result<()> {
    let topic = args.topic.unwrap_or(HelpTopic::Overview);
    let section = help::build_help_section(topic);
    match args.format {
        HelpFormat::Text => help::render_help_text(&section),
        HelpFormat::Json => println!("{}", serde_json::to_string_pretty(&section)?),
    }
    Ok(())
}

fn render_status(view: &FlowStatusView) -> String {
    let mut out = format!(
        "Flow: {} ({})\nCategory: {}\nStatus: {}\n",
        view.name,
        view.id,
        view.category,
        view.status.as_str()
    );
    if let Some(last_run) = view.last_run {
        out.push_str(&format!("Last run: {last_run}\n"));
    }
    if let Some(duration) = view.duration {
        out.push_str(&format!("Duration: {duration} ms\n"));
    }
    out.push_str("Methods:\n");
    for method in &view.methods {
        out.push_str(&format!("  - {method}\n"));
    }
    out
}

fn render_results(listing: &ResultListing) -> String {
    if listing.results.is_empty() {
        return "No results recorded yet.\n".to_string();
    }
    let page = &listing.pagination;
    let mut out = format!(
        "Page {}/{} ({} results)\n",
        page.page, page.total_pages, page.total
    );
    for result in &listing.results {
        out.push_str(&render_result_line(result));
    }
    out
}

fn render_result_line(result: &TestResult) -> String {
    let mut line = format!(
        "- {} [{}] {} ms attempt {}",
        result.id,
        result.status.as_str(),
        result.duration,
        result.attempt
    );
    if let Some(error) = &result.error_message {
        line.push_str(&format!(" error={error}"));
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{Category, FlowStatus},
        ports::Pagination,
    };

    fn result(id: &str, status: ResultStatus, error: Option<&str>) -> TestResult {
        TestResult {
            id: id.into(),
            flow_id: "f1".into(),
            status,
            started_at: 0,
            ended_at: 42,
            duration: 42,
            logs: vec![],
            screenshot_urls: vec![],
            error_message: error.map(String::from),
            attempt_group: Some("g1".into()),
            attempt: 2,
        }
    }

    #[test]
    fn status_lists_methods_and_optional_timing() {
        let view = FlowStatusView {
            id: "f1".into(),
            name: "checkout".into(),
            status: FlowStatus::Failed,
            last_run: Some(1_700_000_000_000),
            duration: None,
            category: Category::Frontend,
            methods: vec!["navigate /cart".into(), "click #buy".into()],
        };
        let text = render_status(&view);
        assert!(text.starts_with("Flow: checkout (f1)\nCategory: FRONTEND\nStatus: FAILED\n"));
        assert!(text.contains("Last run: 1700000000000\n"));
        assert!(!text.contains("Duration"));
        assert!(text.ends_with("  - navigate /cart\n  - click #buy\n"));
    }

    #[test]
    fn results_render_one_line_per_attempt() {
        let listing = ResultListing {
            results: vec![
                result("r2", ResultStatus::Failed, Some("Method failed: add")),
                result("r1", ResultStatus::Success, None),
            ],
            pagination: Pagination {
                page: 1,
                limit: 10,
                total: 2,
                total_pages: 1,
            },
        };
        assert_eq!(
            render_results(&listing),
            "Page 1/1 (2 results)\n\
             - r2 [FAILED] 42 ms attempt 2 error=Method failed: add\n\
             - r1 [SUCCESS] 42 ms attempt 2\n"
        );
    }

    #[test]
    fn empty_listing_says_so() {
        let listing = ResultListing {
            results: vec![],
            pagination: Pagination {
                page: 1,
                limit: 10,
                total: 0,
                total_pages: 0,
            },
        };
        assert_eq!(render_results(&listing), "No results recorded yet.\n");
    }
}
