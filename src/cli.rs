use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::core::domain::Category;

/// flowbench CLI definition.
#[derive(Debug, Parser)]
#[command(name = "flowbench")]
#[command(about = "Sandboxed test-flow execution engine", version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "flowbench.yaml",
        help = "Path to the engine configuration file"
    )]
    pub config: PathBuf,

    #[arg(long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON on stdout")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server, job queue and scheduler.
    Serve(ServeArgs),
    /// Execute a flow immediately and print its result.
    Run(RunArgs),
    /// Show a flow's current lifecycle state.
    Status(StatusArgs),
    /// List a flow's stored results, newest first.
    Results(ResultsArgs),
    /// Seed project records.
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Seed flow records.
    #[command(subcommand)]
    Flow(FlowCommand),
    /// Manage user credentials.
    #[command(subcommand)]
    User(UserCommand),
    /// Show topic-based help (text or JSON).
    Help(HelpArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct ServeArgs {
    #[arg(long, help = "Bind address, overrides server.bind")]
    pub bind: Option<String>,

    #[arg(long, help = "Force the scheduler on regardless of configuration")]
    pub scheduler: bool,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[arg(long, help = "Flow identifier")]
    pub flow_id: String,

    #[arg(long, help = "Whose credential to use (defaults to the project owner)")]
    pub user_id: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    #[arg(long, help = "Flow identifier")]
    pub flow_id: String,

    #[arg(long, help = "Emit machine-readable JSON")]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ResultsArgs {
    #[arg(long, help = "Flow identifier")]
    pub flow_id: String,

    #[arg(long, default_value_t = 1, help = "1-based page number")]
    pub page: usize,

    #[arg(long, default_value_t = 10, help = "Results per page")]
    pub limit: usize,

    #[arg(long, help = "Emit machine-readable JSON")]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommand {
    /// Register a project and print its id.
    Create(ProjectCreateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ProjectCreateArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long, help = "User owning the project")]
    pub owner_id: String,

    #[arg(long, help = "https://github.com/<owner>/<repo>")]
    pub github_url: Option<String>,

    #[arg(long, help = "Deployed environment used by performance tests")]
    pub staging_url: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum FlowCommand {
    /// Register a flow and print its id.
    Create(FlowCreateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct FlowCreateArgs {
    #[arg(long)]
    pub project_id: String,

    #[arg(long)]
    pub name: String,

    #[arg(long, default_value = "")]
    pub description: String,

    #[arg(long, value_parser = parse_category, help = "BACKEND, FRONTEND, PERFORMANCE or UNIT")]
    pub category: Category,

    #[arg(long = "method", required = true, help = "Test method, repeat for several")]
    pub methods: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    /// Store a source-hosting access token for a user.
    Credential(CredentialArgs),
}

#[derive(Debug, Args, Clone)]
pub struct CredentialArgs {
    #[arg(long)]
    pub user_id: String,

    #[arg(long, env = "FLOWBENCH_TOKEN", hide_env_values = true)]
    pub token: String,
}

#[derive(Debug, Args, Clone)]
pub struct HelpArgs {
    #[arg(value_enum, help = "Topic to describe")]
    pub topic: Option<HelpTopic>,

    #[arg(long, value_enum, default_value_t = HelpFormat::Text)]
    pub format: HelpFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "lower")]
pub enum HelpTopic {
    Overview,
    Run,
    Serve,
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "lower")]
pub enum HelpFormat {
    Text,
    Json,
}

fn parse_category(value: &str) -> Result<Category, String> {
    value.parse::<Category>().map_err(|err| err.to_string())
}
