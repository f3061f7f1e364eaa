//! Help rendering for CLI topics.

use serde::Serialize;

use crate::cli::HelpTopic;

#[derive(Debug, Clone, Serialize)]
pub struct HelpSection {
    pub topic: &'static str,
    pub summary: &'static str,
    pub usage_examples: Vec<&'static str>,
    pub key_flags: Vec<FlagHelp>,
    pub notes: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlagHelp {
    pub flag: &'static str,
    pub description: &'static str,
}

pub fn render_help_text(section: &HelpSection) {
    println!("Topic: {}", section.topic);
    println!("Summary: {}", section.summary);
    if !section.usage_examples.is_empty() {
        println!();
        println!("Usage examples:");
        for example in &section.usage_examples {
            println!("  {example}");
        }
    }
    if !section.key_flags.is_empty() {
        println!();
        println!("Key flags:");
        for flag in &section.key_flags {
            println!("  {:<24}{}", flag.flag, flag.description);
        }
    }
    if !section.notes.is_empty() {
        println!();
        println!("Notes:");
        for note in &section.notes {
            println!("  - {note}");
        }
    }
    println!();
    println!("Tip: every subcommand also supports the standard `--help` output.");
}

fn flag(flag: &'static str, description: &'static str) -> FlagHelp {
    FlagHelp { flag, description }
}

pub fn build_help_section(topic: HelpTopic) -> HelpSection {
    match topic {
        HelpTopic::Overview => HelpSection {
            topic: "overview",
            summary: "flowbench executes test flows (ordered method lists) inside sandboxed containers, records every attempt as a result, and streams lifecycle changes to observers.",
            usage_examples: vec![
                r#"flowbench project create --name shop --owner-id u1 --github-url https://github.com/acme/shop"#,
                r#"flowbench flow create --project-id <id> --name api --category backend --method "GET /health""#,
                "flowbench run --flow-id <id>",
                "flowbench serve --bind 0.0.0.0:3001",
            ],
            key_flags: vec![
                flag("serve", "Expose flows over HTTP (REST + SSE) with the job queue attached."),
                flag("run", "Execute one flow in the foreground and print the result."),
                flag("status", "Show a flow's lifecycle state."),
                flag("results", "Page through stored results, newest first."),
                flag("project/flow/user", "Seed records and credentials."),
            ],
            notes: vec![
                "State lives under $FLOWBENCH_HOME/.flowbench (or $HOME/.flowbench).",
                "Use `flowbench help <topic>` for run, serve or config details.",
            ],
        },
        HelpTopic::Run => HelpSection {
            topic: "run",
            summary: "Runs a flow immediately in this process. Exits non-zero when the run fails or the flow is already running.",
            usage_examples: vec![
                "flowbench run --flow-id 3f2c...",
                "flowbench run --flow-id 3f2c... --user-id alice",
            ],
            key_flags: vec![
                flag("--flow-id <ID>", "Flow to execute."),
                flag("--user-id <ID>", "Whose stored token authenticates the checkout."),
            ],
            notes: vec![
                "Repository categories (BACKEND, FRONTEND, UNIT) need a project github URL.",
                "PERFORMANCE needs a project staging URL.",
                "The printed result carries every captured log line; stderr lines start with `STDERR: `.",
            ],
        },
        HelpTopic::Serve => HelpSection {
            topic: "serve",
            summary: "Starts the HTTP API, the job queue workers and (when enabled) the scheduler. Ctrl-C drains in-flight jobs before exiting.",
            usage_examples: vec![
                "flowbench serve",
                "flowbench serve --bind 127.0.0.1:4000 --scheduler",
                "curl -X POST localhost:3001/flows/<id>/run -H 'x-user-id: alice'",
                "curl -N localhost:3001/flows/<id>/events",
            ],
            key_flags: vec![
                flag("--bind <ADDR>", "Override server.bind from the config file."),
                flag("--scheduler", "Enable periodic sweeps regardless of config."),
            ],
            notes: vec![
                "POST /flows/{id}/run queues a job; add ?sync=true to wait for the result.",
                "GET /flows/{id}/events streams `flowStatus` server-sent events.",
                "GET /flows/queue/stats reports waiting, active, completed and failed jobs.",
            ],
        },
        HelpTopic::Config => HelpSection {
            topic: "config",
            summary: "flowbench.yaml tunes the sandbox, queue, scheduler, retention and fallback command chains. Missing sections use built-in defaults.",
            usage_examples: vec!["flowbench --config ./flowbench.yaml serve"],
            key_flags: vec![
                flag("sandbox.kind", "docker (default) or host."),
                flag("queue.concurrency", "Parallel jobs (default 3)."),
                flag("queue.attempts", "Attempts per job (default 3)."),
                flag("scheduler.enabled", "Turn periodic sweeps on."),
                flag("strategies.<category>", "Ordered command templates, `{method}` is substituted."),
            ],
            notes: vec![
                "RUST_LOG overrides the console log filter.",
                "Debug logs are also written as JSON under the data directory's logs/ folder when serving.",
            ],
        },
    }
}
