use std::{collections::BTreeMap, path::Path, process};

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use keel::{Result, TaskConfiguration, cli::Cli, load_tasks, run};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    match run_keel(&args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "keel=debug" } else { "keel=warn" };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_keel(args: &Cli) -> Result<bool> {
    let config = load_tasks(Path::new(&args.file))?;

    if args.list {
        list_tasks(&config);
        return Ok(true);
    }

    let request = args.build_request();
    let report = run(&config, &request).await?;
    if request.dry_run {
        return Ok(true);
    }

    let failed = report.failed();
    println!();
    if report.success() {
        println!("BUILD SUCCESSFUL");
    } else {
        println!("BUILD FAILED");
    }
    for task in failed {
        if let keel::TaskState::Failed(reason) = &task.state {
            let role = if task.wired { "" } else { " (not on a target's dependency path)" };
            println!("  {}{}: {}", task.path, role, reason);
        }
    }
    for task in &report.tasks {
        for warning in &task.warnings {
            println!("  warning {}: {}", task.path, warning);
        }
    }
    println!("{} actionable task(s): {} executed", report.tasks.len(), report.executed().len());

    Ok(report.success())
}

fn list_tasks(config: &TaskConfiguration) {
    let mut modules: BTreeMap<&str, Vec<_>> = BTreeMap::new();
    for task in &config.tasks {
        modules.entry(task.path.module().unwrap_or("")).or_default().push(task);
    }

    for (module, tasks) in modules {
        if module.is_empty() {
            println!("Root tasks");
        } else {
            println!("Module :{}", module);
        }
        for task in tasks {
            let group = task
                .group
                .as_deref()
                .map(|g| format!(" [{}]", g))
                .unwrap_or_default();
            match &task.description {
                Some(description) => println!("  {}{} - {}", task.path, group, description),
                None => println!("  {}{}", task.path, group),
            }
        }
    }
}
