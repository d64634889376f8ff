//! Kernel Playground CLI
//!
//! Loads a playground page headlessly, runs its widgets against the
//! simulated compute device and prints what the page would show.

use anyhow::Context;
use clap::{Parser, Subcommand};
use kernel_playground::gpu::ComputeHost;
use kernel_playground::page::{Page, PageConfig};
use kernel_playground::registry::TestRegistry;
use kernel_playground::{smoke, VERSION};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use tracing::info;

#[derive(Parser)]
#[command(name = "kernel-playground")]
#[command(author, version, about = "Interactive playground for GPU compute kernel smoke tests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered tests
    List,

    /// Load a page, click every run button and report the outcome
    Run {
        /// Tests to place on the page (defaults to the page file, or every test)
        tests: Vec<String>,
        /// Page configuration file (JSON)
        #[arg(short, long, value_name = "FILE")]
        page: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Hide the compute API from the tests
        #[arg(long)]
        no_compute: bool,
    },

    /// Print the page markup
    Render {
        /// Page configuration file (JSON)
        #[arg(short, long, value_name = "FILE")]
        page: Option<PathBuf>,
        /// Run every widget before rendering
        #[arg(long)]
        run: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::List => list_tests(),
        Commands::Run {
            tests,
            page,
            json,
            no_compute,
        } => run_page(tests, page.as_deref(), json, no_compute),
        Commands::Render { page, run } => render_page(page.as_deref(), run),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(page: Option<&Path>) -> anyhow::Result<PageConfig> {
    match page {
        Some(path) => PageConfig::from_file(path)
            .with_context(|| format!("failed to load page config {}", path.display())),
        None => Ok(PageConfig::default()),
    }
}

fn registry_for(host: &ComputeHost) -> Rc<TestRegistry> {
    let registry = Rc::new(TestRegistry::new());
    smoke::register_all(&registry, host);
    registry
}

fn list_tests() -> anyhow::Result<ExitCode> {
    for id in registry_for(&ComputeHost::simulated()).ids() {
        println!("{}", id);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_page(
    tests: Vec<String>,
    page: Option<&Path>,
    json: bool,
    no_compute: bool,
) -> anyhow::Result<ExitCode> {
    let mut config = load_config(page)?;
    if !tests.is_empty() {
        let selected = PageConfig::for_tests(tests);
        config.playgrounds = selected.playgrounds;
    }

    let host = if no_compute {
        ComputeHost::unsupported()
    } else {
        ComputeHost::with_limits(config.limits.clone())
    };
    info!(version = VERSION, widgets = config.playgrounds.len(), "loading page");

    let mut page = Page::from_config(&config, registry_for(&host)).context("failed to load page")?;
    page.run_all();
    let report = page.report();

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
    }

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn render_page(page: Option<&Path>, run: bool) -> anyhow::Result<ExitCode> {
    let config = load_config(page)?;
    let host = ComputeHost::with_limits(config.limits.clone());
    let mut page = Page::from_config(&config, registry_for(&host)).context("failed to load page")?;
    if run {
        page.run_all();
    }
    print!("{}", page.document().to_html());
    Ok(ExitCode::SUCCESS)
}
