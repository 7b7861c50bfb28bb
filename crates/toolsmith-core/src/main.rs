//! `toolsmith` command-line interface

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use toolsmith_artifact::PromptHash;
use toolsmith_build::CompatibilityGate;
use toolsmith_core::{Orchestrator, ToolRequest, ToolsmithConfig};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("toolsmith")
        .version(toolsmith_core::VERSION)
        .about("Generate, cache and run small sandboxed tools from plain-language descriptions")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .subcommand(
            Command::new("run")
                .about("Build (or reuse) a tool and run it")
                .arg(
                    Arg::new("prompt")
                        .long("prompt")
                        .required(true)
                        .help("Tool description"),
                )
                .arg(
                    Arg::new("input")
                        .long("input")
                        .default_value("")
                        .help("Runtime input passed to the tool"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Discard any cached build and regenerate"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the full response as JSON"),
                ),
        )
        .subcommand(
            Command::new("hash")
                .about("Print the cache key for a prompt")
                .arg(Arg::new("prompt").required(true)),
        )
        .subcommand(
            Command::new("check")
                .about("Check packages against the compatibility knowledge base")
                .arg(
                    Arg::new("packages")
                        .required(true)
                        .num_args(1..)
                        .help("Package names or import specifiers"),
                ),
        )
        .subcommand(
            Command::new("cache")
                .about("Manage the build cache")
                .subcommand_required(true)
                .subcommand(
                    Command::new("delete")
                        .about("Delete one cached tool")
                        .arg(Arg::new("hash").required(true).help("64-character tool hash")),
                )
                .subcommand(Command::new("clear").about("Delete every cached tool")),
        )
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<ToolsmithConfig> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ToolsmithConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ToolsmithConfig::default(),
    };
    let config = config.apply_env();
    config.validate()?;
    Ok(config)
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches.get_one::<String>(name).map_or("", String::as_str)
}

async fn run_tool(config: &ToolsmithConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let orchestrator = Orchestrator::from_config(config)?;
    let mut request = ToolRequest::new(arg(args, "prompt")).with_input(arg(args, "input"));
    if args.get_flag("force") {
        request = request.force();
    }
    let json = args.get_flag("json");
    let hash = PromptHash::of_prompt(&request.prompt);

    match orchestrator.run(request).await {
        Ok(response) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                for warning in &response.warnings {
                    eprintln!("warning: {warning}");
                }
                println!("{}", response.output);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let error = e.to_response(Some(&hash));
            if json {
                println!("{}", serde_json::to_string_pretty(&error)?);
            } else {
                eprintln!("error [{}]: {}", error.kind, error.error);
                if let Some(stack) = error.details.as_ref().and_then(|d| d.stack.as_deref()) {
                    eprintln!("{stack}");
                }
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn check_packages(config: &ToolsmithConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let gate = CompatibilityGate::new(config.build_knowledge_base()?);
    let packages: Vec<String> = args
        .get_many::<String>("packages")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let report = gate.check(&packages);
    for name in &report.compatible {
        println!("ok      {name}");
    }
    for package in &report.incompatible {
        match &package.alternative {
            Some(alt) => println!("refused {}: {} (try {alt})", package.name, package.reason),
            None => println!("refused {}: {}", package.name, package.reason),
        }
    }
    for warning in report.warnings.iter().filter(|w| w.ends_with("compatibility unknown")) {
        eprintln!("warning: {warning}");
    }

    Ok(if report.is_compatible() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run() -> anyhow::Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(arg(&matches, "log-format"));

    match matches.subcommand() {
        Some(("run", args)) => run_tool(&load_config(&matches)?, args).await,
        Some(("hash", args)) => {
            println!("{}", PromptHash::of_prompt(arg(args, "prompt")));
            Ok(ExitCode::SUCCESS)
        }
        Some(("check", args)) => check_packages(&load_config(&matches)?, args),
        Some(("cache", args)) => {
            let orchestrator = Orchestrator::from_config(&load_config(&matches)?)?;
            let message = match args.subcommand() {
                Some(("delete", sub)) => {
                    let hash: PromptHash = arg(sub, "hash")
                        .parse()
                        .context("tool hash must be 64 hex characters")?;
                    orchestrator.delete_tool(&hash).await?
                }
                Some(("clear", _)) => orchestrator.clear_cache().await?,
                _ => anyhow::bail!("unknown cache command"),
            };
            println!("{message}");
            Ok(ExitCode::SUCCESS)
        }
        _ => anyhow::bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", toolsmith_core::redact(&format!("{e:#}")));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn parses_run_with_global_options() {
        let matches = cli()
            .try_get_matches_from([
                "toolsmith", "run", "--prompt", "uuid", "--force", "--log-format", "json",
            ])
            .unwrap();
        assert_eq!(arg(&matches, "log-format"), "json");
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(arg(args, "prompt"), "uuid");
        assert_eq!(arg(args, "input"), "");
        assert!(args.get_flag("force"));
        assert!(!args.get_flag("json"));
    }

    #[test]
    fn cache_requires_a_subcommand() {
        assert!(cli().try_get_matches_from(["toolsmith", "cache"]).is_err());
        assert!(cli()
            .try_get_matches_from(["toolsmith", "cache", "delete", "ab"])
            .is_ok());
    }
}
