mod config;
mod file_node;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rollout::{Rule, RuleSnapshot, Watcher, FEATURE_PREFIX};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::RolloutConfig;
use file_node::FileCoordinator;

#[derive(Parser, Debug)]
#[command(name = "rollout")]
#[command(version)]
#[command(about = "Inspect and watch feature rollout rules", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short = 'c', long = "config", default_value = "rollout.toml", global = true)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide whether a feature is active for a user
    Eval {
        /// Path to the rules file
        #[arg(short = 'f', long = "rules", default_value = "rollout.json")]
        rules: String,

        /// Feature name without the `feature:` prefix
        feature: String,

        #[arg(allow_negative_numbers = true)]
        user_id: i64,

        /// Groups the user belongs to
        groups: Vec<String>,
    },
    /// Print the raw rollout percentage of a feature
    Percentage {
        /// Path to the rules file
        #[arg(short = 'f', long = "rules", default_value = "rollout.json")]
        rules: String,

        feature: String,
    },
    /// Check every rule in a rules file
    Validate {
        /// Path to the rules file
        #[arg(short = 'f', long = "rules", default_value = "rollout.json")]
        rules: String,
    },
    /// Watch a rules file and re-evaluate a feature on every change
    Watch {
        /// Path to the rules file (overrides config)
        #[arg(short = 'f', long = "rules", env = "ROLLOUT_PATH")]
        rules: Option<String>,

        /// Retry interval after a failed read, in milliseconds (overrides config)
        #[arg(long = "backoff-ms")]
        backoff_ms: Option<u64>,

        feature: String,

        #[arg(allow_negative_numbers = true)]
        user_id: i64,

        groups: Vec<String>,
    },
}

fn init_tracing(config: &RolloutConfig) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.filter.clone()),
    );
    if config.log.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_rules(rules_path: &str) -> RuleSnapshot {
    let content = match std::fs::read(rules_path) {
        Ok(content) => content,
        Err(_) => {
            eprintln!("{} does not exist", rules_path);
            process::exit(1);
        }
    };
    match RuleSnapshot::from_json(&content) {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Parsing failed: {}", e);
            process::exit(1);
        }
    }
}

fn run_eval(rules_path: &str, feature: &str, user_id: i64, groups: &[String]) {
    let rules = load_rules(rules_path);
    let groups: Vec<&str> = groups.iter().map(String::as_str).collect();
    println!("{}", rules.feature_active(feature, user_id, &groups));
}

fn run_percentage(rules_path: &str, feature: &str) {
    let rules = load_rules(rules_path);
    match rules.raw_percentage(feature) {
        Ok(percentage) => println!("{}", percentage),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

/// Describes what is wrong with one stored rule, if anything.
fn rule_problem(key: &str, value: &str) -> Option<String> {
    if !key.starts_with(FEATURE_PREFIX) {
        return Some(format!("key does not start with '{}'", FEATURE_PREFIX));
    }
    let Some(rule) = Rule::parse(value) else {
        return Some(format!("expected <percentage>|<ids>|<groups>, got '{}'", value));
    };
    if rule.has_group(rollout::rule::ALL_GROUPS) {
        return None;
    }
    match rule.percentage() {
        Ok(p) if !(0.0..=100.0).contains(&p) => Some(format!("percentage {} out of 0-100", p)),
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    }
}

fn run_validate(rules_path: &str) {
    let rules = load_rules(rules_path);
    let mut entries: Vec<(&str, &str)> = rules.iter().collect();
    entries.sort();

    let mut invalid = 0;
    for (key, value) in &entries {
        match rule_problem(key, value) {
            Some(problem) => {
                println!("  {} = {:?} - {}", key, value, problem);
                invalid += 1;
            }
            None => println!("  {} = {:?}", key, value),
        }
    }

    println!();
    println!(
        "{}: {} rules, {} invalid",
        rules_path,
        entries.len(),
        invalid
    );
    if invalid > 0 {
        process::exit(1);
    }
}

async fn run_watch(
    config: &RolloutConfig,
    feature: String,
    user_id: i64,
    groups: Vec<String>,
) {
    let path = config.watch.path.clone();
    let watcher = Watcher::builder(Arc::new(FileCoordinator), &path)
        .backoff(Duration::from_millis(config.watch.backoff_ms))
        .on_update(move |rules| {
            let groups: Vec<&str> = groups.iter().map(String::as_str).collect();
            println!(
                "{} {} = {} ({} rules, sha1 {})",
                chrono::Utc::now().to_rfc3339(),
                feature,
                rules.feature_active(&feature, user_id, &groups),
                rules.len(),
                rules.digest()
            );
        })
        .build();

    if let Err(e) = watcher.start().await {
        eprintln!("Failed to watch {}: {}", path, e);
        process::exit(1);
    }
    println!("Watching {} for changes", path);

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to listen for ctrl-c: {}", e);
    }
    watcher.stop().await;
}

#[tokio::main]
async fn main() {
    let cli = Args::parse();
    let mut config = RolloutConfig::load(&cli.config);
    config.apply_env_overrides();
    init_tracing(&config);

    match cli.cmd {
        Command::Eval {
            rules,
            feature,
            user_id,
            groups,
        } => run_eval(&rules, &feature, user_id, &groups),
        Command::Percentage { rules, feature } => run_percentage(&rules, &feature),
        Command::Validate { rules } => run_validate(&rules),
        Command::Watch {
            rules,
            backoff_ms,
            feature,
            user_id,
            groups,
        } => {
            if let Some(rules) = rules {
                config.watch.path = rules;
            }
            if let Some(ms) = backoff_ms {
                config.watch.backoff_ms = ms;
            }
            run_watch(&config, feature, user_id, groups).await
        }
    }
}
