//! JMC CLI - file issues and read replies from a JIRA Connect project
//!
//! Wraps the client library for scripting and for poking at a tracker from
//! the terminal.

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use jmc::{
    Attachment, CustomDataSource, IssueType, IssueUpdates, Jmc, JmcConfig, JmcEvent, StoredComment,
    StoredIssue,
};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA_DIR: &str = ".jmc";
const CRASH_SUBDIR: &str = "crashes";

#[derive(Parser)]
#[command(name = "jmc")]
#[command(about = "File issues and crash reports into a JIRA Connect project")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "JMC_CONFIG")]
    config: Option<PathBuf>,

    /// Tracker base URL
    #[arg(long, global = true, env = "JMC_URL")]
    url: Option<String>,

    /// Project key
    #[arg(short, long, global = true, env = "JMC_PROJECT")]
    project: Option<String>,

    /// Application name reported with issues
    #[arg(long, global = true, env = "JMC_APP_NAME")]
    app_name: Option<String>,

    /// Directory for the inbox database, install id and crash queue
    #[arg(long, global = true, env = "JMC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format: pretty, json, or raw
    #[arg(short, long, global = true, default_value = "pretty")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an issue
    Create {
        /// Issue description
        #[arg(short, long)]
        description: String,

        /// Issue type: feedback or crash
        #[arg(short = 't', long = "type", default_value = "feedback")]
        issue_type: IssueType,

        /// Files to attach (images and audio are detected by extension)
        #[arg(short, long)]
        attach: Vec<PathBuf>,

        /// Custom field as KEY=VALUE
        #[arg(long = "field", value_parser = parse_key_val)]
        fields: Vec<(String, String)>,

        /// Payload entry as KEY=VALUE
        #[arg(long = "payload", value_parser = parse_key_val)]
        payload: Vec<(String, String)>,
    },

    /// Add a comment to an issue
    Comment {
        /// Issue key, e.g. APP-12
        key: String,

        /// Comment text
        text: String,
    },

    /// Fetch raw updates since a point in time
    Updates {
        /// Milliseconds since the Unix epoch
        #[arg(long, default_value = "0")]
        since: i64,
    },

    /// Poll once, store replies in the inbox and show what is new
    Ping,

    /// Send queued crash logs
    SendCrashes,

    /// Queue a crash log for the next send
    QueueCrash {
        /// File containing the log (or - for stdin)
        #[arg(short, long, default_value = "-")]
        input: String,
    },

    /// List issues in the local inbox
    Issues {
        /// Show one issue with its comments
        #[arg(long)]
        open: Option<String>,

        /// Maximum issues to list
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Poll for replies until interrupted
    Watch {
        /// Seconds between polls
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
    Raw,
}

/// Custom fields and payload given on the command line.
#[derive(Default)]
struct CliFields {
    custom_fields: BTreeMap<String, String>,
    payload: BTreeMap<String, String>,
}

impl CustomDataSource for CliFields {
    fn custom_fields(&self) -> BTreeMap<String, String> {
        self.custom_fields.clone()
    }

    fn payload(&self) -> BTreeMap<String, String> {
        self.payload.clone()
    }
}

fn parse_key_val(input: &str) -> Result<(String, String), String> {
    input
        .split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{input}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jmc=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    let format = cli.format.clone();

    match cli.command {
        Commands::Create {
            description,
            issue_type,
            attach,
            fields,
            payload,
        } => {
            let source = CliFields {
                custom_fields: fields.into_iter().collect(),
                payload: payload.into_iter().collect(),
            };
            let jmc = Jmc::configure(config, Some(Arc::new(source)))?;
            create(&jmc, description, issue_type, &attach, format).await?;
        }
        Commands::Comment { key, text } => {
            let jmc = Jmc::configure(config, None)?;
            let response = jmc.issue_inbox().reply(&key, &text).await?;
            match format {
                OutputFormat::Pretty => println!("{} Comment added to {}", "✓".green(), key.cyan()),
                OutputFormat::Json | OutputFormat::Raw => println!("{response}"),
            }
        }
        Commands::Updates { since } => {
            let jmc = Jmc::configure(config, None)?;
            updates(&jmc, since, format).await?;
        }
        Commands::Ping => {
            let jmc = Jmc::configure(config, None)?;
            let notification = jmc.notifier().poll_once().await?;
            match format {
                OutputFormat::Pretty => match notification {
                    Some(n) => println!("{} {}", "▸".green().bold(), n.message),
                    None => println!("{} No new replies", "✓".green()),
                },
                OutputFormat::Json | OutputFormat::Raw => {
                    let output = notification.map(|n| {
                        serde_json::json!({
                            "message": n.message,
                            "issueKeys": n.issue_keys,
                            "commentCount": n.comment_count,
                        })
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
        Commands::SendCrashes => {
            let jmc = Jmc::configure(config, None)?;
            let summary = jmc.send_crash_reports().await?;
            match format {
                OutputFormat::Pretty => {
                    println!("{} {} crash reports sent", "✓".green(), summary.sent.len());
                    for (path, err) in &summary.failed {
                        eprintln!("{} {}: {}", "✗".red(), path.display(), err);
                    }
                }
                OutputFormat::Json | OutputFormat::Raw => {
                    let failed: Vec<_> = summary
                        .failed
                        .iter()
                        .map(|(path, err)| {
                            serde_json::json!({ "path": path.display().to_string(), "error": err.to_string() })
                        })
                        .collect();
                    let output = serde_json::json!({ "sent": summary.sent, "failed": failed });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
        Commands::QueueCrash { input } => {
            let log = read_input(&input)?;
            let jmc = Jmc::configure(config, None)?;
            let path = jmc.queue_crash(&log)?;
            match format {
                OutputFormat::Pretty => println!("{} Queued {}", "✓".green(), path.display()),
                OutputFormat::Json | OutputFormat::Raw => println!("{}", path.display()),
            }
        }
        Commands::Issues { open, limit } => {
            let jmc = Jmc::configure(config, None)?;
            match open {
                Some(key) => show_issue(&jmc, &key, format).await?,
                None => list_issues(&jmc, limit, format).await?,
            }
        }
        Commands::Watch { interval } => {
            if let Some(secs) = interval {
                config.poll_interval_secs = secs;
            }
            let jmc = Jmc::configure(config, None)?;
            watch(&jmc, format).await?;
        }
    }

    Ok(())
}

/// File configuration first, then command-line overrides.
fn load_config(cli: &Cli) -> Result<JmcConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => JmcConfig::from_file(path)?,
        None => JmcConfig::default(),
    };

    if let Some(url) = &cli.url {
        config.base_url = url.clone();
    }
    if let Some(project) = &cli.project {
        config.project = project.clone();
    }
    if let Some(app_name) = &cli.app_name {
        config.app_name = app_name.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }

    let data_dir = config
        .data_dir
        .get_or_insert_with(|| PathBuf::from(DEFAULT_DATA_DIR))
        .clone();
    config.crash_dir.get_or_insert_with(|| data_dir.join(CRASH_SUBDIR));

    Ok(config)
}

fn read_input(input: &str) -> Result<String, Box<dyn std::error::Error>> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(input)?)
    }
}

async fn create(
    jmc: &Jmc,
    description: String,
    issue_type: IssueType,
    attach: &[PathBuf],
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut composer = jmc.issue_composer();
    composer.set_issue_type(issue_type);
    composer.set_description(description);
    for path in attach {
        composer.attach(Attachment::from_path(path)?)?;
    }

    let submitted = match composer.submit().await {
        Ok(submitted) => submitted,
        Err(err) => {
            eprintln!("{} {}", "error".red(), composer.error_message(&err));
            return Err(err.into());
        }
    };

    match format {
        OutputFormat::Pretty => match &submitted.issue {
            Some(issue) => {
                println!("{} Created {}", "✓".green(), issue.key.cyan().bold());
                if let Some(status) = &issue.status {
                    println!("  {} {}", "Status:".cyan(), status);
                }
            }
            None => println!("{} Created: {}", "✓".green(), submitted.response),
        },
        OutputFormat::Json => match &submitted.issue {
            Some(issue) => println!("{}", serde_json::to_string_pretty(issue)?),
            None => println!("{}", submitted.response),
        },
        OutputFormat::Raw => println!("{}", submitted.response),
    }
    Ok(())
}

async fn updates(jmc: &Jmc, since: i64, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let params = BTreeMap::from([
        ("project".to_string(), jmc.project().to_string()),
        ("uuid".to_string(), jmc.uuid()),
        ("sinceMillis".to_string(), since.to_string()),
    ]);
    let body = jmc.transport().fetch_notifications(&params).await?;

    match format {
        OutputFormat::Raw => println!("{body}"),
        OutputFormat::Json => {
            let value: serde_json::Value = if body.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&body)?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Pretty => {
            let updates = IssueUpdates::parse(&body)?;
            if updates.issues_with_comments.is_empty() {
                println!("{} No updates", "✓".green());
            }
            for issue in &updates.issues_with_comments {
                println!("{}", "━".repeat(60).dimmed());
                println!(
                    "{} {}",
                    issue.key.cyan().bold(),
                    issue.summary.as_deref().unwrap_or("").bold()
                );
                for comment in &issue.comments {
                    println!(
                        "  {} {}: {}",
                        format_millis(comment.date).dimmed(),
                        comment.username.yellow(),
                        comment.text
                    );
                }
            }
        }
    }
    Ok(())
}

async fn list_issues(jmc: &Jmc, limit: usize, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let inbox = jmc.issue_inbox();
    let issues = inbox.issues(limit).await?;

    match format {
        OutputFormat::Json | OutputFormat::Raw => println!("{}", serde_json::to_string_pretty(&issues)?),
        OutputFormat::Pretty => {
            println!("{}", "━".repeat(60).dimmed());
            println!("{}  {}", inbox.title().green().bold(), inbox.status_line().await?.dimmed());
            println!("{}", "━".repeat(60).dimmed());
            for issue in &issues {
                print_issue_line(issue);
            }
        }
    }
    Ok(())
}

async fn show_issue(jmc: &Jmc, key: &str, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let Some(thread) = jmc.issue_inbox().open(key).await? else {
        eprintln!("{} {} is not in the local inbox", "error".red(), key);
        return Ok(());
    };

    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            let output = serde_json::json!({ "issue": thread.issue, "comments": thread.comments });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Pretty => {
            println!("{}", "━".repeat(60).dimmed());
            print_issue_line(&thread.issue);
            println!("{}", "━".repeat(60).dimmed());
            if let Some(description) = &thread.issue.description {
                println!("{description}");
                println!();
            }
            for comment in &thread.comments {
                print_comment(comment);
            }
        }
    }
    Ok(())
}

fn print_issue_line(issue: &StoredIssue) {
    let marker = if issue.has_updates { "●".yellow() } else { " ".normal() };
    println!(
        "{} {} {} {}",
        marker,
        issue.key.cyan(),
        issue.status.as_deref().unwrap_or("-").dimmed(),
        issue.summary.as_deref().unwrap_or("")
    );
}

fn print_comment(comment: &StoredComment) {
    let author = if comment.system_user {
        comment.author.yellow().bold()
    } else {
        comment.author.normal()
    };
    println!("{} {}", format_millis(comment.date).dimmed(), author);
    for line in comment.body.lines() {
        println!("  {line}");
    }
}

async fn watch(jmc: &Jmc, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = jmc.events().subscribe();
    jmc.start();

    println!(
        "{} Watching {} every {}s (Ctrl-C to stop)",
        "▸".green().bold(),
        jmc.project().cyan(),
        jmc.configuration().poll_interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event, &format)?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("{} skipped {} events", "warn".yellow(), skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    jmc.shutdown();
    Ok(())
}

fn print_event(event: &JmcEvent, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Pretty => match event {
            JmcEvent::CommentsReceived { message, .. } => println!("{} {}", "▸".green().bold(), message),
            JmcEvent::LastSuccessfulPing { at } => {
                println!("{} ping at {}", "✓".green(), at.format("%H:%M:%S").to_string().dimmed())
            }
            JmcEvent::NewIssueCreated { issue_key, .. } => {
                println!("{} created {}", "✓".green(), issue_key.as_deref().unwrap_or("-").cyan())
            }
        },
        OutputFormat::Json | OutputFormat::Raw => {
            let detail = match event {
                JmcEvent::CommentsReceived {
                    message,
                    issue_keys,
                    comment_count,
                } => serde_json::json!({
                    "message": message,
                    "issueKeys": issue_keys,
                    "commentCount": comment_count,
                }),
                JmcEvent::LastSuccessfulPing { at } => serde_json::json!({ "at": at.to_rfc3339() }),
                JmcEvent::NewIssueCreated { issue_key, response } => {
                    serde_json::json!({ "issueKey": issue_key, "response": response })
                }
            };
            let output = serde_json::json!({ "name": event.name(), "detail": detail });
            println!("{}", serde_json::to_string(&output)?);
        }
    }
    Ok(())
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}
