mod client;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use serde_json::json;

use outpost_core::config;
use outpost_core::config::Config;
use outpost_core::context::RunContext;
use outpost_core::token;
use outpost_core::tools;
use outpost_server::ServeOptions;

use crate::client::WireClient;

/// Outpost: a sandboxed local agent daemon.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Cli {
    /// Path to the config file (default: `<home>/config.yaml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start the daemon.
    Serve(ServeArgs),

    /// Talk to a running daemon over its WebSocket.
    Client(ClientArgs),

    /// Dispatch a tool locally, short-circuiting the wire.
    Tool(ToolArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Workspace to serve (default: the config's defaultWorkspace).
    #[arg(long)]
    workspace: Option<String>,

    /// Override the configured listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Rotate the stored auth token before serving.
    #[arg(long, default_value_t = false)]
    new_token: bool,

    /// Print the auth token and exit.
    #[arg(long, default_value_t = false)]
    show_token: bool,
}

#[derive(Debug, Parser)]
struct ClientArgs {
    /// Daemon URL (default: derived from the config's server section).
    #[arg(long)]
    url: Option<String>,

    /// Auth token (default: read from `<home>/token`).
    #[arg(long)]
    token: Option<String>,

    #[clap(subcommand)]
    command: ClientCommand,
}

#[derive(Debug, clap::Subcommand)]
enum ClientCommand {
    /// Invoke one tool and print its result.
    Call {
        /// Tool name, e.g. `fs.read`.
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Round-trip a ping.
    Ping,

    /// Inspect or resolve pending approvals.
    Approvals {
        #[clap(subcommand)]
        command: ApprovalsCommand,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ApprovalsCommand {
    /// List pending approvals.
    List,

    /// Approve (or deny) a pending approval.
    Resolve {
        id: String,

        #[arg(long, default_value_t = false)]
        deny: bool,
    },
}

#[derive(Debug, Parser)]
struct ToolArgs {
    #[clap(subcommand)]
    command: ToolCommand,
}

#[derive(Debug, clap::Subcommand)]
enum ToolCommand {
    /// Run a tool against a workspace in-process.
    Call {
        /// Tool name, e.g. `fs.list`.
        tool: String,

        /// Tool arguments as a JSON object.
        json: String,

        /// Workspace to run against.
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let home = config::outpost_home()?;
    let config_file = cli
        .config
        .clone()
        .unwrap_or_else(|| config::config_path(&home));

    match cli.command {
        Command::Serve(args) => serve(args, &home, &config_file).await,
        Command::Client(args) => client(args, &home, &config_file).await,
        Command::Tool(args) => tool(args, &home, &config_file).await,
    }
}

async fn serve(args: ServeArgs, home: &std::path::Path, config_file: &std::path::Path) -> anyhow::Result<()> {
    let token = if args.new_token {
        token::rotate(home)?
    } else {
        token::load_or_create(home)?
    };
    if args.show_token {
        println!("{token}");
        return Ok(());
    }

    let config = Arc::new(Config::load(config_file)?);
    outpost_server::init_logging(&config.logging);
    let workspace = config.workspace(args.workspace.as_deref())?;
    tracing::info!(
        "serving workspace `{}` at tier {} from {}",
        workspace.name,
        workspace.tier,
        workspace.root.display()
    );

    outpost_server::serve(ServeOptions {
        config,
        workspace,
        token,
        home: home.to_path_buf(),
        host: args.host,
        port: args.port,
    })
    .await
}

async fn client(args: ClientArgs, home: &std::path::Path, config_file: &std::path::Path) -> anyhow::Result<()> {
    let url = match &args.url {
        Some(url) => url.clone(),
        None => {
            let config = Config::load(config_file)?;
            format!(
                "ws://{}:{}/ws",
                config.server.host, config.server.port
            )
        }
    };
    let token = match args.token {
        Some(token) => token,
        None => token::load_or_create(home)?,
    };

    let (mut wire, _hello) = WireClient::connect(&url, &token).await?;
    let payload = match args.command {
        ClientCommand::Call { tool, args } => {
            let args: Value = serde_json::from_str(&args).context("parsing --args as JSON")?;
            wire.call("tools.call", json!({ "tool": tool, "args": args }))
                .await?
        }
        ClientCommand::Ping => wire.call("ping", json!({})).await?,
        ClientCommand::Approvals { command } => match command {
            ApprovalsCommand::List => wire.call("approvals.list", json!({})).await?,
            ApprovalsCommand::Resolve { id, deny } => {
                wire.call("approvals.resolve", json!({ "id": id, "approve": !deny }))
                    .await?
            }
        },
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn tool(args: ToolArgs, home: &std::path::Path, config_file: &std::path::Path) -> anyhow::Result<()> {
    let ToolCommand::Call {
        tool,
        json: args_json,
        workspace,
    } = args.command;

    let mut config = Config::load(config_file)?;
    outpost_server::init_logging(&config.logging);
    // The operator invoked this by hand; there is no second channel to
    // approve from, so local dispatch is implicitly approved.
    config.approvals.auto_approve = true;
    let config = Arc::new(config);

    let workspace = config.workspace(workspace.as_deref())?;
    let tool_args: Value = serde_json::from_str(&args_json).context("parsing tool args as JSON")?;

    let ctx = RunContext::new(
        workspace,
        config,
        Arc::new(outpost_core::approval::ApprovalBroker::new()),
        Box::new(|event| {
            eprintln!(
                "event {}: {}",
                event.event,
                serde_json::to_string(&event.payload).unwrap_or_default()
            );
        }),
        tokio_util::sync::CancellationToken::new(),
    );

    let result = tools::dispatch(&ctx, &tool, tool_args).await;
    if let Err(err) = ctx.audit.flush(home) {
        tracing::warn!("failed to flush audit log: {err}");
    }
    match result {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Err(err) => {
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&json!({ "error": err.to_wire() }))?
            );
            std::process::exit(1);
        }
    }
}
