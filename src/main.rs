use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;

use sandbox_sync::Sandbox;
use sandbox_sync::config::{SANDBOX_JSON_ENV, SandboxConfig};
use sandbox_sync::daemon;
use sandbox_sync::orchestrator::{
    JsonLinesStatusChannel, LogStatusChannel, SandboxStatus, StatusChannel,
};
use sandbox_sync::protocol::{LoadProjectRequest, SetupUserRequest, ShutdownEvent};
use sandbox_sync::workspace::ProjectRecord;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "sandbox-sync",
    about = "Keep sandbox project folders in sync with their git remotes"
)]
struct Cli {
    /// Remote prefix, overriding ssh://git@$GIT_SSH_HOST
    #[arg(long, global = true)]
    remote_base: Option<String>,

    /// Append status updates to this file as JSON lines
    #[arg(long, global = true)]
    status_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run until SIGINT/SIGTERM, then back up every folder
    Daemon {
        /// false: fail the shutdown on the first folder that cannot be saved
        #[arg(long)]
        force: Option<bool>,
    },

    /// Install ssh keys, sandbox config and git identity
    SetupUser {
        /// setupUser JSON payload ("-" for stdin)
        payload: PathBuf,
    },

    /// Register, clone and open a project
    Load {
        /// Owner of the remote repository
        owner: String,
        /// Project record JSON ("-" for stdin)
        project: PathBuf,
    },

    /// Commit, push and reset workspace folders
    Commit {
        /// Branch to push
        branch: String,
        #[arg(short, long)]
        message: String,
        /// Only this folder
        #[arg(long)]
        project: Option<String>,
    },

    /// List folders open in the workspace
    Active,

    /// Push every folder to a fresh backup branch
    Backup {
        #[arg(long)]
        force: Option<bool>,
    },

    /// Drop duplicate and id-less saved projects
    Sanitize,

    /// Delete folders the workspace no longer lists
    Reconcile,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = build_sandbox(&cli).and_then(|sandbox| match cli.command {
        Commands::Daemon { force } => cmd_daemon(&sandbox, force),
        Commands::SetupUser { payload } => cmd_setup_user(&sandbox, &payload),
        Commands::Load { owner, project } => cmd_load(&sandbox, &owner, &project),
        Commands::Commit {
            branch,
            message,
            project,
        } => cmd_commit(&sandbox, &branch, &message, project.as_deref()),
        Commands::Active => cmd_active(&sandbox),
        Commands::Backup { force } => cmd_backup(&sandbox, force),
        Commands::Sanitize => cmd_sanitize(&sandbox),
        Commands::Reconcile => cmd_reconcile(&sandbox),
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if e.to_string().contains("SANDBOX_ID") {
            eprintln!();
            eprintln!("Hint: export SANDBOX_ID=<sandbox id> before running sandbox-sync");
        }
        std::process::exit(1);
    }
}

fn build_sandbox(cli: &Cli) -> Result<Sandbox, Box<dyn std::error::Error>> {
    let mut config = SandboxConfig::from_env()?;
    if let Some(base) = &cli.remote_base {
        config = config.with_remote_base(base.clone());
    }

    let status: Arc<dyn StatusChannel> = match &cli.status_file {
        Some(path) => Arc::new(JsonLinesStatusChannel::new(path)),
        None => Arc::new(LogStatusChannel),
    };
    Ok(Sandbox::new(config, status))
}

fn read_payload<T: DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = if path == Path::new("-") {
        let mut raw = Vec::new();
        std::io::stdin().read_to_end(&mut raw)?;
        raw
    } else {
        std::fs::read(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?
    };
    Ok(serde_json::from_slice(&raw)?)
}

fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_daemon(sandbox: &Sandbox, force: Option<bool>) -> CmdResult {
    let sandbox_json = std::env::var(SANDBOX_JSON_ENV).ok();
    let status = daemon::run(sandbox, sandbox_json.as_deref(), ShutdownEvent { force })?;
    if status == SandboxStatus::ShuttingDownError {
        return Err("shutdown backup failed".into());
    }
    Ok(())
}

fn cmd_setup_user(sandbox: &Sandbox, payload: &Path) -> CmdResult {
    let request: SetupUserRequest = read_payload(payload)?;
    sandbox.setup_user(&request)?;
    println!("User {} set up", request.user.id);
    Ok(())
}

fn cmd_load(sandbox: &Sandbox, owner: &str, project: &Path) -> CmdResult {
    let project: ProjectRecord = read_payload(project)?;
    let request = LoadProjectRequest {
        owner_username: owner.to_string(),
        project,
    };
    let slug = request.project.slug().unwrap_or_default().to_string();
    sandbox.load_project(&request.owner_username, request.project)?;
    println!("Loaded {}", slug);
    Ok(())
}

fn cmd_commit(sandbox: &Sandbox, branch: &str, message: &str, project: Option<&str>) -> CmdResult {
    let result = sandbox.commit_project(branch, message, project);
    print_json(&result)?;
    if !result.is_success() {
        return Err(result.message.into());
    }
    Ok(())
}

fn cmd_active(sandbox: &Sandbox) -> CmdResult {
    let result = sandbox.active_projects();
    print_json(&result)?;
    if result.folders().is_none() {
        return Err("failed to read the workspace manifest".into());
    }
    Ok(())
}

fn cmd_backup(sandbox: &Sandbox, force: Option<bool>) -> CmdResult {
    let branch = sandbox.backup(force)?;
    println!("Backed up to {}", branch);
    Ok(())
}

fn cmd_sanitize(sandbox: &Sandbox) -> CmdResult {
    let stats = sandbox.workspace().sanitize_projects()?;
    println!("Saved projects");
    println!("  Kept:       {}", stats.kept);
    println!("  Missing id: {}", stats.missing_id);
    println!("  Duplicates: {}", stats.duplicates);
    Ok(())
}

fn cmd_reconcile(sandbox: &Sandbox) -> CmdResult {
    let stats = daemon::reconcile(sandbox.workspace(), sandbox.config().lock_timeout);
    println!("Reconciled workspace");
    println!("  Scanned: {}", stats.directories_scanned);
    println!("  Removed: {}", stats.directories_removed);
    println!("  Records: {}", stats.records_removed);
    if stats.failures > 0 {
        return Err(format!("{} folders could not be removed", stats.failures).into());
    }
    Ok(())
}
