//! Roomflow CLI — author flowchart templates, run instances and drive the
//! per-room assistant task queue.
//!
//! Every command opens the same SQLite database the chat service uses, so
//! templates, instances and queued tasks are shared with it.

use clap::{Parser, Subcommand};
use roomflow_cli::commands;

/// Roomflow CLI — flowchart workflows for chat rooms
#[derive(Parser)]
#[command(name = "roomflow", version, about = "Roomflow CLI — flowchart workflows for chat rooms")]
pub struct Cli {
    /// Path to the SQLite database file (overrides the config file)
    #[arg(long, env = "ROOMFLOW_DB_PATH")]
    db: Option<String>,

    /// Path to a roomflow YAML config file
    #[arg(long, env = "ROOMFLOW_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage flowchart templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Run and inspect flowchart instances
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },

    /// Manage room task queues
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Create a template from a YAML or JSON file
    Import {
        /// Path to the template file
        file: String,
    },
    /// Publish a new version of a template
    Update {
        /// Template ID
        id: String,
        /// Path to a YAML or JSON file with the changed fields
        file: String,
    },
    /// List the latest version of each template
    List {
        /// Only templates visible in this room
        #[arg(long)]
        room: Option<String>,
        /// Only templates in this category
        #[arg(long)]
        category: Option<String>,
    },
    /// Show a template (latest version unless --at-version is given)
    Show {
        /// Template ID
        id: String,
        /// Specific version number
        #[arg(long = "at-version")]
        version: Option<i64>,
    },
    /// Show every version of a template
    History {
        /// Template ID
        id: String,
    },
    /// Delete a template and all of its versions
    Delete {
        /// Template ID
        id: String,
    },
    /// List the node types the engine can execute
    NodeTypes,
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Run the latest version of a template in the foreground
    Run {
        /// Template ID
        template_id: String,
        /// Room the run belongs to
        #[arg(long)]
        room: Option<String>,
        /// Initial variables as key=value (JSON values keep their type)
        #[arg(long = "var")]
        vars: Vec<String>,
        /// Pause before these node IDs
        #[arg(long = "break")]
        breakpoints: Vec<String>,
        /// Print every event as JSON
        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Resume a paused instance
    Resume {
        /// Instance ID
        id: String,
        #[arg(long = "break")]
        breakpoints: Vec<String>,
        #[arg(long, short = 'v')]
        verbose: bool,
    },
    /// Stop a running instance
    Stop {
        /// Instance ID
        id: String,
    },
    /// Show an instance with its node executions and progress
    Show {
        /// Instance ID
        id: String,
    },
    /// List instances by room or status
    List {
        #[arg(long)]
        room: Option<String>,
        /// PENDING, RUNNING, PAUSED, COMPLETED, FAILED or CANCELLED
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Queue a chat message for an assistant
    Chat {
        #[arg(long)]
        room: String,
        /// openclaw, kimi or claude
        #[arg(long, default_value = "openclaw")]
        assistant: String,
        /// Message content
        content: String,
        /// Sender name
        #[arg(long)]
        user: Option<String>,
        /// Wait for the task to finish
        #[arg(long)]
        wait: bool,
    },
    /// Queue a flowchart run for a room
    Flowchart {
        #[arg(long)]
        room: String,
        /// Template ID
        template_id: String,
        #[arg(long = "var")]
        vars: Vec<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        wait: bool,
    },
    /// Show the queues of every assistant in a room
    List {
        #[arg(long)]
        room: String,
    },
    /// Cancel a pending task
    Cancel {
        /// Task ID
        task_id: String,
    },
    /// Move pending tasks to the front in the given order
    Reorder {
        #[arg(long)]
        room: String,
        #[arg(long)]
        assistant: String,
        /// Task IDs in the desired order
        task_ids: Vec<String>,
    },
    /// Process tasks left over from a previous run and wait for them
    Recover,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomflow_core=info,roomflow_cli=info".into()),
        )
        .init();

    let state = commands::init_state(cli.db.as_deref(), cli.config.as_deref()).await;

    let result = match cli.command {
        Commands::Template { action } => match action {
            TemplateAction::Import { file } => commands::template::import(&state, &file).await.map(|_| ()),
            TemplateAction::Update { id, file } => commands::template::update(&state, &id, &file).await,
            TemplateAction::List { room, category } => {
                commands::template::list(&state, room.as_deref(), category.as_deref()).await
            }
            TemplateAction::Show { id, version } => commands::template::show(&state, &id, version).await,
            TemplateAction::History { id } => commands::template::history(&state, &id).await,
            TemplateAction::Delete { id } => commands::template::delete(&state, &id).await,
            TemplateAction::NodeTypes => commands::template::node_types(&state).await,
        },

        Commands::Instance { action } => match action {
            InstanceAction::Run {
                template_id,
                room,
                vars,
                breakpoints,
                verbose,
            } => commands::instance::run(&state, &template_id, room.as_deref(), &vars, breakpoints, verbose)
                .await
                .map(|_| ()),
            InstanceAction::Resume {
                id,
                breakpoints,
                verbose,
            } => commands::instance::resume(&state, &id, breakpoints, verbose).await,
            InstanceAction::Stop { id } => commands::instance::stop(&state, &id).await,
            InstanceAction::Show { id } => commands::instance::show(&state, &id).await,
            InstanceAction::List { room, status } => {
                commands::instance::list(&state, room.as_deref(), status.as_deref()).await
            }
        },

        Commands::Queue { action } => match action {
            QueueAction::Chat {
                room,
                assistant,
                content,
                user,
                wait,
            } => commands::queue::enqueue_chat(&state, &room, &assistant, &content, user.as_deref(), wait)
                .await
                .map(|_| ()),
            QueueAction::Flowchart {
                room,
                template_id,
                vars,
                user,
                wait,
            } => commands::queue::enqueue_flowchart(&state, &room, &template_id, &vars, user.as_deref(), wait)
                .await
                .map(|_| ()),
            QueueAction::List { room } => commands::queue::list(&state, &room).await,
            QueueAction::Cancel { task_id } => commands::queue::cancel(&state, &task_id).await,
            QueueAction::Reorder {
                room,
                assistant,
                task_ids,
            } => commands::queue::reorder(&state, &room, &assistant, &task_ids).await,
            QueueAction::Recover => commands::queue::recover(&state).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
