mod console;

use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use queuecast_contracts::catalog::{MediaKind, Resolution};
use queuecast_contracts::chat::parse_intent;
use queuecast_contracts::state::{BotState, Requester};
use queuecast_contracts::surface::ChatSurface;
use queuecast_engine::config::EngineConfig;
use queuecast_engine::conversation::{ConversationModel, DryrunModel, GeminiModel};
use queuecast_engine::{MediaOutcome, MediaRequest, Mediator};
use tracing_subscriber::EnvFilter;

use crate::console::ConsoleSurface;

#[derive(Debug, Parser)]
#[command(name = "queuecast", version, about = "Chat front end for hosted generation queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session; type /help for commands.
    Chat(SessionArgs),
    Imagine(ImagineArgs),
    Speech(SpeechArgs),
    Music(PromptArgs),
    Video(PromptArgs),
    /// Clears the stored conversation of the session user.
    Clear(SessionArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    state: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Conversational model; `dryrun` works offline.
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "local")]
    user: String,
    #[arg(long, default_value = "You")]
    name: String,
    /// Act as a member of this group instead of a direct conversation.
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value = "console")]
    channel: String,
    /// Act with group administrator rights.
    #[arg(long, requires = "group")]
    admin: bool,
    /// Where text attachments are written.
    #[arg(long, default_value = "queuecast-downloads")]
    downloads: PathBuf,
}

#[derive(Debug, Args)]
struct PromptArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

#[derive(Debug, Args)]
struct ImagineArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Image backend, e.g. Kandinsky or SD-XL-Alt2.
    #[arg(long)]
    backend: Option<String>,
    #[arg(long)]
    resolution: Option<String>,
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

#[derive(Debug, Args)]
struct SpeechArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, default_value = "English")]
    language: String,
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("queuecast error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QUEUECAST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Imagine(args) => {
            let session = Session::open(&args.session)?;
            if let Some(raw) = &args.resolution {
                let resolution = Resolution::parse(raw)
                    .with_context(|| format!("unknown resolution '{raw}'"))?;
                session
                    .mediator
                    .state()
                    .update_preferences(&session.requester.user_id, |prefs| {
                        prefs.resolution = resolution;
                    });
            }
            let request =
                MediaRequest::new(MediaKind::Image, args.prompt.join(" ")).with_model(args.backend);
            session.generate(request)
        }
        Command::Speech(args) => {
            let session = Session::open(&args.session)?;
            let request = MediaRequest::new(MediaKind::Speech, args.prompt.join(" "))
                .with_language(args.language);
            session.generate(request)
        }
        Command::Music(args) => {
            let session = Session::open(&args.session)?;
            session.generate(MediaRequest::new(MediaKind::Music, args.prompt.join(" ")))
        }
        Command::Video(args) => {
            let session = Session::open(&args.session)?;
            session.generate(MediaRequest::new(MediaKind::Video, args.prompt.join(" ")))
        }
        Command::Clear(args) => {
            let session = Session::open(&args)?;
            println!("{}", session.mediator.clear_history(&session.requester));
            Ok(0)
        }
    }
}

struct Session {
    mediator: Arc<Mediator>,
    surface: Arc<ConsoleSurface>,
    requester: Requester,
}

impl Session {
    fn open(args: &SessionArgs) -> Result<Self> {
        let mut config = EngineConfig::from_env();
        if let Some(path) = &args.state {
            config.state_path = path.clone();
        }
        if args.events.is_some() {
            config.events_path = args.events.clone();
        }
        if let Some(model) = &args.model {
            config.chat_model = model.trim().to_string();
        }

        let state = Arc::new(BotState::load(config.state_path.clone()));
        let surface = Arc::new(ConsoleSurface::new(&args.downloads));
        let model = conversation_model(&config);
        let shared: Arc<dyn ChatSurface> = surface.clone();
        let mediator = Arc::new(Mediator::new(config, state, model, shared));

        let mut requester = Requester::direct(args.user.trim(), args.name.trim());
        if let Some(group) = &args.group {
            requester = requester.in_group(group.trim(), args.channel.trim());
        }
        if args.admin {
            requester = requester.as_admin();
        }
        Ok(Self {
            mediator,
            surface,
            requester,
        })
    }

    fn generate(&self, request: MediaRequest) -> Result<i32> {
        match self.mediator.generate_media(&self.requester, request)? {
            MediaOutcome::Delivered { .. } => Ok(0),
            MediaOutcome::Failed { .. } | MediaOutcome::Rejected(_) => Ok(1),
        }
    }
}

fn conversation_model(config: &EngineConfig) -> Box<dyn ConversationModel> {
    if config.chat_model.eq_ignore_ascii_case("dryrun") {
        return Box::new(DryrunModel::new());
    }
    match GeminiModel::from_config(config) {
        Ok(model) => Box::new(model),
        Err(err) => {
            tracing::warn!("{err:#}; falling back to the dryrun model");
            Box::new(DryrunModel::new())
        }
    }
}

fn run_chat(args: SessionArgs) -> Result<()> {
    let session = Session::open(&args)?;
    let stdin = io::stdin();
    let mut line = String::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    println!(
        "queuecast chat started ({}). Type /help for commands.",
        session.mediator.model_name()
    );

    loop {
        print!("\n> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        workers.retain(|worker| !worker.is_finished());
        let action = intent.action.clone();
        let free_text = matches!(action.as_str(), "chat" | "generate_image");
        if free_text
            && !intent.slash_command
            && !session
                .mediator
                .should_respond(&session.requester, intent.mentioned)
        {
            println!("> `Not addressed to the bot. Start with @queuecast or use /alwaysrespond.`");
            continue;
        }
        match action.as_str() {
            "noop" => continue,
            "stop" => {
                if session.surface.stop(&session.requester.user_id) {
                    println!("> `Generation stopped.`");
                } else {
                    println!("> `Nothing to stop.`");
                }
            }
            // Long-running requests get their own thread so /stop stays responsive.
            "chat" | "generate_image" | "generate_speech" | "generate_music" | "generate_video" => {
                let mediator = Arc::clone(&session.mediator);
                let requester = session.requester.clone();
                workers.push(thread::spawn(move || {
                    if let Err(err) = mediator.dispatch(&requester, &intent) {
                        eprintln!("queuecast error: {err:#}");
                    }
                }));
            }
            _ => {
                if let Err(err) = session.mediator.dispatch(&session.requester, &intent) {
                    eprintln!("queuecast error: {err:#}");
                }
            }
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}
