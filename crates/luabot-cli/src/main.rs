//! Command line host for luabot.
//!
//! # Examples
//!
//! ```bash
//! # Run a bot from a script folder
//! luabot run --scripts ./scripts --token 123:abc
//!
//! # Run a packed project whose token is sealed inside the archive
//! luabot run --project bot.zip
//!
//! # Precompile scripts, then run the bytecode file
//! luabot compile ./scripts -o bot.json
//! luabot run --bytecode bot.json --token 123:abc
//!
//! # Pack scripts and a sealed token into a project archive
//! luabot pack ./scripts -o bot.zip --token 123:abc
//!
//! # Talk to the scripts from the terminal, without Telegram
//! luabot console ./scripts
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, mpsc};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use luabot::{
    BotRuntime, CallbackQuery, IncomingMessage, Keyboard, MemoryTransport, PersistedBytecode,
    ProjectArchive, RuntimeConfig, TelegramTransport, Transport, Update, User, WorkerPool,
};

/// Run, compile and pack Lua-scripted Telegram bots.
#[derive(Parser, Debug)]
#[command(name = "luabot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a bot against the Telegram Bot API
    Run(RunArgs),

    /// Compile a script folder to a bytecode file
    Compile {
        /// Script folder
        dir: PathBuf,

        /// Output path (default: bytecode.json in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Pack a script folder into a project archive
    Pack {
        /// Script folder
        dir: PathBuf,

        /// Archive path
        #[arg(short, long)]
        output: PathBuf,

        /// Bot token to seal into the archive
        #[arg(long)]
        token: Option<String>,

        /// Project name (default: the folder name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Chat with a bot from the terminal
    ///
    /// Each input line is a message from chat 1. A line starting with `!`
    /// is a callback query carrying the rest of the line, e.g.
    /// `!quiz;answer_2`. An empty line ticks pending coroutines.
    Console {
        /// Script folder
        dir: PathBuf,

        #[command(flatten)]
        overrides: ConfigArgs,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct BotSource {
    /// Script folder
    #[arg(long)]
    scripts: Option<PathBuf>,

    /// Project archive
    #[arg(long)]
    project: Option<PathBuf>,

    /// Bytecode file produced by `luabot compile`
    #[arg(long)]
    bytecode: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Idle seconds before a chat's session is closed
    #[arg(long)]
    activity_timeout: Option<u64>,

    /// Bytecode cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(secs) = self.activity_timeout {
            config.activity_timeout_secs = secs;
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    source: BotSource,

    /// Bot token (required unless the project carries one)
    #[arg(long, env = "LUABOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "luabot=debug,luabot_cli=debug"
    } else {
        "luabot=info,luabot_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Compile { dir, output } => compile(&dir, output),
        Command::Pack {
            dir,
            output,
            token,
            name,
        } => pack(&dir, &output, token.as_deref(), name),
        Command::Console { dir, overrides } => console(&dir, &overrides.load()?),
    }
}

fn connect(token: &str, config: &RuntimeConfig) -> Result<Arc<dyn Transport>> {
    let transport = TelegramTransport::new(token, config.poll_timeout())?;
    let me = transport.get_me().context("bot token was rejected")?;
    tracing::info!(bot = ?me.username, "Connected to Telegram");
    let transport: Arc<dyn Transport> = Arc::new(transport);
    Ok(transport)
}

fn run(args: RunArgs) -> Result<()> {
    let config = args.overrides.load()?;
    let token = args.token.unwrap_or_default();

    let runtime = if let Some(project) = args.source.project {
        load_project(project, token, config)?
    } else {
        if token.trim().is_empty() {
            bail!("--token (or LUABOT_TOKEN) is required unless running a project");
        }
        let transport = connect(&token, &config)?;

        if let Some(scripts) = args.source.scripts {
            BotRuntime::create(scripts, transport, config)
        } else if let Some(path) = args.source.bytecode {
            let bytecode = PersistedBytecode::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            BotRuntime::from_bytecode(bytecode.into_map(), transport, config)?
        } else {
            bail!("one of --scripts, --project or --bytecode is required");
        }
    };

    if let luabot::RuntimeStatus::Degraded { reason } = runtime.status() {
        tracing::error!(%reason, "Bot scripts are broken; no chat will be served");
    }

    // Runs until the process is terminated.
    let stop = AtomicBool::new(false);
    runtime.run(&stop);
    Ok(())
}

/// Open, decrypt and compile a project off the main thread.
fn load_project(path: PathBuf, token: String, config: RuntimeConfig) -> Result<BotRuntime> {
    let (sender, receiver) = mpsc::channel();
    let mut pool = WorkerPool::new("luabot-loader")?;

    let poll_config = config.clone();
    pool.execute(
        move || {
            let credentials = luabot::platform_store();
            let runtime = BotRuntime::create_from_project(
                &path,
                &token,
                credentials.as_ref(),
                |token| {
                    connect(token, &poll_config)
                        .map_err(|e| luabot::TransportError::Http(format!("{e:#}")))
                },
                config,
            )?;
            sender
                .send(runtime)
                .map_err(|_| anyhow::anyhow!("loader result was dropped"))?;
            Ok(())
        },
        luabot::workers::default_success_handler,
        luabot::workers::default_fail_handler,
    );
    pool.shutdown();

    receiver
        .recv()
        .map_err(|_| anyhow::anyhow!("failed to load project"))
}

fn compile(dir: &Path, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from("bytecode.json"));

    let map = luabot::compile_dir(dir)?;
    PersistedBytecode::new(&map)
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Compiled {} command(s) to {}", map.len(), output.display());
    for name in map.names() {
        println!("  /{name}");
    }
    Ok(())
}

fn pack(dir: &Path, output: &Path, token: Option<&str>, name: Option<String>) -> Result<()> {
    // Fail before writing anything if the scripts do not compile.
    luabot::compile_dir(dir)?;

    let sealed = match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => Some(
            luabot::platform_store()
                .encrypt(token.as_bytes())
                .context("failed to seal bot token")?,
        ),
        None => None,
    };

    let name = name.unwrap_or_else(|| {
        dir.file_name()
            .map_or_else(|| "bot".to_string(), |n| n.to_string_lossy().into_owned())
    });
    ProjectArchive::write(output, &name, dir, sealed.as_deref())?;

    println!("Packed `{name}` to {}", output.display());
    Ok(())
}

const CONSOLE_CHAT: u64 = 1;

fn console(dir: &Path, config: &RuntimeConfig) -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    let runtime = BotRuntime::create(dir, transport.clone(), config.clone());
    if let luabot::RuntimeStatus::Degraded { reason } = runtime.status() {
        bail!("bot scripts are broken: {reason}");
    }

    let user = User {
        id: CONSOLE_CHAT,
        username: Some("console".to_string()),
        first_name: "Console".to_string(),
    };

    let stdin = std::io::stdin();
    for (index, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let id = i64::try_from(index).unwrap_or(i64::MAX);

        if let Some(payload) = line.strip_prefix('!') {
            transport.push(Update::CallbackQuery(CallbackQuery {
                id: id.to_string(),
                chat_id: CONSOLE_CHAT,
                message_id: None,
                data: payload.to_string(),
                from: Some(user.clone()),
            }));
        } else if !line.trim().is_empty() {
            transport.push(Update::Message(IncomingMessage {
                chat_id: CONSOLE_CHAT,
                message_id: id,
                text: line,
                from: Some(user.clone()),
            }));
        }

        runtime.run_cycle()?;
        runtime.flush_sessions();

        for message in transport.take_sent() {
            println!("< {}", message.text);
            match &message.keyboard {
                Some(Keyboard::Inline(rows)) => {
                    for button in rows.iter().flatten() {
                        println!("  [{}] !{}", button.text, button.callback_data);
                    }
                }
                Some(Keyboard::Reply(rows)) => {
                    for button in rows.iter().flatten() {
                        println!("  [{}]", button.text);
                    }
                }
                None => {}
            }
        }
    }

    runtime.shutdown();
    Ok(())
}
