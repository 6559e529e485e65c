#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, bail, Context, Result};
use promptd::config;
use promptd::daemon::{
    auto_start_daemon, extract_prompts, session_id_for, Client, DaemonPaths, DaemonSettings,
    PromptResponse, RenderFlags,
};
use promptd::environment::Environment;
use promptd::logging;
use promptd::render::{Engine, NoCache};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::io;
use std::process::exit;
use std::sync::Arc;
use tracing::debug;

const SESSION_ENV: &str = "PROMPTD_SESSION_ID";

fn main() -> Result<()> {
    if env::var_os(logging::LOG_ENV).is_some() {
        logging::init(true);
    }

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "render" => render(&args[1..]),
        "toggle" => toggle(&args[1..]),
        "cache" => cache(&args[1..]),
        "log" => set_log(&args[1..]),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            exit(1);
        }
    }
}

#[derive(Debug, Default)]
struct RenderArgs {
    flags: RenderFlags,
    pid: Option<i32>,
    stream: bool,
    no_daemon: bool,
}

fn parse_render_args(args: &[String]) -> Result<RenderArgs> {
    let mut parsed = RenderArgs::default();
    parsed.flags.prompt_type = "primary".to_string();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{} needs a value", name))
        };

        match arg.as_str() {
            "--config" => parsed.flags.config_path = value(arg)?,
            "--pwd" => parsed.flags.pwd = value(arg)?,
            "--shell" => parsed.flags.shell = value(arg)?,
            "--shell-version" => parsed.flags.shell_version = value(arg)?,
            "--status" => parsed.flags.error_code = value(arg)?.parse().context("--status")?,
            "--pipestatus" => parsed.flags.pipe_status = value(arg)?,
            "--execution-time" => {
                parsed.flags.execution_time = value(arg)?.parse().context("--execution-time")?
            }
            "--terminal-width" => {
                parsed.flags.terminal_width = value(arg)?.parse().context("--terminal-width")?
            }
            "--prompt-count" => {
                parsed.flags.prompt_count = value(arg)?.parse().context("--prompt-count")?
            }
            "--job-count" => parsed.flags.job_count = value(arg)?.parse().context("--job-count")?,
            "--type" => parsed.flags.prompt_type = value(arg)?,
            "--pid" => parsed.pid = Some(value(arg)?.parse().context("--pid")?),
            "--plain" => parsed.flags.plain = true,
            "--cleared" => parsed.flags.cleared = true,
            "--stream" => parsed.stream = true,
            "--no-daemon" => parsed.no_daemon = true,
            other => bail!("unknown render option '{}'", other),
        }
    }

    // The daemon runs elsewhere, so it must never see a relative path
    parsed.flags.config_path = config::resolve_path(&parsed.flags.config_path);

    if parsed.flags.pwd.is_empty() {
        parsed.flags.pwd = env::current_dir()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    if parsed.flags.terminal_width == 0 {
        let size = terminal_size::terminal_size()
            .or_else(|| terminal_size::terminal_size_of(io::stderr()));
        if let Some((terminal_size::Width(width), _)) = size {
            parsed.flags.terminal_width = i32::from(width);
        }
    }

    Ok(parsed)
}

/// The shell that runs us is the session we render for
fn shell_pid(explicit: Option<i32>) -> i32 {
    explicit.unwrap_or_else(|| std::os::unix::process::parent_id() as i32)
}

fn session_id(pid: i32) -> String {
    env::var(SESSION_ENV)
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| session_id_for(pid))
}

fn render(args: &[String]) -> Result<()> {
    let args = parse_render_args(args)?;
    let prompt_type = args.flags.prompt_type.clone();

    if !args.no_daemon {
        match render_with_daemon(&args) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("daemon render failed, rendering directly: {}", e),
        }
    }

    let config = config::load(&args.flags.config_path);
    let env = Environment::from_process(args.flags);
    let mut engine = Engine::new(config, env, Arc::new(NoCache));
    engine.render_blocking();
    let prompts = engine.prompts();

    if args.stream {
        print_stream_line("complete", &prompts);
    } else {
        print!("{}", prompts.get(&prompt_type).map(String::as_str).unwrap_or(""));
    }
    Ok(())
}

fn render_with_daemon(args: &RenderArgs) -> promptd::Result<()> {
    let paths = DaemonPaths::for_settings(&DaemonSettings::load())?;
    let mut client = Client::connect_or_start(&paths, auto_start_daemon)?;

    let pid = shell_pid(args.pid);
    let session = session_id(pid);
    let env_vars: HashMap<String, String> = env::vars().collect();

    let stream = args.stream;
    let response = client.render_prompt(args.flags.clone(), pid, &session, env_vars, |response| {
        if stream {
            print_stream_line(response.kind.as_str(), &response.prompts);
        }
    })?;

    if !stream {
        print_prompt(&response, &args.flags.prompt_type);
    }
    Ok(())
}

fn print_prompt(response: &PromptResponse, prompt_type: &str) {
    let prompts = extract_prompts(response);
    let text = match prompt_type {
        "right" => prompts.right,
        "secondary" => prompts.secondary.unwrap_or_default(),
        "transient" => prompts.transient.unwrap_or_default(),
        _ => prompts.primary,
    };
    print!("{}", text);
}

/// One JSON object per line for shells that consume the stream
fn print_stream_line(kind: &str, prompts: &HashMap<String, String>) {
    println!("{}", json!({ "type": kind, "prompts": prompts }));
}

fn connect() -> Result<Client> {
    let paths = DaemonPaths::for_settings(&DaemonSettings::load())?;
    Client::connect(&paths.socket).context("daemon is not running")
}

fn toggle(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("usage: prompt toggle <segment>...");
    }
    let session = session_id(shell_pid(None));
    connect()?.toggle_segment(&session, args)?;
    Ok(())
}

fn cache(args: &[String]) -> Result<()> {
    let mut client = connect()?;

    match args {
        [sub] if sub == "clear" => {
            client.cache_clear()?;
            println!("Cache cleared.");
        }
        [sub] if sub == "ttl" => {
            println!("{}", client.cache_get_ttl()?);
        }
        [sub, days] if sub == "ttl" => {
            let days: i32 = days.parse().context("TTL must be a number of days")?;
            client.cache_set_ttl(days)?;
            println!("Cache TTL set to {} day(s).", days);
        }
        _ => bail!("usage: prompt cache clear | prompt cache ttl [days]"),
    }
    Ok(())
}

fn set_log(args: &[String]) -> Result<()> {
    let path = match args {
        [off] if off == "off" => String::new(),
        [path] => std::path::absolute(path)?.to_string_lossy().into_owned(),
        _ => bail!("usage: prompt log <path>|off"),
    };
    connect()?.set_logging(&path)?;
    Ok(())
}

fn print_usage() {
    println!("prompt v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: prompt <command> [options]");
    println!();
    println!("Commands:");
    println!("  render [options]     Print a prompt (via the daemon when possible)");
    println!("  toggle <segment>...  Show or hide segments for this shell");
    println!("  cache clear          Drop every cached segment value");
    println!("  cache ttl [days]     Show or set the default cache TTL");
    println!("  log <path>|off       Turn daemon file logging on or off");
    println!();
    println!("Render options:");
    println!("  --config <path>  --pwd <dir>  --shell <name>  --shell-version <v>");
    println!("  --status <code>  --pipestatus <s>  --execution-time <ms>");
    println!("  --terminal-width <n>  --prompt-count <n>  --job-count <n>");
    println!("  --type primary|right|secondary|transient  --pid <pid>");
    println!("  --plain  --cleared  --stream  --no-daemon");
}
