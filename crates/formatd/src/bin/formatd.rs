use std::process;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use formatd::config::EXECUTABLE_ENV;
use formatd::{CancellationToken, PayloadEncoding, Session, SessionConfig};

/// Exit status when the run was interrupted with Ctrl-C.
const EXIT_CANCELED: i32 = 130;

#[derive(Debug, Default)]
struct Args {
    exe: Option<String>,
    encoding: Option<PayloadEncoding>,
    timeout_ms: Option<u64>,
    ping: bool,
    version: bool,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: formatd [--exe <path>] [--encoding text|b64] [--timeout-ms <ms>] [--ping]");
            eprintln!();
            eprintln!("Reads source text on stdin and writes the formatted text to stdout.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --exe <path>        Formatter executable [default: $RD_FORMAT_PATH]");
            eprintln!("  --encoding <enc>    Payload encoding: text or b64 [default: text]");
            eprintln!("  --timeout-ms <ms>   Request timeout, 0 for none [default: 10000]");
            eprintln!("  --ping              Check the daemon responds, print the round trip");
            eprintln!("  --version           Print version and exit");
            process::exit(2);
        }
    };

    if args.version {
        println!("formatd {}", formatd::FORMATD_VERSION);
        return;
    }

    formatd::logging::init_tracing();

    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--exe" => {
                i += 1;
                parsed.exe = Some(args.get(i).ok_or("--exe requires a value")?.clone());
            }
            "--encoding" => {
                i += 1;
                let value = args.get(i).ok_or("--encoding requires a value")?;
                parsed.encoding = Some(value.parse()?);
            }
            "--timeout-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--timeout-ms requires a value")?;
                parsed.timeout_ms = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid --timeout-ms '{value}'"))?,
                );
            }
            "--ping" => parsed.ping = true,
            "--version" | "-V" => parsed.version = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn build_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::from_lookup(|name| match (&args.exe, name) {
        (Some(exe), EXECUTABLE_ENV) => Some(exe.clone()),
        _ => std::env::var(name).ok(),
    })
    .context("no formatter configured (pass --exe or set RD_FORMAT_PATH)")?;

    if let Some(encoding) = args.encoding {
        config = config.with_encoding(encoding);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let config = build_config(&args)?;
    let session = Session::new(config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, canceling request");
                cancel.cancel();
            }
        }
    });

    let result = if args.ping {
        ping(&session).await
    } else {
        format_stdin(&session, &cancel).await
    };

    session.shutdown().await;
    result
}

async fn ping(session: &Session) -> anyhow::Result<i32> {
    let rtt = session.ping(session.config().effective_timeout()).await?;
    let snapshot = session.snapshot();
    println!(
        "ok: {:.1}ms (pid {})",
        rtt.as_secs_f64() * 1000.0,
        snapshot
            .pid
            .map_or_else(|| "unknown".to_string(), |p| p.to_string())
    );
    Ok(0)
}

async fn format_stdin(session: &Session, cancel: &CancellationToken) -> anyhow::Result<i32> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read stdin")?;

    let formatted = match session.format_default(&input, cancel).await {
        Ok(text) => text,
        Err(e) if e.is_canceled() => return Ok(EXIT_CANCELED),
        Err(e) => return Err(e.into()),
    };

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(formatted.as_bytes())
        .await
        .context("failed to write stdout")?;
    stdout.flush().await.context("failed to flush stdout")?;
    Ok(0)
}
