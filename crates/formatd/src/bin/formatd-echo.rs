//! Reference formatter daemon.
//!
//! Speaks the line protocol on stdin/stdout and "formats" by echoing the text
//! back. `FORMATD_ECHO_MODE` changes the behavior for testing editors and the
//! session client:
//! - `echo` (default): return the text unchanged
//! - `upper`: return the text uppercased
//! - `error`: answer every format request with `ok: false`
//! - `silent`: read requests, never answer
//! - `exit`: exit with code 3 after reading the first request
//! - `reverse`: hold requests in pairs and answer each pair in reverse order

use std::io::{BufRead, Write};
use std::process;
use std::time::Instant;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Echo,
    Upper,
    Error,
    Silent,
    Exit,
    Reverse,
}

impl Mode {
    fn from_env() -> anyhow::Result<Self> {
        let mode = std::env::var("FORMATD_ECHO_MODE").unwrap_or_default();
        Ok(match mode.trim() {
            "" | "echo" => Self::Echo,
            "upper" => Self::Upper,
            "error" => Self::Error,
            "silent" => Self::Silent,
            "exit" => Self::Exit,
            "reverse" => Self::Reverse,
            other => anyhow::bail!("unknown FORMATD_ECHO_MODE '{other}'"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    id: Option<Value>,
    op: String,
    text: Option<String>,
    b64: Option<String>,
}

fn main() {
    formatd::logging::init_tracing();

    if !std::env::args().skip(1).any(|a| a == formatd::supervisor::SERVE_ARG) {
        eprintln!("Usage: formatd-echo --serve");
        process::exit(2);
    }

    match serve() {
        Ok(code) => process::exit(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Echo daemon failed");
            process::exit(1);
        }
    }
}

fn serve() -> anyhow::Result<i32> {
    let mode = Mode::from_env()?;
    tracing::info!(?mode, pid = process::id(), "Echo daemon ready");

    let stdin = std::io::stdin();
    let mut out = std::io::stdout().lock();
    let mut held: Vec<Value> = Vec::new();

    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let started = Instant::now();

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                write_line(&mut out, &json!({"ok": false, "error": format!("invalid request: {e}")}))?;
                continue;
            }
        };

        match request.op.as_str() {
            "shutdown" => {
                write_line(&mut out, &json!({"ok": true}))?;
                tracing::info!("Shutdown requested");
                return Ok(0);
            }
            "ping" => write_line(&mut out, &json!({"id": request.id, "ok": true}))?,
            "format" => {
                if mode == Mode::Exit {
                    tracing::warn!("Exiting on first request");
                    return Ok(3);
                }
                if mode == Mode::Silent {
                    continue;
                }
                let reply = format_reply(mode, &request, started);
                if mode == Mode::Reverse {
                    held.push(reply);
                    if held.len() == 2 {
                        for reply in held.drain(..).rev() {
                            write_line(&mut out, &reply)?;
                        }
                    }
                } else {
                    write_line(&mut out, &reply)?;
                }
            }
            other => write_line(
                &mut out,
                &json!({"id": request.id, "ok": false, "error": format!("unknown op '{other}'")}),
            )?,
        }
    }

    tracing::info!("Stdin closed");
    Ok(0)
}

fn format_reply(mode: Mode, request: &Request, started: Instant) -> Value {
    let (text, as_b64) = match (&request.text, &request.b64) {
        (Some(text), _) => (text.clone(), false),
        (None, Some(b64)) => match BASE64
            .decode(b64)
            .map_err(|e| e.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()))
        {
            Ok(text) => (text, true),
            Err(e) => {
                return json!({"id": request.id, "ok": false, "error": format!("bad b64: {e}")});
            }
        },
        (None, None) => (String::new(), false),
    };

    let formatted = match mode {
        Mode::Error => {
            return json!({"id": request.id, "ok": false, "error": "internal error"});
        }
        Mode::Upper => text.to_uppercase(),
        _ => text,
    };

    let ms = started.elapsed().as_secs_f64() * 1000.0;
    if as_b64 {
        json!({"id": request.id, "ok": true, "b64": BASE64.encode(formatted), "ms": ms})
    } else {
        json!({"id": request.id, "ok": true, "text": formatted, "ms": ms})
    }
}

fn write_line(out: &mut impl Write, reply: &Value) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, reply)?;
    out.write_all(b"\n")?;
    out.flush().context("failed to flush stdout")
}
