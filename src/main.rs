//! Stdin-driven front end.
//!
//! `atelier <workspace>` reads a user instruction from stdin, composes the
//! prompt against the workspace, and streams the model reply to stdout.
//! `atelier <workspace> --apply` instead reads a pasted `<changes>`
//! envelope from stdin and applies it, printing the per-file outcome.
//! Richer front ends (the HTTP service, the browser UI) drive the same
//! `Session` API.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use atelier::{ChatMessage, Session, SessionEvent};

struct CliArgs {
    workspace: PathBuf,
    apply: bool,
}

fn parse_args() -> Result<CliArgs> {
    let mut workspace: Option<PathBuf> = None;
    let mut apply = false;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--apply" => apply = true,
            "--help" | "-h" => {
                println!("usage: atelier <workspace> [--apply]");
                std::process::exit(0);
            }
            other if workspace.is_none() => workspace = Some(PathBuf::from(other)),
            other => bail!("unexpected argument {other:?}"),
        }
    }

    Ok(CliArgs {
        workspace: workspace.unwrap_or_else(|| PathBuf::from(".")),
        apply,
    })
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    if input.trim().is_empty() {
        bail!("no input on stdin");
    }
    Ok(input)
}

async fn run() -> Result<()> {
    let args = parse_args()?;
    let config_path = args.workspace.join(atelier::CONFIG_FILE_NAME);
    let settings = atelier::load_settings(&config_path);
    let session = Session::new(settings, args.workspace);
    let input = read_stdin()?;

    let (tx, mut rx) = mpsc::channel::<SessionEvent>(64);

    if args.apply {
        let apply = async {
            let result = session.apply_model_output(&input, None, &tx).await;
            drop(tx);
            result
        };
        let print_errors = async {
            while let Some(event) = rx.recv().await {
                match event {
                    SessionEvent::Error(message) => eprintln!("[error] {message}"),
                    SessionEvent::SnapshotCreated { label, .. } => {
                        eprintln!("[snapshot {label}]");
                    }
                    _ => {}
                }
            }
        };
        let (report, ()) = tokio::join!(apply, print_errors);
        let report = report?;

        for path in &report.applied {
            println!("applied  {path}");
        }
        for path in &report.skipped {
            println!("skipped  {path}");
        }
        for path in &report.failed {
            println!("failed   {path}");
        }
        if !report.failed.is_empty() {
            bail!("{} edit(s) failed", report.failed.len());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let history: Vec<ChatMessage> = Vec::new();
    let printer = async {
        use std::io::Write;
        let mut out = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::FilesIncluded { files, .. } => {
                    eprintln!("[{} file(s) included]", files.len());
                }
                SessionEvent::TextChunk(chunk) => {
                    let _ = out.write_all(chunk.as_bytes());
                    let _ = out.flush();
                }
                SessionEvent::Usage { usage, display } => {
                    for kind in display {
                        eprintln!("[tokens] {kind:?}: {}", usage.count(kind));
                    }
                }
                SessionEvent::SnapshotCreated { label, .. } => {
                    eprintln!("[snapshot {label}]");
                }
                SessionEvent::Error(message) => eprintln!("[error] {message}"),
                SessionEvent::Done => {}
            }
        }
        println!();
    };

    let turn = async {
        let result = session.run_turn(&history, &input, &cancel, &tx).await;
        drop(tx);
        result
    };
    let (turn_result, ()) = tokio::join!(turn, printer);
    turn_result?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
