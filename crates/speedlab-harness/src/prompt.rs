//! Minimal operator prompt: lists what is running and waits for `exit`.
//!
//! stdin is read on a helper thread and forwarded over a channel, so the
//! controlling thread can also notice Ctrl-C while waiting.

use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use speedlab_sim::prompt::{OperatorPrompt, PromptContext};

pub struct StdinPrompt {
    shutdown: Arc<AtomicBool>,
}

impl StdinPrompt {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self { shutdown }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Exit,
    Status,
    Help,
    Empty,
    Unknown(String),
}

fn parse(line: &str) -> Command {
    match line.trim() {
        "" => Command::Empty,
        "exit" | "quit" | "q" => Command::Exit,
        "status" | "ps" => Command::Status,
        "help" | "?" => Command::Help,
        other => Command::Unknown(other.to_string()),
    }
}

/// Forward lines from `input` on a helper thread. The channel disconnects
/// at end of input.
fn spawn_reader<R>(builder: thread::Builder, input: R) -> std::io::Result<Receiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(16);
    builder.spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    })?;
    Ok(rx)
}

fn print_status(ctx: &PromptContext<'_>) {
    println!("output: {}", ctx.output_dir.display());
    for ep in ctx.topology.endpoints() {
        let ifaces: Vec<&str> = ep.interfaces.iter().map(|i| i.name.as_str()).collect();
        println!("  {:<12} {}", ep.name, ifaces.join(" "));
    }
    for p in ctx.processes {
        let pid = p.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!("  {:<8} {:<12} {:<16} pid {}", p.id, p.endpoint, p.label, pid);
    }
    for f in ctx.failures {
        println!("  FAILED   {:<12} {:<16} {}", f.endpoint, f.label, f.error);
    }
}

impl OperatorPrompt for StdinPrompt {
    fn interact(&mut self, ctx: &PromptContext<'_>) -> speedlab_sim::Result<()> {
        print_status(ctx);
        println!("lab is up; type `exit` (or Ctrl-C / Ctrl-D) to tear down, `help` for commands");

        let builder = thread::Builder::new().name("speedlab-stdin".into());
        let lines = spawn_reader(builder, BufReader::new(std::io::stdin())).map_err(|e| {
            tracing::error!(error = %e, "cannot read operator input");
            e
        })?;
        loop {
            print!("speedlab> ");
            std::io::stdout().flush()?;

            let line = loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    println!();
                    tracing::info!("received SIGINT, leaving prompt");
                    return Ok(());
                }
                match lines.recv_timeout(Duration::from_millis(100)) {
                    Ok(line) => break line,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        println!();
                        return Ok(());
                    }
                }
            };

            match parse(&line) {
                Command::Exit => return Ok(()),
                Command::Status => print_status(ctx),
                Command::Help => println!("commands: status, exit"),
                Command::Empty => {}
                Command::Unknown(cmd) => println!("unknown command: {cmd}"),
            }
        }
    }
}
