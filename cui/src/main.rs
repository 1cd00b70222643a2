// tdriver-cui -- interactive line sender.
//
// Connects a tdriver target to a TCP peer (or a serial port), prints all
// traffic as it happens and records it in a log file, and sends every line
// typed at the `cui> ` prompt. End of input (Ctrl-D) or Ctrl-C quits.
//
// Usage:
//   tdriver-cui -n 192.168.1.10 -p 23 -c
//   tdriver-cui --serial /dev/ttyUSB0 --baud 115200 -i
//   tdriver-cui -p 8080 --log log/http --no-timestamp

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tdriver::{FileLogger, SerialConfig, Target, TargetBuilder};

const PROMPT: &str = "cui> ";

/// Interactive line sender built on tdriver.
#[derive(Parser, Debug)]
#[command(name = "tdriver-cui", version, about)]
struct Cli {
    /// Hostname for the TCP connection.
    #[arg(short = 'n', long, default_value = "localhost")]
    hostname: String,

    /// TCP port number for the TCP connection.
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Terminate sent lines with CR+LF instead of LF.
    #[arg(short = 'c', long)]
    crlf: bool,

    /// Do not send blank lines.
    #[arg(short = 'i', long)]
    ignore_blank: bool,

    /// Traffic log file prefix.
    #[arg(long, default_value = "log/cui")]
    log: String,

    /// Do not append a timestamp to the log file name.
    #[arg(long)]
    no_timestamp: bool,

    /// Talk to this serial port instead of a TCP peer.
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate. Only used with --serial.
    #[arg(long, default_value_t = 9600)]
    baud: u32,
}

impl Cli {
    fn newline(&self) -> &'static str {
        if self.crlf { "\r\n" } else { "\n" }
    }

    /// The payload to send for one input line, or `None` to skip it.
    fn payload(&self, line: &str) -> Option<String> {
        if self.ignore_blank && line.is_empty() {
            return None;
        }
        Some(format!("{line}{}", self.newline()))
    }

    fn build_target(&self, logger: Arc<FileLogger>) -> Result<Target> {
        let builder = TargetBuilder::new("").logger(logger);
        let target = match &self.serial {
            Some(port) => builder.serial(port, SerialConfig::with_baud_rate(self.baud))?,
            None => builder.tcp(&self.hostname, self.port)?,
        };
        Ok(target)
    }
}

fn prompt() -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(PROMPT.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

async fn run(cli: &Cli, target: &Target) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        let Some(payload) = cli.payload(&line) else {
            continue;
        };
        if let Err(e) = target.send_str(&payload).await {
            bail!("send failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    debug!(?cli, "starting");

    let logger = Arc::new(
        FileLogger::create(&cli.log, !cli.no_timestamp)
            .with_context(|| format!("failed to create traffic log {}", cli.log))?,
    );
    info!(path = %logger.path().display(), "traffic log");

    let target = cli.build_target(logger.clone())?;
    target
        .start()
        .await
        .with_context(|| format!("failed to connect to {}", target.peer()))?;

    let outcome = run(&cli, &target).await;
    target.stop().await?;
    logger.close()?;
    outcome
}
