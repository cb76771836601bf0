use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};

use cq_core::{
    clock::SystemClock, config::Config, runtime::QuotaRuntime, store::QuotaStore,
};
use cq_file_store::FileKv;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Use(u32),
    Grant(u32),
    Refresh,
    Reset(u32),
    Status,
    Quit,
}

#[tokio::main]
async fn main() -> Result<(), cq_core::Error> {
    cq_core::logging::init("cq")?;

    let cfg = Config::load()?;
    let kv = Arc::new(FileKv::new(cfg.state_dir.clone()));
    let rt = QuotaRuntime::start(&cfg, kv, Arc::new(SystemClock)).await;

    let res = command_loop(&cfg, rt.store()).await;
    rt.shutdown().await;

    res.map_err(|e| cq_core::Error::External(format!("command loop failed: {e:#}")))
}

async fn command_loop(cfg: &Config, store: &QuotaStore) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_status(store);

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };

        match cmd {
            Command::Use(n) => println!("{}", outcome(store.consume(n))),
            Command::Grant(n) => println!("{}", outcome(store.grant(n))),
            Command::Refresh => println!("{}", outcome(store.grant(cfg.refresh_bonus))),
            Command::Reset(n) => store.force_reset(n),
            Command::Status => {}
            Command::Quit => break,
        }
        print_status(store);
    }

    Ok(())
}

fn outcome(accepted: bool) -> &'static str {
    if accepted {
        "ok"
    } else {
        "denied"
    }
}

fn print_status(store: &QuotaStore) {
    let snap = store.snapshot();
    let remaining = snap.remaining_cooldown(store.now());
    println!(
        "balance={} mode={:?} remaining_secs={}",
        snap.balance,
        snap.mode,
        remaining.as_secs()
    );
}

fn parse_command(line: &str) -> anyhow::Result<Option<Command>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        bail!("too many arguments");
    }

    let cmd = match (verb.to_lowercase().as_str(), arg) {
        ("use", None) => Command::Use(1),
        ("use", Some(n)) => Command::Use(parse_amount(n)?),
        ("grant", Some(n)) => Command::Grant(parse_amount(n)?),
        ("reset", Some(n)) => Command::Reset(parse_count(n)?),
        ("refresh", None) => Command::Refresh,
        ("status", None) => Command::Status,
        ("quit" | "exit", None) => Command::Quit,
        ("grant" | "reset", None) => bail!("{verb} needs an amount"),
        _ => bail!("unknown command: {}", line.trim()),
    };
    Ok(Some(cmd))
}

fn parse_count(raw: &str) -> anyhow::Result<u32> {
    raw.parse::<u32>()
        .with_context(|| format!("not a number: {raw}"))
}

fn parse_amount(raw: &str) -> anyhow::Result<u32> {
    let n = parse_count(raw)?;
    if n == 0 {
        bail!("amount must be greater than zero");
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("").unwrap(), None);
        assert_eq!(parse_command("use").unwrap(), Some(Command::Use(1)));
        assert_eq!(parse_command("USE 3").unwrap(), Some(Command::Use(3)));
        assert_eq!(parse_command(" grant 5 ").unwrap(), Some(Command::Grant(5)));
        assert_eq!(parse_command("reset 0").unwrap(), Some(Command::Reset(0)));
        assert_eq!(parse_command("refresh").unwrap(), Some(Command::Refresh));
        assert_eq!(parse_command("exit").unwrap(), Some(Command::Quit));
    }

    #[tokio::test]
    async fn grant_and_refresh_report_their_outcome() {
        use cq_core::{ports::MemoryKv, store::QuotaSettings};

        let store = QuotaStore::load(
            QuotaSettings::from(&Config::default()),
            Arc::new(MemoryKv::new()),
            Arc::new(SystemClock),
        )
        .await;

        assert_eq!(outcome(store.grant(Config::default().refresh_bonus)), "ok");
        assert_eq!(outcome(store.grant(0)), "denied");
        assert_eq!(outcome(store.consume(u32::MAX)), "denied");
    }

    #[test]
    fn rejects_bad_input() {
        for line in ["grant", "grant 0", "use -1", "use 1 2", "teleport", "refresh 3"] {
            assert!(parse_command(line).is_err(), "{line}");
        }
    }
}
