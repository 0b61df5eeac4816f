//! Replay a recorded or synthetic series through the engine.
//!
//! Usage:
//!   replay --csv samples.csv [--domain market] [--tick-every 10]
//!   replay --synthetic 42 [--domain physiological] [--env-config]
//!
//! `--env-config` replaces the profile's configuration with the defaults
//! overridden by `FRACTURE_*` environment variables.
//!
//! CSV rows are `source,value,ts_ms`; blank lines, `#` comments and a header
//! row are skipped. Every emitted engine event is printed as one JSON line.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use fracture_engine::clock::ManualClock;
use fracture_engine::config::EngineConfig;
use fracture_engine::domains::DomainProfile;
use fracture_engine::logging::{log, obj, v_str, Domain, Level};
use fracture_engine::synthetic::{ar1, step_spike, white_noise};
use fracture_engine::{EngineError, FractureEngine};

const SUBJECT: &str = "replay";

struct Args {
    csv: Option<String>,
    synthetic: Option<u64>,
    domain: String,
    tick_every: usize,
    env_config: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        csv: None,
        synthetic: None,
        domain: "generic".to_string(),
        tick_every: 10,
        env_config: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let mut value = || it.next().ok_or_else(|| anyhow!("{} needs a value", flag));
        match flag.as_str() {
            "--csv" => args.csv = Some(value()?),
            "--synthetic" => args.synthetic = Some(value()?.parse::<u64>().context("--synthetic expects a seed")?),
            "--domain" => args.domain = value()?,
            "--env-config" => args.env_config = true,
            "--tick-every" => args.tick_every = value()?.parse::<usize>().context("--tick-every expects a count")?,
            other => bail!("unknown argument: {}", other),
        }
    }
    if args.csv.is_none() && args.synthetic.is_none() {
        bail!("usage: replay (--csv <file> | --synthetic <seed>) [--domain <d>] [--tick-every <n>] [--env-config]");
    }
    args.tick_every = args.tick_every.max(1);
    Ok(args)
}

/// (source, value, ts) rows from a CSV file.
fn load_csv(path: &str) -> Result<Vec<(String, f64, u64)>> {
    let file = File::open(path).with_context(|| format!("open {}", path))?;
    let mut rows = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.to_lowercase().starts_with("source,") {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            bail!("line {}: expected source,value,ts", n + 1);
        }
        let value: f64 = parts[1]
            .parse()
            .with_context(|| format!("line {}: bad value {:?}", n + 1, parts[1]))?;
        let ts: u64 = parts[2]
            .parse()
            .with_context(|| format!("line {}: bad timestamp {:?}", n + 1, parts[2]))?;
        rows.push((parts[0].to_string(), value, ts));
    }
    Ok(rows)
}

/// Calm stretch, slowing-down drift, then a spike; one sample per second.
fn synthetic_rows(seed: u64) -> Vec<(String, f64, u64)> {
    let mut values = white_noise(seed, 150, 100.0, 0.5);
    values.extend(ar1(seed.wrapping_add(1), 100, 100.0, 0.95, 3.0));
    values.extend(step_spike(0, 20, 100.0, 3.0));
    values.extend(white_noise(seed.wrapping_add(2), 80, 100.0, 0.5));
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| ("signal".to_string(), v, i as u64 * 1_000))
        .collect()
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let mut profile = DomainProfile::by_name(&args.domain).ok_or_else(|| anyhow!("unknown domain {}", args.domain))?;
    if args.env_config {
        profile.config = EngineConfig::from_env();
    }

    let rows = match (&args.csv, args.synthetic) {
        (Some(path), _) => load_csv(path)?,
        (None, Some(seed)) => synthetic_rows(seed),
        (None, None) => Vec::new(),
    };

    let clock = Arc::new(ManualClock::new(rows.first().map(|r| r.2).unwrap_or(0)));
    let engine = FractureEngine::new(clock.clone());
    engine.register_profile(SUBJECT, &profile)?;
    let mut events = engine.subscribe();

    log(
        Level::Info,
        Domain::System,
        "replay_start",
        obj(&[
            ("domain", v_str(&profile.name)),
            ("samples", serde_json::json!(rows.len())),
            ("fingerprint", v_str(&profile.config.fingerprint())),
        ]),
    );

    let mut rejected = 0usize;
    for (i, (source, value, ts)) in rows.iter().enumerate() {
        clock.set(*ts);
        match engine.ingest(SUBJECT, source, *value, *ts) {
            Ok(_) => {}
            Err(EngineError::InvalidSample { .. }) => rejected += 1,
            Err(err) => return Err(err.into()),
        }
        if (i + 1) % args.tick_every == 0 {
            engine.tick(SUBJECT)?;
            for event in events.drain() {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    let snapshot = engine.snapshot(SUBJECT)?;
    log(
        Level::Info,
        Domain::System,
        "replay_done",
        obj(&[
            ("ticks", serde_json::json!(snapshot.ticks)),
            ("rejected", serde_json::json!(rejected)),
            ("crisis_episodes", serde_json::json!(snapshot.crisis.confirmed_episodes)),
            ("interventions", serde_json::json!(snapshot.active_interventions.len() + snapshot.completed_interventions)),
        ]),
    );
    Ok(())
}
