use clap::Parser;
use mmo_lanes_server::auth::DevAuthenticator;
use mmo_lanes_server::bot::{Bot, BotPhase};
use mmo_lanes_server::config::{PlacementKind, ServerConfig};
use mmo_lanes_server::constants::tick_duration_ms;
use mmo_lanes_server::coordinator::ControlRequest;
use mmo_lanes_server::runtime::{assemble, Assembly};
use mmo_lanes_server::transport::MemoryTransport;
use mmo_lanes_server::types::{AccountId, InstanceKey, MatchSeat, MatchSpec};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const SIM_TICK_RATE: u32 = 20;
const MATCH_ID: u64 = 1;
const MATCH_SEATS: usize = 4;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Run only the named scenario.
    #[arg(long)]
    scenario: Option<String>,
    #[arg(long, default_value_t = 8)]
    bots: usize,
    #[arg(long, default_value_t = 2)]
    lanes: usize,
    #[arg(long, default_value_t = 400)]
    ticks: u64,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
struct Scenario {
    name: String,
    bots: usize,
    lanes: usize,
    ticks: u64,
    placement: PlacementKind,
    #[serde(rename = "withMatch")]
    with_match: bool,
    seed: u64,
}

#[derive(Clone, Debug, Serialize)]
struct ScenarioResultLine {
    scenario: String,
    seed: u64,
    bots: usize,
    lanes: usize,
    ticks: u64,
    placement: PlacementKind,
    #[serde(rename = "botsPlaying")]
    bots_playing: usize,
    #[serde(rename = "lanesUsed")]
    lanes_used: usize,
    #[serde(rename = "maxEntitiesSeen")]
    max_entities_seen: usize,
    #[serde(rename = "messagesReceived")]
    messages_received: u64,
    #[serde(rename = "chatsReceived")]
    chats_received: u64,
    #[serde(rename = "matchRoundTrips")]
    match_round_trips: usize,
    anomalies: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct AnomalyRecord {
    tick: u64,
    message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ScenarioRunResult {
    #[serde(flatten)]
    result: ScenarioResultLine,
    #[serde(rename = "anomalyRecords")]
    anomaly_records: Vec<AnomalyRecord>,
}

#[derive(Clone, Debug, Serialize)]
struct RunSummary {
    #[serde(rename = "runId")]
    run_id: String,
    #[serde(rename = "startedAtMs")]
    started_at_ms: u64,
    #[serde(rename = "finishedAtMs")]
    finished_at_ms: u64,
    #[serde(rename = "scenarioCount")]
    scenario_count: usize,
    #[serde(rename = "anomalyCount")]
    anomaly_count: usize,
    #[serde(rename = "placementCounts")]
    placement_counts: BTreeMap<String, usize>,
    scenarios: Vec<ScenarioResultLine>,
}

#[derive(Clone, Debug, Serialize)]
struct StructuredLogLine {
    #[serde(rename = "timestampMs")]
    timestamp_ms: u64,
    level: String,
    event: String,
    #[serde(rename = "runId")]
    run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tick: Option<u64>,
    details: Value,
}

#[derive(Default)]
struct AnomalyLog {
    messages: Vec<String>,
    records: Vec<AnomalyRecord>,
    seen: HashSet<String>,
}

impl AnomalyLog {
    fn push(&mut self, tick: u64, message: String) {
        push_anomaly(
            &mut self.messages,
            &mut self.records,
            &mut self.seen,
            tick,
            message,
        );
    }
}

fn main() {
    let cli = Cli::parse();
    let scenarios = resolve_scenarios(&cli);
    let run_started_at_ms = now_ms();
    let seed_hint = scenarios.first().map(|scenario| scenario.seed).unwrap_or(0);
    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| default_run_id(seed_hint, run_started_at_ms));
    let mut has_anomaly = false;
    let mut scenario_results = Vec::new();
    let mut placement_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_anomalies = 0usize;

    if scenarios.is_empty() {
        emit_log(
            "error",
            "unknown_scenario",
            &run_id,
            cli.scenario.as_deref(),
            None,
            json!({ "known": ["hub_first_lane", "hub_round_robin", "match_round_trip"] }),
        );
        std::process::exit(2);
    }

    for scenario in scenarios {
        emit_log(
            "info",
            "scenario_started",
            &run_id,
            Some(&scenario.name),
            None,
            json!({
                "bots": scenario.bots,
                "lanes": scenario.lanes,
                "ticks": scenario.ticks,
                "placement": scenario.placement,
                "withMatch": scenario.with_match,
                "seed": scenario.seed,
            }),
        );
        let scenario_run = match run_scenario(&scenario) {
            Ok(run) => run,
            Err(err) => {
                emit_log(
                    "error",
                    "scenario_setup_failed",
                    &run_id,
                    Some(&scenario.name),
                    None,
                    json!({ "error": err }),
                );
                std::process::exit(2);
            }
        };

        for anomaly in &scenario_run.anomaly_records {
            emit_log(
                "warn",
                "anomaly_detected",
                &run_id,
                Some(&scenario.name),
                Some(anomaly.tick),
                json!({ "message": anomaly.message }),
            );
        }

        if !scenario_run.result.anomalies.is_empty() {
            has_anomaly = true;
        }
        total_anomalies += scenario_run.anomaly_records.len();
        *placement_counts
            .entry(placement_key(scenario.placement))
            .or_insert(0) += 1;

        emit_log(
            "info",
            "scenario_finished",
            &run_id,
            Some(&scenario.name),
            Some(scenario.ticks),
            json!({
                "botsPlaying": scenario_run.result.bots_playing,
                "lanesUsed": scenario_run.result.lanes_used,
                "matchRoundTrips": scenario_run.result.match_round_trips,
                "anomalyCount": scenario_run.anomaly_records.len(),
            }),
        );

        match serde_json::to_string(&scenario_run.result) {
            Ok(line) => println!("{line}"),
            Err(err) => {
                emit_log(
                    "error",
                    "result_encode_failed",
                    &run_id,
                    Some(&scenario.name),
                    None,
                    json!({ "error": err.to_string() }),
                );
                std::process::exit(2);
            }
        }
        scenario_results.push(scenario_run.result);
    }

    let summary = build_run_summary(
        run_id.clone(),
        run_started_at_ms,
        now_ms(),
        scenario_results,
        placement_counts,
        total_anomalies,
    );

    let mut summary_out_written: Option<String> = None;
    if let Some(path) = cli.summary_out.as_ref() {
        if let Err(error) = write_summary(path, &summary) {
            emit_log(
                "error",
                "summary_write_failed",
                &run_id,
                None,
                None,
                json!({
                    "path": path.to_string_lossy(),
                    "error": error.to_string(),
                }),
            );
            std::process::exit(2);
        }
        summary_out_written = Some(path.to_string_lossy().to_string());
    }

    emit_log(
        "info",
        "run_finished",
        &run_id,
        None,
        None,
        json!({
            "scenarioCount": summary.scenario_count,
            "anomalyCount": summary.anomaly_count,
            "placementCounts": summary.placement_counts,
            "summaryOut": summary_out_written,
        }),
    );

    if has_anomaly {
        std::process::exit(1);
    }
}

fn scenario_config(scenario: &Scenario) -> ServerConfig {
    ServerConfig {
        lanes: scenario.lanes,
        tick_rate: SIM_TICK_RATE,
        max_clients: scenario.bots.max(1) * 2,
        queue_capacity: scenario.bots.max(1) * 4,
        outbound_capacity: 1024,
        placement: scenario.placement,
        seed: scenario.seed,
        match_duration_ms: 3_000,
        match_connect_timeout_ms: 1_000,
        ..ServerConfig::default()
    }
}

fn run_scenario(scenario: &Scenario) -> Result<ScenarioRunResult, String> {
    let config = scenario_config(scenario);
    let transport = Arc::new(MemoryTransport::new(config.outbound_capacity));
    let mut assembly = assemble(&config, transport.clone(), Box::new(DevAuthenticator::new()))
        .map_err(|err| err.to_string())?;

    let mut bots: Vec<Bot> = (0..scenario.bots)
        .map(|idx| {
            Bot::connect(
                transport.clone(),
                &format!("bot-{:02}", idx + 1),
                scenario.seed.wrapping_add(idx as u64),
            )
        })
        .collect();

    let mut anomalies = AnomalyLog::default();
    let mut max_entities_seen = 0usize;
    let mut match_requested = false;
    let match_at = scenario.ticks / 4;
    let started = Instant::now();
    let tick_ms = tick_duration_ms(config.tick_rate);

    for tick in 1..=scenario.ticks {
        let now = started + Duration::from_millis(tick * tick_ms);
        assembly.step(now);

        for bot in &mut bots {
            bot.poll();
            bot.act(tick);
            max_entities_seen = max_entities_seen.max(bot.known_entities());
        }

        if scenario.with_match && !match_requested && tick >= match_at {
            let seats: Vec<MatchSeat> = bots
                .iter()
                .filter_map(Bot::account_id)
                .take(MATCH_SEATS)
                .map(|id| MatchSeat {
                    account_id: AccountId(id),
                    team: (id % 2) as u8,
                    class_type: 1,
                })
                .collect();
            let request = ControlRequest::CreateMatch(MatchSpec {
                match_id: MATCH_ID,
                seats,
                bots: 2,
            });
            if let Err(err) = assembly.control.try_send(request) {
                anomalies.push(tick, format!("match request refused: {err}"));
            }
            match_requested = true;
        }

        for message in collect_ownership_anomalies(&assembly, &bots) {
            anomalies.push(tick, message);
        }
        for message in collect_bijection_anomalies(&assembly) {
            anomalies.push(tick, message);
        }
    }

    for bot in &bots {
        for message in bot.anomalies() {
            anomalies.push(scenario.ticks, format!("{}: {message}", bot.nickname()));
        }
        if bot.phase() == BotPhase::Closed {
            anomalies.push(
                scenario.ticks,
                format!("{} was disconnected", bot.nickname()),
            );
        }
    }

    let bots_playing = bots
        .iter()
        .filter(|bot| bot.phase() == BotPhase::Playing)
        .count();
    if bots_playing < bots.len() {
        anomalies.push(
            scenario.ticks,
            format!("{} of {} bots never finished loading", bots.len() - bots_playing, bots.len()),
        );
    }

    let lanes_used = assembly
        .lanes
        .iter()
        .filter(|lane| !lane.owned_handles().is_empty())
        .count();
    if scenario.placement == PlacementKind::RoundRobin
        && scenario.bots >= scenario.lanes
        && lanes_used < scenario.lanes
    {
        anomalies.push(
            scenario.ticks,
            format!("round robin used {lanes_used} of {} lanes", scenario.lanes),
        );
    }

    // hub -> match -> hub
    let match_round_trips = bots
        .iter()
        .filter(|bot| bot.instances_entered() >= 3 && bot.instance() == Some(InstanceKey::Hub))
        .count();
    if scenario.with_match {
        let expected = scenario.bots.min(MATCH_SEATS);
        if match_round_trips < expected {
            anomalies.push(
                scenario.ticks,
                format!("only {match_round_trips} of {expected} match players returned to the hub"),
            );
        }
    }

    let result = ScenarioResultLine {
        scenario: scenario.name.clone(),
        seed: scenario.seed,
        bots: scenario.bots,
        lanes: scenario.lanes,
        ticks: scenario.ticks,
        placement: scenario.placement,
        bots_playing,
        lanes_used,
        max_entities_seen,
        messages_received: bots.iter().map(Bot::messages_received).sum(),
        chats_received: bots.iter().map(Bot::chats_received).sum(),
        match_round_trips,
        anomalies: anomalies.messages,
    };
    Ok(ScenarioRunResult {
        result,
        anomaly_records: anomalies.records,
    })
}

fn collect_ownership_anomalies(assembly: &Assembly, bots: &[Bot]) -> Vec<String> {
    bots.iter()
        .filter_map(|bot| {
            let owners = assembly.owners_of(bot.handle());
            (owners.len() > 1).then(|| format!("{} owned by {owners:?}", bot.handle()))
        })
        .collect()
}

fn collect_bijection_anomalies(assembly: &Assembly) -> Vec<String> {
    let mut anomalies = Vec::new();
    for lane in &assembly.lanes {
        for key in lane.instance_keys() {
            let Some(instance) = lane.instance(key) else {
                continue;
            };
            let engine = instance.engine();
            for handle in engine.in_game() {
                if !engine.check_bijection(handle) {
                    anomalies.push(format!("{key} on {}: local ids diverged for {handle}", lane.id()));
                }
            }
        }
    }
    anomalies
}

fn resolve_scenarios(cli: &Cli) -> Vec<Scenario> {
    let seed = cli.seed.unwrap_or(1);
    let lanes = cli.lanes.max(1);
    let bots = cli.bots.max(1);
    let ticks = cli.ticks.max(100);
    let all = vec![
        Scenario {
            name: "hub_first_lane".to_string(),
            bots,
            lanes,
            ticks,
            placement: PlacementKind::FirstLane,
            with_match: false,
            seed,
        },
        Scenario {
            name: "hub_round_robin".to_string(),
            bots,
            lanes,
            ticks,
            placement: PlacementKind::RoundRobin,
            with_match: false,
            seed: seed.wrapping_add(1),
        },
        Scenario {
            name: "match_round_trip".to_string(),
            bots,
            lanes,
            ticks,
            placement: PlacementKind::RoundRobin,
            with_match: true,
            seed: seed.wrapping_add(2),
        },
    ];
    match cli.scenario.as_deref() {
        Some(name) => all.into_iter().filter(|scenario| scenario.name == name).collect(),
        None => all,
    }
}

fn push_anomaly(
    anomalies: &mut Vec<String>,
    anomaly_records: &mut Vec<AnomalyRecord>,
    anomaly_seen: &mut HashSet<String>,
    tick: u64,
    message: String,
) {
    anomaly_records.push(AnomalyRecord {
        tick,
        message: message.clone(),
    });
    if anomaly_seen.insert(message.clone()) {
        anomalies.push(message);
    }
}

fn default_run_id(seed: u64, timestamp_ms: u64) -> String {
    format!("sim-{seed}-{timestamp_ms}")
}

fn placement_key(placement: PlacementKind) -> String {
    match placement {
        PlacementKind::FirstLane => "first_lane",
        PlacementKind::RoundRobin => "round_robin",
    }
    .to_string()
}

fn build_run_summary(
    run_id: String,
    started_at_ms: u64,
    finished_at_ms: u64,
    scenarios: Vec<ScenarioResultLine>,
    placement_counts: BTreeMap<String, usize>,
    anomaly_count: usize,
) -> RunSummary {
    RunSummary {
        run_id,
        started_at_ms,
        finished_at_ms,
        scenario_count: scenarios.len(),
        anomaly_count,
        placement_counts,
        scenarios,
    }
}

fn emit_log(
    level: &str,
    event: &str,
    run_id: &str,
    scenario: Option<&str>,
    tick: Option<u64>,
    details: Value,
) {
    let log_line = StructuredLogLine {
        timestamp_ms: now_ms(),
        level: level.to_string(),
        event: event.to_string(),
        run_id: run_id.to_string(),
        scenario: scenario.map(|value| value.to_string()),
        tick,
        details,
    };
    match serde_json::to_string(&log_line) {
        Ok(line) => eprintln!("{line}"),
        Err(err) => eprintln!("{{\"level\":\"error\",\"event\":\"log_encode_failed\",\"error\":\"{err}\"}}"),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn write_summary(path: &Path, summary: &RunSummary) -> io::Result<()> {
    let summary_text = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
    std::fs::write(path, summary_text)
}
