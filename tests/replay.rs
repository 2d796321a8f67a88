//! End-to-end replay tests: temp CSV files through the full pipeline into
//! a temp SQLite database, observing both the persisted rows and the
//! event bus.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use ais_sentinel::bus::{BusEvent, EventBus};
use ais_sentinel::config::AppConfig;
use ais_sentinel::database::{Db, DbBuilder, DbDropGuard};
use ais_sentinel::errors::SentinelError;
use ais_sentinel::models::{AlertFilter, AlertRecord, Mmsi, RuleType};
use ais_sentinel::replay::{ReplayController, ReplayRequest};

fn write_csv(dir: &TempDir, name: &str, rows: &[&str]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = File::create(&path).unwrap();
    writeln!(file, "mmsi,timestamp,lat,lon,sog,cog,heading").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    path
}

fn setup(dir: &TempDir) -> (DbDropGuard, Db, EventBus, ReplayController) {
    let guard = DbBuilder::new()
        .path(dir.path().join("sentinel.db"))
        .build()
        .unwrap();
    let db = guard.db();
    let bus = EventBus::default();
    let controller = ReplayController::new(db.clone(), bus.clone(), AppConfig::default());
    (guard, db, bus, controller)
}

fn request(path: PathBuf) -> ReplayRequest {
    ReplayRequest {
        path,
        speedup: f64::INFINITY,
        use_streaming: false,
        batch_size: 1,
    }
}

async fn wait_idle(controller: &ReplayController) {
    for _ in 0..2000 {
        if !controller.status().running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replay session did not finish in time");
}

/// Strip autoincrement ids so runs can be compared.
fn comparable(alerts: &[AlertRecord]) -> Vec<(String, i64, String, i64, String, String)> {
    let mut rows: Vec<_> = alerts
        .iter()
        .map(|a| {
            (
                a.mmsi.to_string(),
                a.timestamp.timestamp_millis(),
                a.rule_type.to_string(),
                a.severity,
                a.summary.clone(),
                a.evidence.to_string(),
            )
        })
        .collect();
    rows.sort();
    rows
}

#[tokio::test]
async fn teleport_short_gap_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, bus, controller) = setup(&dir);
    let path = write_csv(
        &dir,
        "teleport.csv",
        &[
            "200000001,2025-01-01T00:00:00,40.0,-70.0,12,90,90",
            "200000001,2025-01-01T00:01:00,40.0,-68.0,12,90,90",
        ],
    );

    let mut events = controller.subscribe();
    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    // The jump also trips the SOG-vs-implied mismatch; the teleport alert
    // is the one under test.
    let teleports = db
        .list_alerts(&AlertFilter {
            rule_type: Some(RuleType::Teleport),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(teleports.len(), 1);
    let alert = &teleports[0];
    assert_eq!(alert.severity, 100);
    assert_eq!(alert.evidence["tier"], "short");
    assert!(alert.evidence["implied_speed_kn"].as_f64().unwrap() > 5000.0);

    // every alert has exactly one position row with the same key
    let mmsi = Mmsi::try_from("200000001").unwrap();
    let track = db.vessel_track(&mmsi, None).unwrap();
    assert_eq!(track.len(), 2);
    assert_eq!(
        track
            .iter()
            .filter(|p| p.timestamp == alert.timestamp)
            .count(),
        1
    );

    // latest state mirrors the newest point and carries the severity high
    let latest = db.latest_vessel(&mmsi).unwrap().unwrap();
    assert_eq!(latest.timestamp, alert.timestamp);
    assert_eq!(latest.last_alert_severity, 100);

    // the bus saw the teleport alert and the final tick
    let mut saw_teleport = false;
    let mut final_tick = None;
    while let Some(event) = events.try_recv() {
        match event {
            BusEvent::Alert { data } => {
                saw_teleport |= data.rule_type == RuleType::Teleport;
            }
            BusEvent::Tick { processed } => final_tick = Some(processed),
            BusEvent::Error { message } => panic!("unexpected error event: {message}"),
        }
    }
    assert!(saw_teleport);
    assert_eq!(final_tick, Some(2));
    assert_eq!(bus.dropped_count(), 0);
}

#[tokio::test]
async fn tier2_teleport_on_medium_gap() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    // 15 km north in 300 s: ~97 kn, under the 100 kn tier-1 threshold
    let path = write_csv(
        &dir,
        "suspicious.csv",
        &[
            "200000002,2025-01-01T00:00:00,40.0,-70.0,,,",
            "200000002,2025-01-01T00:05:00,40.134904,-70.0,,,",
        ],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let alerts = db.list_alerts(&AlertFilter::default()).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_type, RuleType::TeleportT2);
    assert!((15..=60).contains(&alerts[0].severity));
    assert_eq!(alerts[0].evidence["tier"], "medium");
}

#[tokio::test]
async fn cooldown_keeps_one_alert_per_window() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    // Teleport-sized jumps at both 00:01 and 00:02; the second candidate
    // lands inside the 300 s cooldown.
    let path = write_csv(
        &dir,
        "repeat.csv",
        &[
            "200000003,2025-01-01T00:00:00,40.0,-70.0,12,90,90",
            "200000003,2025-01-01T00:01:00,40.0,-68.0,12,90,90",
            "200000003,2025-01-01T00:02:00,40.0,-66.0,12,90,90",
        ],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let teleports = db
        .list_alerts(&AlertFilter {
            rule_type: Some(RuleType::Teleport),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(teleports.len(), 1);
    assert_eq!(teleports[0].timestamp.timestamp(), 1_735_689_660);
}

#[tokio::test]
async fn out_of_bounds_position_needs_no_history() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    let path = write_csv(
        &dir,
        "bounds.csv",
        &["200000004,2025-01-01T00:00:00,95.0,0.0,,,"],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let alerts = db.list_alerts(&AlertFilter::default()).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_type, RuleType::PositionInvalid);
    assert_eq!(alerts[0].severity, 75);
    assert_eq!(alerts[0].evidence["reason"], "out_of_bounds");
}

#[tokio::test]
async fn sharp_turn_at_speed() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    // Heading swings 60 degrees in 10 s at 25 kn while the position
    // advances consistently with the reported speed.
    let path = write_csv(
        &dir,
        "turn.csv",
        &[
            "300000001,2025-01-01T00:00:00,40.0,-70.0,25,,0",
            "300000001,2025-01-01T00:00:10,40.00116,-70.0,25,,60",
        ],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let alerts = db.list_alerts(&AlertFilter::default()).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_type, RuleType::TurnRate);
    assert!(alerts[0].severity >= 80);
}

#[tokio::test]
async fn impossible_acceleration() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    let path = write_csv(
        &dir,
        "accel.csv",
        &[
            "200000006,2025-01-01T00:00:00,40.0,-70.0,5,,",
            "200000006,2025-01-01T00:00:10,40.0,-70.0,50,,",
        ],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let alerts = db.list_alerts(&AlertFilter::default()).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_type, RuleType::Acceleration);
    assert_eq!(alerts[0].evidence["accel_knots_per_sec"], 4.5);
}

#[tokio::test]
async fn heading_cog_divergence() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    // Heading and COG disagree by 180 degrees at 20 kn while the bow
    // swings 18 deg/s.
    let path = write_csv(
        &dir,
        "divergence.csv",
        &[
            "200000007,2025-01-01T00:00:00,40.0,-70.0,20,88,90",
            "200000007,2025-01-01T00:00:05,40.0005,-70.0,20,0,180",
        ],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let divergences = db
        .list_alerts(&AlertFilter {
            rule_type: Some(RuleType::HeadingCogConsistency),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(divergences.len(), 1);
    assert_eq!(divergences[0].severity, 85);
    assert_eq!(divergences[0].evidence["angle_change_deg"], 180.0);
}

#[tokio::test]
async fn streaming_and_buffered_agree() {
    let dir = TempDir::new().unwrap();
    let rows = [
        "200000001,2025-01-01T00:00:00,40.0,-70.0,12,90,90",
        "200000008,2025-01-01T00:00:30,60.0,25.0,8,180,181",
        "200000001,2025-01-01T00:01:00,40.0,-68.0,12,90,90",
        "200000008,2025-01-01T00:01:30,60.001,25.0,8,180,181",
        "200000001,2025-01-01T00:02:00,40.0,-67.9,12,90,90",
    ];

    let mut outcomes = Vec::new();
    for use_streaming in [false, true] {
        let run_dir = TempDir::new().unwrap();
        let (_guard, db, _bus, controller) = setup(&run_dir);
        let path = write_csv(&dir, &format!("agree-{use_streaming}.csv"), &rows);
        controller
            .start(ReplayRequest {
                use_streaming,
                ..request(path)
            })
            .unwrap();
        wait_idle(&controller).await;
        outcomes.push(comparable(&db.list_alerts(&AlertFilter::default()).unwrap()));
    }

    assert!(!outcomes[0].is_empty());
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn replay_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let rows = [
        "200000001,2025-01-01T00:00:00,40.0,-70.0,12,90,90",
        "200000001,2025-01-01T00:01:00,40.0,-68.0,12,90,90",
        "200000009,2025-01-01T00:01:30,0.0,0.0,1,,",
        "200000001,2025-01-01T00:07:00,40.0,-66.0,12,90,90",
    ];

    let mut outcomes = Vec::new();
    for run in 0..2 {
        let run_dir = TempDir::new().unwrap();
        let (_guard, db, _bus, controller) = setup(&run_dir);
        let path = write_csv(&dir, &format!("determinism-{run}.csv"), &rows);
        controller.start(request(path)).unwrap();
        wait_idle(&controller).await;
        outcomes.push(comparable(&db.list_alerts(&AlertFilter::default()).unwrap()));
    }

    assert!(!outcomes[0].is_empty());
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn header_only_file_completes_with_zero_processed() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    let path = write_csv(&dir, "empty.csv", &[]);

    let mut events = controller.subscribe();
    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    assert_eq!(controller.status().processed, 0);
    assert!(db.list_alerts(&AlertFilter::default()).unwrap().is_empty());

    let mut final_tick = None;
    while let Some(event) = events.try_recv() {
        if let BusEvent::Tick { processed } = event {
            final_tick = Some(processed);
        }
    }
    assert_eq!(final_tick, Some(0));
}

#[tokio::test]
async fn start_rejects_bad_paths_and_parameters() {
    let dir = TempDir::new().unwrap();
    let (_guard, _db, _bus, controller) = setup(&dir);

    assert!(matches!(
        controller.start(request(dir.path().join("missing.csv"))),
        Err(SentinelError::SourceMissing { .. })
    ));
    assert!(!controller.status().running);

    let path = write_csv(
        &dir,
        "ok.csv",
        &["200000001,2025-01-01T00:00:00,40.0,-70.0,12,90,90"],
    );
    assert!(matches!(
        controller.start(ReplayRequest {
            speedup: 0.0,
            ..request(path.clone())
        }),
        Err(SentinelError::Configuration { .. })
    ));
    assert!(matches!(
        controller.start(ReplayRequest {
            batch_size: 0,
            ..request(path.clone())
        }),
        Err(SentinelError::Configuration { .. })
    ));

    // a failed start leaves the slot usable
    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;
    assert_eq!(controller.status().processed, 1);
}

#[tokio::test]
async fn single_session_and_idempotent_stop() {
    let dir = TempDir::new().unwrap();
    let (_guard, _db, _bus, controller) = setup(&dir);
    // 1000 s gaps at real-time pacing keep the session alive until stopped.
    let path = write_csv(
        &dir,
        "slow.csv",
        &[
            "200000001,2025-01-01T00:00:00,40.0,-70.0,12,90,90",
            "200000001,2025-01-01T00:16:40,40.1,-70.0,12,90,90",
            "200000001,2025-01-01T00:33:20,40.2,-70.0,12,90,90",
        ],
    );

    controller
        .start(ReplayRequest {
            speedup: 1.0,
            ..request(path.clone())
        })
        .unwrap();

    // a second start while running is rejected
    assert!(matches!(
        controller.start(request(path)),
        Err(SentinelError::AlreadyRunning)
    ));

    // wait for the first point to be processed, then stop twice
    for _ in 0..2000 {
        if controller.status().processed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    controller.stop().unwrap();
    controller.stop().unwrap();
    assert!(controller.status().stop_requested);

    wait_idle(&controller).await;
    let processed = controller.status().processed;
    assert!(processed >= 1 && processed < 3, "processed {processed}");

    // stop with no session is a state error
    assert!(matches!(controller.stop(), Err(SentinelError::NotRunning)));
}

#[tokio::test]
async fn alert_workflow_after_replay() {
    let dir = TempDir::new().unwrap();
    let (_guard, db, _bus, controller) = setup(&dir);
    let path = write_csv(
        &dir,
        "workflow.csv",
        &[
            "200000001,2025-01-01T00:00:00,40.0,-70.0,12,90,90",
            "200000001,2025-01-01T00:01:00,40.0,-68.0,12,90,90",
        ],
    );

    controller.start(request(path)).unwrap();
    wait_idle(&controller).await;

    let alerts = db.list_alerts(&AlertFilter::default()).unwrap();
    let updated = db
        .update_alert_status(
            alerts[0].id,
            ais_sentinel::models::AlertStatus::FalsePositive,
            Some("sensor glitch"),
        )
        .unwrap();
    assert_eq!(updated.status, ais_sentinel::models::AlertStatus::FalsePositive);

    let exported = db.export_alerts_csv(&AlertFilter::default()).unwrap();
    assert!(exported.contains("false_positive"));
    assert!(exported.contains("sensor glitch"));
}
