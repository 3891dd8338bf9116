use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use sightings::engine::{ScanRequest, SeedRequest, SendRequest, UpdateRequest};
use sightings::token::{replacement_token, update_token};
use sightings::{Clock, Config, ManualClock, SightingsEngine};

fn config(dir: &Path) -> Config {
    Config {
        directory: dir.to_path_buf(),
        testing: true,
        ..Default::default()
    }
}

fn engine(dir: &Path) -> anyhow::Result<(Arc<SightingsEngine>, Arc<ManualClock>)> {
    let clock = Arc::new(ManualClock::new(10_000.0));
    let engine = SightingsEngine::open(config(dir), clock.clone() as Arc<dyn Clock>)?;
    Ok((Arc::new(engine), clock))
}

fn record(fields: Value) -> serde_json::Map<String, Value> {
    match fields {
        Value::Object(map) => map,
        _ => panic!("test records must be objects"),
    }
}

fn contact(id: &str, seed: &str, n: usize) -> serde_json::Map<String, Value> {
    record(json!({
        "id": id,
        "update_token": update_token(&replacement_token(seed, n)),
    }))
}

fn prefix_scan(prefixes: &[&str]) -> ScanRequest {
    ScanRequest {
        contact_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn send_then_prefix_scan() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;

    let req = SendRequest {
        contact_ids: vec![contact("DEADBEEF01", "seed-a", 0)],
        status: Some(json!("green")),
        ..Default::default()
    };
    engine.send_status(&req, 10_000.0)?;

    // case-insensitive prefix, half-open window
    let feed = engine.scan_status(&prefix_scan(&["de"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 1);
    assert_eq!(feed.contact_ids[0]["id"], "DEADBEEF01");
    assert_eq!(feed.contact_ids[0]["status"], "green");
    assert!(!feed.more_data);

    // window starts after the record
    let feed = engine.scan_status(&prefix_scan(&["de"]), 10_500.0, 11_000.0).await?;
    assert!(feed.contact_ids.is_empty());

    // window ends exactly at the record: excluded
    let feed = engine.scan_status(&prefix_scan(&["de"]), 0.0, 10_000.0).await?;
    assert!(feed.contact_ids.is_empty());

    // unrelated prefix
    let feed = engine.scan_status(&prefix_scan(&["ff"]), 0.0, 11_000.0).await?;
    assert!(feed.contact_ids.is_empty());
    Ok(())
}

#[tokio::test]
async fn update_amends_earlier_record() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    let seed = "update-seed";

    engine.send_status(
        &SendRequest {
            contact_ids: vec![contact("DEADBEEF01", seed, 0)],
            status: Some(json!("green")),
            ..Default::default()
        },
        10_000.0,
    )?;

    let fresh = update_token(&replacement_token("next-seed", 0));
    engine.status_update(
        &UpdateRequest {
            update_tokens: vec![fresh.clone()],
            replaces: Some(seed.to_string()),
            status: Some(json!("red")),
            length: Some(1),
        },
        10_100.0,
    )?;

    // the amendment is a new record; the original stays visible
    let feed = engine.scan_status(&prefix_scan(&["DEAD"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 2);
    let amended = feed
        .contact_ids
        .iter()
        .find(|c| c["status"] == "red")
        .expect("amended copy");
    assert_eq!(amended["replaces"], json!(replacement_token(seed, 0)));
    assert_eq!(amended["update_token"], json!(fresh));
    Ok(())
}

#[tokio::test]
async fn pending_update_applies_when_target_arrives() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    let seed = "early-update";

    // amendment first: its target has not been submitted yet
    let fresh = update_token(&replacement_token("early-next", 0));
    engine.status_update(
        &UpdateRequest {
            update_tokens: vec![fresh],
            replaces: Some(seed.to_string()),
            status: Some(json!("red")),
            length: Some(1),
        },
        10_000.0,
    )?;
    assert_eq!(engine.admin_status()["pending_updates"], 1);

    engine.send_status(
        &SendRequest {
            contact_ids: vec![contact("CAFEBABE01", seed, 0)],
            status: Some(json!("green")),
            ..Default::default()
        },
        10_100.0,
    )?;
    assert_eq!(engine.admin_status()["pending_updates"], 0);

    let feed = engine.scan_status(&prefix_scan(&["CAFE"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 2);
    assert!(feed.contact_ids.iter().any(|c| c["status"] == "red"));
    Ok(())
}

#[tokio::test]
async fn tokenless_pending_patch_survives_late_arrival() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    let seed = "result-first";

    // a result patch carries no fresh update token; held until the target
    // arrives
    engine.status_result(
        &SeedRequest {
            seed: Some(seed.to_string()),
            status: Some(json!("red")),
        },
        10_000.0,
    )?;
    assert!(engine.admin_status()["pending_updates"].as_u64().unwrap_or(0) >= 1);

    engine.send_status(
        &SendRequest {
            contact_ids: vec![contact("DEADBEEF01", seed, 0)],
            status: Some(json!("green")),
            ..Default::default()
        },
        10_100.0,
    )?;

    let feed = engine.scan_status(&prefix_scan(&["DEAD"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 2, "amended copy must materialize");
    let amended = feed
        .contact_ids
        .iter()
        .find(|c| c["status"] == "red")
        .expect("amended copy");
    // the copy must not reuse the target's token
    assert_eq!(amended.get("update_token"), None);
    Ok(())
}

#[tokio::test]
async fn non_ascii_id_is_rejected_cleanly() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    let req = SendRequest {
        contact_ids: vec![record(json!({ "id": "aé0000" }))],
        ..Default::default()
    };
    let err = engine.send_status(&req, 10_000.0).expect_err("must reject");
    assert!(err.to_string().contains("ASCII"));
    assert_eq!(engine.admin_status()["contacts_count"], 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;

    let req = SendRequest {
        contact_ids: vec![contact("DEADBEEF01", "dup-seed", 0)],
        ..Default::default()
    };
    engine.send_status(&req, 10_000.0)?;
    engine.send_status(&req, 10_200.0)?;

    let feed = engine.scan_status(&prefix_scan(&["DEAD"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 1);
    Ok(())
}

#[tokio::test]
async fn status_result_walks_the_whole_chain() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    let seed = "result-seed";

    engine.send_status(
        &SendRequest {
            contact_ids: (0..3)
                .map(|n| contact(&format!("DEADBEEF0{n}"), seed, n))
                .collect(),
            status: Some(json!("unknown")),
            ..Default::default()
        },
        10_000.0,
    )?;

    engine.status_result(
        &SeedRequest {
            seed: Some(seed.to_string()),
            status: Some(json!("red")),
        },
        10_100.0,
    )?;

    let feed = engine.scan_status(&prefix_scan(&["DEADBEEF"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 6);
    assert_eq!(
        feed.contact_ids.iter().filter(|c| c["status"] == "red").count(),
        3
    );

    // data_points resolves the same chain
    let points = engine.data_points(seed, 11_000.0).await?;
    assert_eq!(points.contact_ids.len(), 3);
    Ok(())
}

#[tokio::test]
async fn reset_reloads_from_disk_only_under_testing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    engine.send_status(
        &SendRequest {
            contact_ids: vec![contact("DEADBEEF01", "reset-seed", 0)],
            ..Default::default()
        },
        10_000.0,
    )?;
    assert!(engine.reset()?);
    let feed = engine.scan_status(&prefix_scan(&["DEAD"]), 0.0, 11_000.0).await?;
    assert_eq!(feed.contact_ids.len(), 1, "reload keeps persisted records");

    let prod_dir = TempDir::new()?;
    let prod = SightingsEngine::open(
        Config {
            directory: prod_dir.path().to_path_buf(),
            testing: false,
            ..Default::default()
        },
        Arc::new(ManualClock::new(10_000.0)) as Arc<dyn Clock>,
    )?;
    assert!(!prod.reset()?);
    Ok(())
}

#[test]
fn init_reports_query_parameters_and_counts() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (engine, _clock) = engine(dir.path())?;
    let ret = engine.record_init(&record(json!({
        "application_name": "sightings-app",
        "region": "test",
    })));
    assert_eq!(ret["bounding_box_minimum_dp"], 2);
    assert_eq!(ret["prefix_bits"], 20);

    let stats = &engine.admin_status()["statistics"];
    assert_eq!(stats["application_name"], 1);
    assert_eq!(stats["region"], 1);
    assert_eq!(stats["language"], 0);
    Ok(())
}
