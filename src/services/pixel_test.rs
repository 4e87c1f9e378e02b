use std::sync::Barrier;

use super::*;
use crate::state::test_helpers::{self, stored};
use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

const T0: i64 = 1_700_000_000_000;
const MINUTE_MS: i64 = 60_000;

fn edit(x: i64, y: i64, color: &str) -> PixelEdit {
    PixelEdit { x, y, color: color.into() }
}

fn spectator(state: &AppState) -> mpsc::Receiver<Utf8Bytes> {
    let (tx, rx) = mpsc::channel(16);
    state.broadcaster.register(Uuid::new_v4(), tx);
    rx
}

async fn recv_json(rx: &mut mpsc::Receiver<Utf8Bytes>) -> serde_json::Value {
    let text = timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("broadcast timed out")
        .expect("channel closed");
    serde_json::from_str(text.as_str()).unwrap()
}

#[tokio::test]
async fn accepted_edit_updates_canvas_broadcasts_and_persists() {
    let (state, repo) = test_helpers::test_app_state();
    let mut rx = spectator(&state);
    let client = Uuid::new_v4();

    assert_eq!(apply_edit(&state, client, &edit(3, 4, "#ff0000"), T0), Ok(EditOutcome::Applied));

    assert_eq!(state.lock_canvas().get_pixel(3, 4).color, "#FF0000");
    assert_eq!(
        recv_json(&mut rx).await,
        serde_json::json!({"type": "pixel_update", "x": 3, "y": 4, "color": "#FF0000"})
    );

    state.persistence.flush().await.unwrap();
    assert_eq!(repo.rows(), vec![stored(3, 4, "#FF0000", T0)]);
}

#[tokio::test]
async fn second_edit_within_cooldown_is_rejected() {
    let (state, _repo) = test_helpers::test_app_state();
    let client = Uuid::new_v4();
    apply_edit(&state, client, &edit(0, 0, "#FF0000"), T0).unwrap();

    let err = apply_edit(&state, client, &edit(1, 1, "#FF0000"), T0 + 30_000).unwrap_err();
    assert_eq!(err, EditError::Cooldown(Duration::from_secs(30)));
    assert_eq!(err.to_string(), "Wait 30.0 seconds between pixels");
    assert_eq!(state.lock_canvas().get_pixel(1, 1).last_update, 0);

    assert_eq!(apply_edit(&state, client, &edit(1, 1, "#FF0000"), T0 + MINUTE_MS + 1000), Ok(EditOutcome::Applied));
}

#[tokio::test]
async fn cooldown_is_per_client() {
    let (state, _repo) = test_helpers::test_app_state();
    apply_edit(&state, Uuid::new_v4(), &edit(0, 0, "#FF0000"), T0).unwrap();
    assert_eq!(apply_edit(&state, Uuid::new_v4(), &edit(0, 1, "#FF0000"), T0), Ok(EditOutcome::Applied));
}

#[tokio::test]
async fn redundant_repaint_consumes_cooldown_without_side_effects() {
    let (state, repo) = test_helpers::test_app_state();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    apply_edit(&state, first, &edit(5, 5, "#FF0000"), T0).unwrap();
    state.persistence.flush().await.unwrap();

    let mut rx = spectator(&state);
    assert_eq!(apply_edit(&state, second, &edit(5, 5, "#FF0000"), T0 + 1), Ok(EditOutcome::Unchanged));

    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    assert_eq!(state.lock_canvas().get_pixel(5, 5).last_update, T0);
    assert_eq!(state.persistence.flush().await, Ok(0));
    assert_eq!(repo.upsert_batches().len(), 1);
    assert!(!state.rate_limiter.allow(second, T0 + 2));
}

#[tokio::test]
async fn out_of_bounds_is_rejected_without_consuming_cooldown() {
    let (state, _repo) = test_helpers::test_app_state();
    let client = Uuid::new_v4();

    for (x, y) in [(10, 0), (0, 10), (-1, 0), (0, i64::MAX)] {
        let err = apply_edit(&state, client, &edit(x, y, "#FF0000"), T0).unwrap_err();
        assert_eq!(err, EditError::OutOfBounds);
    }
    assert_eq!(EditError::OutOfBounds.to_string(), "Invalid pixel coordinates");
    assert!(state.rate_limiter.allow(client, T0));
    assert_eq!(state.lock_canvas().active_count(), 0);
}

#[tokio::test]
async fn malformed_color_is_rejected() {
    let (state, _repo) = test_helpers::test_app_state();
    let client = Uuid::new_v4();
    for color in ["red", "#FFF", "#GG0000", ""] {
        assert_eq!(apply_edit(&state, client, &edit(0, 0, color), T0), Err(EditError::InvalidColor));
    }
    assert!(state.rate_limiter.allow(client, T0));
}

#[tokio::test]
async fn palette_enforcement_rejects_off_palette_colors() {
    let mut config = test_helpers::test_config();
    config.canvas.enforce_palette = true;
    let (state, _repo) = test_helpers::test_app_state_with(config);

    assert_eq!(apply_edit(&state, Uuid::new_v4(), &edit(0, 0, "#123456"), T0), Err(EditError::InvalidColor));
    assert_eq!(apply_edit(&state, Uuid::new_v4(), &edit(0, 0, "#e50000"), T0), Ok(EditOutcome::Applied));
}

#[tokio::test]
async fn painting_default_color_erases_and_persists_erase() {
    let (state, repo) = test_helpers::test_app_state();
    apply_edit(&state, Uuid::new_v4(), &edit(2, 2, "#00FF00"), T0).unwrap();

    assert_eq!(apply_edit(&state, Uuid::new_v4(), &edit(2, 2, "#ffffff"), T0 + 5), Ok(EditOutcome::Applied));
    assert_eq!(state.lock_canvas().active_count(), 0);

    state.persistence.flush().await.unwrap();
    assert_eq!(repo.rows(), vec![stored(2, 2, "#FFFFFF", T0 + 5)]);
}

#[tokio::test]
async fn shutdown_refuses_edits() {
    let (state, _repo) = test_helpers::test_app_state();
    state.begin_shutdown();
    let err = apply_edit(&state, Uuid::new_v4(), &edit(0, 0, "#FF0000"), T0).unwrap_err();
    assert_eq!(err.to_string(), "Server is shutting down");
}

#[tokio::test]
async fn fanout_order_matches_acceptance_order() {
    let (state, _repo) = test_helpers::test_app_state();
    let mut rx = spectator(&state);
    for x in 0..5 {
        apply_edit(&state, Uuid::new_v4(), &edit(x, 0, "#FF0000"), T0 + x).unwrap();
    }
    for x in 0..5 {
        assert_eq!(recv_json(&mut rx).await["x"], x);
    }
}

// =============================================================================
// concurrency
// =============================================================================

fn coord_of(i: usize) -> (i64, i64) {
    let i = i64::try_from(i).unwrap();
    (i % 10, i / 10)
}

#[tokio::test]
async fn edit_blocked_on_canvas_lock_is_refused_once_shutdown_begins() {
    let (state, repo) = test_helpers::test_app_state();
    let mut rx = spectator(&state);

    let canvas = state.lock_canvas();
    let editor = {
        let state = state.clone();
        std::thread::spawn(move || apply_edit(&state, Uuid::new_v4(), &edit(1, 1, "#FF0000"), T0))
    };
    std::thread::sleep(Duration::from_millis(50));
    state.begin_shutdown();
    drop(canvas);

    assert_eq!(editor.join().unwrap(), Err(EditError::ShuttingDown));
    assert!(rx.try_recv().is_err());
    assert_eq!(state.lock_canvas().active_count(), 0);
    assert_eq!(state.persistence.flush().await, Ok(0));
    assert!(repo.rows().is_empty());
}

#[tokio::test]
async fn every_edit_accepted_before_drain_reaches_final_flush() {
    let (state, repo) = test_helpers::test_app_state();
    let editors = 16;
    let start = Barrier::new(editors + 1);

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..editors)
            .map(|i| {
                let (state, start) = (&state, &start);
                s.spawn(move || {
                    let (x, y) = coord_of(i);
                    start.wait();
                    apply_edit(state, Uuid::new_v4(), &edit(x, y, "#FF0000"), T0)
                })
            })
            .collect();
        start.wait();
        state.begin_shutdown();
        state.drain_edits();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let applied = outcomes.iter().filter(|o| **o == Ok(EditOutcome::Applied)).count();
    assert!(outcomes.iter().all(|o| matches!(o, Ok(EditOutcome::Applied) | Err(EditError::ShuttingDown))));
    assert_eq!(apply_edit(&state, Uuid::new_v4(), &edit(9, 9, "#FF0000"), T0), Err(EditError::ShuttingDown));

    assert_eq!(state.persistence.force_flush_all(Duration::from_secs(1)).await, Ok(applied));
    assert_eq!(repo.rows().len(), applied);
    assert_eq!(state.lock_canvas().active_count(), applied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_edits_from_one_client_accept_exactly_one() {
    let (state, _repo) = test_helpers::test_app_state();
    let client = Uuid::new_v4();
    let editors = 32;
    let start = Barrier::new(editors);

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..editors)
            .map(|i| {
                let (state, start) = (&state, &start);
                s.spawn(move || {
                    let (x, y) = coord_of(i);
                    start.wait();
                    apply_edit(state, client, &edit(x, y, "#FF0000"), T0)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let applied = outcomes.iter().filter(|o| **o == Ok(EditOutcome::Applied)).count();
    assert_eq!(applied, 1);
    assert!(outcomes.iter().filter(|o| o.is_err()).all(|o| *o == Err(EditError::Cooldown(Duration::from_secs(60)))));
    assert_eq!(state.lock_canvas().active_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_fanout_order_matches_persist_order() {
    let (state, repo) = test_helpers::test_app_state();
    let (tx, mut rx) = mpsc::channel(64);
    state.broadcaster.register(Uuid::new_v4(), tx);
    let editors = 32;
    let start = Barrier::new(editors);

    std::thread::scope(|s| {
        for i in 0..editors {
            let (state, start) = (&state, &start);
            s.spawn(move || {
                let (x, y) = coord_of(i);
                start.wait();
                apply_edit(state, Uuid::new_v4(), &edit(x, y, "#FF0000"), T0).unwrap();
            });
        }
    });

    let mut broadcast = Vec::new();
    for _ in 0..editors {
        let msg = recv_json(&mut rx).await;
        broadcast.push((msg["x"].as_i64().unwrap(), msg["y"].as_i64().unwrap()));
    }

    assert_eq!(state.persistence.flush().await, Ok(editors));
    let batches = repo.upsert_batches();
    assert_eq!(batches.len(), 1);
    let persisted: Vec<_> = batches[0].iter().map(|p| (i64::from(p.x), i64::from(p.y))).collect();
    assert_eq!(broadcast, persisted);
}
