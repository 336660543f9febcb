mod common;

use chrono::Duration;
use common::{FailingCreates, Harness};
use serde_json::json;
use std::sync::Arc;
use story_engine_core::engine::ProgressionEngine;
use story_engine_core::filter::{all_of, eq};
use story_engine_core::{
    fields, Clock, Collection, EngineSettings, MemoryStore, PortError, Record, RecordStore,
    UserStats,
};

async fn complete(h: &Harness, user: &str, chapter: &Record) -> Record {
    h.create(
        Collection::ReadingProgress,
        fields([
            ("user", json!(user)),
            ("chapter", json!(chapter.id)),
            ("is_completed", json!(true)),
        ]),
    )
    .await
}

async fn listened(h: &Harness, user: &str, chapter: &Record) {
    h.seed(
        Collection::ListeningSessions,
        fields([
            ("user", json!(user)),
            ("chapter", json!(chapter.id)),
            ("completed", json!(true)),
        ]),
    )
    .await;
}

async fn stats(h: &Harness, user: &str) -> UserStats {
    let rows = h
        .store
        .find_by_filter(Collection::UserStats, &eq("user", user), "", 0, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "exactly one stats row per user");
    rows[0].decode().unwrap()
}

async fn held_stickers(h: &Harness, user: &str) -> u64 {
    h.count(Collection::UserStickers, &eq("user", user)).await
}

#[tokio::test]
async fn two_free_chapters_complete_the_story() {
    let h = Harness::new();
    h.level_stickers().await;
    let story = h.sticker_story().await;
    h.story_sticker(&story).await;
    let c1 = h.chapter(&story, 1, true).await;
    let c2 = h.chapter(&story, 2, true).await;
    let _c3 = h.chapter(&story, 3, false).await;

    complete(&h, "u1", &c1).await;
    let after_first = stats(&h, "u1").await;
    assert_eq!(after_first.total_xp, 10.0);
    assert_eq!(after_first.chapters_read, 1);
    assert_eq!(after_first.level, 1);
    assert_eq!(after_first.stories_completed, 0);

    listened(&h, "u1", &c2).await;
    complete(&h, "u1", &c2).await;
    let after_second = stats(&h, "u1").await;
    assert_eq!(after_second.total_xp, 75.0);
    assert_eq!(after_second.chapters_read, 2);
    assert_eq!(after_second.chapters_listened, 1);
    assert_eq!(after_second.stories_completed, 1);
    assert_eq!(after_second.level, 1);

    // level_1 on the first completion, the story sticker on the second.
    assert_eq!(held_stickers(&h, "u1").await, 2);
}

#[tokio::test]
async fn completion_bonus_is_paid_once_per_story() {
    let h = Harness::new();
    let story = h.story().await;
    let only = h.chapter(&story, 1, true).await;

    let progress = complete(&h, "u1", &only).await;
    assert_eq!(stats(&h, "u1").await.total_xp, 60.0);

    // Un-complete and complete again: the chapter is credited again, the bonus is not.
    h.update(&progress, fields([("is_completed", json!(false))])).await;
    h.update(&progress, fields([("is_completed", json!(true))])).await;
    let s = stats(&h, "u1").await;
    assert_eq!(s.total_xp, 70.0);
    assert_eq!(s.stories_completed, 1);
    assert_eq!(h.count(Collection::StoryCompletions, "").await, 1);
}

#[tokio::test]
async fn updates_that_are_not_the_completion_edge_do_nothing() {
    let h = Harness::new();
    let story = h.story().await;
    let c1 = h.chapter(&story, 1, true).await;
    let _c2 = h.chapter(&story, 2, true).await;

    let progress = h
        .create(
            Collection::ReadingProgress,
            fields([
                ("user", json!("u1")),
                ("chapter", json!(c1.id)),
                ("is_completed", json!(false)),
            ]),
        )
        .await;
    assert_eq!(h.count(Collection::UserStats, "").await, 0);

    h.update(&progress, fields([("is_completed", json!(true))])).await;
    h.update(&progress, fields([("position", json!(42))])).await;
    let s = stats(&h, "u1").await;
    assert_eq!(s.chapters_read, 1);
    assert_eq!(s.total_xp, 10.0);
}

#[tokio::test]
async fn streak_counts_consecutive_days() {
    let h = Harness::new();
    let story = h.story().await;
    let mut chapters = Vec::new();
    for n in 1..=5 {
        chapters.push(h.chapter(&story, n, false).await);
    }

    complete(&h, "u1", &chapters[0]).await;
    assert_eq!(stats(&h, "u1").await.streak_days, 1);

    h.advance(Duration::hours(2));
    complete(&h, "u1", &chapters[1]).await;
    assert_eq!(stats(&h, "u1").await.streak_days, 1, "same day keeps the streak");

    h.advance(Duration::days(1));
    complete(&h, "u1", &chapters[2]).await;
    assert_eq!(stats(&h, "u1").await.streak_days, 2);

    h.advance(Duration::days(2));
    complete(&h, "u1", &chapters[3]).await;
    let s = stats(&h, "u1").await;
    assert_eq!(s.streak_days, 1, "a missed day resets");
    assert_eq!(s.last_activity_date, Some(h.clock.now().date_naive()));
}

#[tokio::test]
async fn crossing_a_threshold_unlocks_that_level() {
    let h = Harness::new();
    h.level_stickers().await;
    let story = h.story().await;
    let chapter = h.chapter(&story, 1, false).await;
    h.seed(
        Collection::UserStats,
        fields([
            ("user", json!("u1")),
            ("total_xp", json!(95.0)),
            ("level", json!(1)),
            ("streak_days", json!(3)),
            ("last_activity_date", json!("")),
        ]),
    )
    .await;

    complete(&h, "u1", &chapter).await;
    let s = stats(&h, "u1").await;
    assert_eq!(s.total_xp, 105.0);
    assert_eq!(s.level, 2);
    assert_eq!(s.streak_days, 1);

    let level_2 = h
        .store
        .find_by_filter(Collection::Stickers, &eq("key", "level_2"), "", 1, 0)
        .await
        .unwrap()
        .remove(0);
    let held = all_of([eq("user", "u1"), eq("sticker", &level_2.id)]);
    let unlocks = h
        .store
        .find_by_filter(Collection::UserStickers, &held, "", 0, 0)
        .await
        .unwrap();
    assert_eq!(unlocks.len(), 1);
    assert_eq!(unlocks[0].get_str("unlock_source"), "level_up");
}

#[tokio::test]
async fn story_without_sticker_flag_unlocks_nothing() {
    let h = Harness::new();
    let story = h.story().await;
    h.story_sticker(&story).await;
    let chapter = h.chapter(&story, 1, true).await;

    complete(&h, "u1", &chapter).await;
    assert_eq!(stats(&h, "u1").await.stories_completed, 1);
    assert_eq!(held_stickers(&h, "u1").await, 0);
}

#[tokio::test]
async fn story_without_free_chapters_never_completes() {
    let h = Harness::new();
    let story = h.story().await;
    let premium = h.chapter(&story, 1, false).await;

    complete(&h, "u1", &premium).await;
    let s = stats(&h, "u1").await;
    assert_eq!(s.stories_completed, 0);
    assert_eq!(s.total_xp, 10.0);
}

#[tokio::test]
async fn missing_listening_collection_means_no_listening_credit() {
    let h = Harness::with_store(|clock| {
        MemoryStore::with_collections(
            clock,
            Collection::ALL
                .into_iter()
                .filter(|c| *c != Collection::ListeningSessions),
        )
    });
    let story = h.story().await;
    let chapter = h.chapter(&story, 1, false).await;

    complete(&h, "u1", &chapter).await;
    let s = stats(&h, "u1").await;
    assert_eq!(s.total_xp, 10.0);
    assert_eq!(s.chapters_listened, 0);
}

#[tokio::test]
async fn missing_chapter_leaves_stats_untouched() {
    let h = Harness::new();
    h.create(
        Collection::ReadingProgress,
        fields([
            ("user", json!("u1")),
            ("chapter", json!("gone")),
            ("is_completed", json!(true)),
        ]),
    )
    .await;
    assert_eq!(h.count(Collection::UserStats, "").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_final_chapter_completions_pay_one_bonus() {
    let h = Harness::new();
    let story = h.sticker_story().await;
    h.story_sticker(&story).await;
    let chapter = h.chapter(&story, 1, true).await;
    let progress = h
        .seed(
            Collection::ReadingProgress,
            fields([
                ("user", json!("u1")),
                ("chapter", json!(chapter.id)),
                ("is_completed", json!(true)),
            ]),
        )
        .await;

    let engine = ProgressionEngine::new(
        h.store.clone(),
        h.clock.clone(),
        Arc::new(EngineSettings::default()),
    );
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let progress = progress.clone();
            tokio::spawn(async move { engine.process_chapter_completed(&progress).await })
        })
        .collect();
    let mut bonuses = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap().unwrap();
        if outcome.story_completed {
            bonuses += 1;
        }
    }

    assert_eq!(bonuses, 1);
    assert_eq!(stats(&h, "u1").await.stories_completed, 1);
    assert_eq!(held_stickers(&h, "u1").await, 1);
}

async fn seeded_completion(h: &Harness, user: &str, chapter: &Record) -> Record {
    h.seed(
        Collection::ReadingProgress,
        fields([
            ("user", json!(user)),
            ("chapter", json!(chapter.id)),
            ("is_completed", json!(true)),
        ]),
    )
    .await
}

#[tokio::test]
async fn stats_insert_conflict_is_retried_once() {
    let h = Harness::new();
    h.level_stickers().await;
    let story = h.story().await;
    let chapter = h.chapter(&story, 1, false).await;
    let progress = seeded_completion(&h, "u1", &chapter).await;

    let store = Arc::new(FailingCreates::new(
        h.store.clone(),
        Collection::UserStats,
        PortError::Conflict("user_stats (user)".into()),
        1,
    ));
    let engine = ProgressionEngine::new(
        store.clone() as Arc<dyn RecordStore>,
        h.clock.clone(),
        Arc::new(EngineSettings::default()),
    );
    let outcome = engine
        .process_chapter_completed(&progress)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.pending(), 0, "the first attempt hit the conflict");
    assert_eq!(outcome.xp_awarded, 10.0);
    assert_eq!(stats(&h, "u1").await.total_xp, 10.0);
    // The rolled-back first attempt left no level_1 unlock behind.
    assert_eq!(held_stickers(&h, "u1").await, 1);
}

#[tokio::test]
async fn a_second_conflict_is_returned() {
    let h = Harness::new();
    let story = h.story().await;
    let chapter = h.chapter(&story, 1, false).await;
    let progress = seeded_completion(&h, "u1", &chapter).await;

    let store = Arc::new(FailingCreates::new(
        h.store.clone(),
        Collection::UserStats,
        PortError::Conflict("user_stats (user)".into()),
        2,
    ));
    let engine = ProgressionEngine::new(
        store as Arc<dyn RecordStore>,
        h.clock.clone(),
        Arc::new(EngineSettings::default()),
    );
    let err = engine.process_chapter_completed(&progress).await.unwrap_err();
    assert!(matches!(err, PortError::Conflict(_)));
    assert_eq!(h.count(Collection::UserStats, "").await, 0);
}

#[tokio::test]
async fn failed_unlock_still_saves_the_stats() {
    let h = Harness::new();
    h.level_stickers().await;
    let story = h.sticker_story().await;
    h.story_sticker(&story).await;
    let chapter = h.chapter(&story, 1, true).await;
    let progress = seeded_completion(&h, "u1", &chapter).await;

    let store = Arc::new(FailingCreates::new(
        h.store.clone(),
        Collection::UserStickers,
        PortError::Unexpected("sticker write failed".into()),
        usize::MAX,
    ));
    let engine = ProgressionEngine::new(
        store as Arc<dyn RecordStore>,
        h.clock.clone(),
        Arc::new(EngineSettings::default()),
    );
    let outcome = engine
        .process_chapter_completed(&progress)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.story_completed);
    assert!(outcome.unlocked.is_empty());
    let s = stats(&h, "u1").await;
    assert_eq!(s.total_xp, 60.0);
    assert_eq!(s.stories_completed, 1);
    assert_eq!(held_stickers(&h, "u1").await, 0);
}
