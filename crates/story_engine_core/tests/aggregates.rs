mod common;

use common::Harness;
use serde_json::{json, Value};
use story_engine_core::{fields, Collection};

fn review(story: &str, user: &str, rating: i64) -> story_engine_core::Fields {
    fields([
        ("story", json!(story)),
        ("user", json!(user)),
        ("rating", json!(rating)),
    ])
}

fn bookmark(story: &str, user: &str, kind: &str) -> story_engine_core::Fields {
    fields([
        ("story", json!(story)),
        ("user", json!(user)),
        ("type", json!(kind)),
    ])
}

#[tokio::test]
async fn rating_tracks_the_mean_of_current_reviews() {
    let h = Harness::new();
    let story = h.story().await;
    h.create(Collection::Reviews, review(&story.id, "u1", 5)).await;
    let second = h.create(Collection::Reviews, review(&story.id, "u2", 2)).await;
    assert_eq!(h.field(&story, "average_rating").await, json!(3.5));
    assert_eq!(h.field(&story, "review_count").await, json!(2));

    h.update(&second, fields([("rating", json!(4))])).await;
    assert_eq!(h.field(&story, "average_rating").await, json!(4.5));
    assert_eq!(h.field(&story, "review_count").await, json!(2));
}

#[tokio::test]
async fn deleting_the_last_review_clears_the_rating() {
    let h = Harness::new();
    let story = h.story().await;
    let only = h.create(Collection::Reviews, review(&story.id, "u1", 4)).await;
    assert_eq!(h.field(&story, "average_rating").await, json!(4.0));

    h.delete(&only).await;
    assert_eq!(h.field(&story, "average_rating").await, Value::Null);
    assert_eq!(h.field(&story, "review_count").await, json!(0));
}

#[tokio::test]
async fn moving_a_review_recomputes_both_stories() {
    let h = Harness::new();
    let from = h.story().await;
    let to = h.story().await;
    let moved = h.create(Collection::Reviews, review(&from.id, "u1", 3)).await;
    h.update(&moved, fields([("story", json!(to.id))])).await;

    assert_eq!(h.field(&from, "review_count").await, json!(0));
    assert_eq!(h.field(&from, "average_rating").await, Value::Null);
    assert_eq!(h.field(&to, "average_rating").await, json!(3.0));
}

#[tokio::test]
async fn favorites_and_bookmarks_are_counted_independently() {
    let h = Harness::new();
    let story = h.story().await;
    h.create(Collection::Bookmarks, bookmark(&story.id, "u1", "favorite")).await;
    h.create(Collection::Bookmarks, bookmark(&story.id, "u2", "favorite")).await;
    let b = h.create(Collection::Bookmarks, bookmark(&story.id, "u1", "bookmark")).await;
    h.create(Collection::Bookmarks, bookmark(&story.id, "u3", "read_later")).await;

    assert_eq!(h.field(&story, "favorite_count").await, json!(2));
    assert_eq!(h.field(&story, "bookmark_count").await, json!(1));

    h.update(&b, fields([("type", json!("favorite"))])).await;
    assert_eq!(h.field(&story, "favorite_count").await, json!(3));
    assert_eq!(h.field(&story, "bookmark_count").await, json!(0));
}

#[tokio::test]
async fn moving_a_bookmark_updates_old_and_new_story() {
    let h = Harness::new();
    let from = h.story().await;
    let to = h.story().await;
    let b = h.create(Collection::Bookmarks, bookmark(&from.id, "u1", "bookmark")).await;
    assert_eq!(h.field(&from, "bookmark_count").await, json!(1));

    h.update(&b, fields([("story", json!(to.id))])).await;
    assert_eq!(h.field(&from, "bookmark_count").await, json!(0));
    assert_eq!(h.field(&to, "bookmark_count").await, json!(1));

    h.delete(&h.reload(&b).await).await;
    assert_eq!(h.field(&to, "bookmark_count").await, json!(0));
}

#[tokio::test]
async fn has_audio_follows_audio_variants_of_any_chapter() {
    let h = Harness::new();
    let story = h.story().await;
    let _first = h.chapter(&story, 1, true).await;
    let second = h.chapter(&story, 2, false).await;

    let audio = h
        .create(
            Collection::ChapterAudios,
            fields([("chapter", json!(second.id)), ("voice", json!("narrator"))]),
        )
        .await;
    assert_eq!(h.field(&story, "has_audio").await, json!(true));

    h.delete(&audio).await;
    assert_eq!(h.field(&story, "has_audio").await, json!(false));
}

#[tokio::test]
async fn moving_an_audio_variant_recomputes_both_stories() {
    let h = Harness::new();
    let from_story = h.story().await;
    let to_story = h.story().await;
    let from_chapter = h.chapter(&from_story, 1, true).await;
    let to_chapter = h.chapter(&to_story, 1, true).await;

    let audio = h
        .create(
            Collection::ChapterAudios,
            fields([("chapter", json!(from_chapter.id)), ("voice", json!("narrator"))]),
        )
        .await;
    assert_eq!(h.field(&from_story, "has_audio").await, json!(true));
    assert_eq!(h.field(&to_story, "has_audio").await, Value::Null);

    h.update(&audio, fields([("chapter", json!(to_chapter.id))]))
        .await;
    assert_eq!(h.field(&from_story, "has_audio").await, json!(false));
    assert_eq!(h.field(&to_story, "has_audio").await, json!(true));
}

#[tokio::test]
async fn missing_parent_story_is_a_silent_no_op() {
    let h = Harness::new();
    let r = h.create(Collection::Reviews, review("nope", "u1", 5)).await;
    assert_eq!(r.get_str("story"), "nope");
    assert_eq!(h.count(Collection::Stories, "").await, 0);
}
