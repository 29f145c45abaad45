//! Properties of cursor pagination over the global and per-author feeds.

use std::collections::BTreeSet;
use std::sync::Arc;

use loom_store::{Content, LogStore, MemoryStore, Message, NewMessage, PostContent};
use loom_view::{Cursor, FeedQuery, Paged, SortKey};
use loom_view::paginate::feed_page;
use proptest::prelude::*;
use tokio::runtime::Runtime;

/// Upper bound on pages walked, so a broken cursor cannot loop forever.
const MAX_PAGES: usize = 200;

fn post(author: &str, timestamp: i64) -> NewMessage {
    NewMessage {
        key: None,
        author: author.to_string(),
        timestamp,
        content: Content::Post(PostContent {
            text: format!("at {}", timestamp),
            root: None,
        }),
    }
}

async fn page(store: &dyn LogStore, query: &FeedQuery) -> Option<loom_view::FeedPage<Message>> {
    feed_page(store, query, |_| true).await.unwrap().page()
}

/// Walk older links from the first page, then newer links back up.
/// Returns the keys seen in each direction, in reading order.
async fn walk(store: &dyn LogStore, base: FeedQuery) -> (Vec<i64>, Vec<Vec<i64>>) {
    let key = base.sort_key();
    let keys = |items: &[Message]| items.iter().map(|m| key.of(m)).collect::<Vec<_>>();

    let mut down = Vec::new();
    let mut query = base.clone();
    let mut last_page = None;
    for _ in 0..MAX_PAGES {
        let Some(current) = page(store, &query).await else {
            break;
        };
        down.extend(keys(&current.items));
        let older = current.older;
        last_page = Some(current);
        match older {
            Some(cursor) => query = base.clone().with_cursor(cursor),
            None => break,
        }
    }

    let mut up = Vec::new();
    let mut newer = last_page.and_then(|p| p.newer);
    for _ in 0..MAX_PAGES {
        let Some(cursor) = newer else {
            break;
        };
        let Some(current) = page(store, &base.clone().with_cursor(cursor)).await else {
            break;
        };
        up.push(keys(&current.items));
        newer = current.newer;
    }
    (down, up)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Walking older pages visits every item once, newest first; walking
    /// newer pages back up visits every item above the last page once.
    #[test]
    fn global_feed_pages_partition_the_feed(
        timestamps in prop::collection::btree_set(1i64..100_000, 1..80),
        limit in 1usize..25,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryStore::new("@me");
            // Append out of timestamp order.
            for ts in timestamps.iter().skip(1).step_by(2).chain(timestamps.iter().step_by(2)) {
                store.append(post("@alice", *ts));
            }
            let all: Vec<i64> = timestamps.iter().rev().copied().collect();

            let (down, up) = walk(&*store, FeedQuery::global(limit)).await;
            prop_assert_eq!(&down, &all);

            let last_page_len = match all.len() % limit {
                0 => limit,
                n => n,
            };
            let mut above: Vec<i64> = up.iter().flatten().copied().collect();
            above.sort_unstable_by(|a, b| b.cmp(a));
            let expected: Vec<i64> = all[..all.len() - last_page_len].to_vec();
            prop_assert_eq!(above.len(), expected.len());
            prop_assert_eq!(above, expected);

            for page in &up {
                prop_assert!(page.len() <= limit);
                prop_assert!(page.windows(2).all(|w| w[0] > w[1]));
            }
            Ok(())
        })?;
    }

    /// Per-author pages use sequence numbers, so equal timestamps across
    /// messages never confuse the cursor.
    #[test]
    fn author_feed_pages_use_sequence(
        count in 1usize..60,
        limit in 1usize..15,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryStore::new("@me");
            for i in 0..count {
                store.append(post("@alice", 1_000));
                if i % 3 == 0 {
                    store.append(post("@bob", 1_000));
                }
            }

            let (down, _) = walk(&*store, FeedQuery::author("@alice", limit)).await;
            let expected: Vec<i64> = (1..=count as i64).rev().collect();
            prop_assert_eq!(down, expected);
            Ok(())
        })?;
    }

    /// A newer cursor built from a page's first item starts strictly after it.
    #[test]
    fn newer_cursor_has_no_overlap(
        timestamps in prop::collection::btree_set(1i64..10_000, 2..50),
        pick in any::<prop::sample::Index>(),
        limit in 1usize..10,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryStore::new("@me");
            for ts in &timestamps {
                store.append(post("@alice", *ts));
            }
            let all: Vec<i64> = timestamps.iter().copied().collect();
            let boundary = all[pick.index(all.len())];

            let query = FeedQuery::global(limit).with_cursor(Cursor::newer_than(boundary).unwrap());
            match feed_page(&*store, &query, |_| true).await.unwrap() {
                Paged::Page(page) => {
                    let keys: Vec<i64> = page.items.iter().map(|m| SortKey::Timestamp.of(m)).collect();
                    prop_assert!(keys.iter().all(|k| *k > boundary));
                    // The oldest item of the page is the one right after the boundary.
                    let next = all.iter().copied().find(|k| *k > boundary);
                    prop_assert_eq!(keys.last().copied(), next);
                }
                Paged::Empty => {
                    prop_assert_eq!(boundary, *all.last().unwrap());
                }
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_forty_five_items_in_pages_of_twenty() {
    let store = MemoryStore::new("@me");
    for ts in 1..=45 {
        store.append(post("@alice", ts * 10));
    }
    let log: Arc<dyn LogStore> = store;
    let now = 1_000_000;

    let first = FeedQuery::global(20).with_cursor(Cursor {
        lte: Some(now),
        gte: None,
    });
    let p1 = page(&*log, &first).await.unwrap();
    assert_eq!(p1.items.len(), 20);
    assert_eq!(p1.items[0].timestamp(), 450);
    assert_eq!(p1.older, Cursor::older_than(p1.items[19].timestamp()));

    let p2 = page(&*log, &FeedQuery::global(20).with_cursor(p1.older.unwrap())).await.unwrap();
    assert_eq!(p2.items.len(), 20);
    assert_eq!(p2.items[0].timestamp(), 250);

    let p3 = page(&*log, &FeedQuery::global(20).with_cursor(p2.older.unwrap())).await.unwrap();
    assert_eq!(p3.items.len(), 5);
    assert_eq!(p3.items[4].timestamp(), 10);
    assert_eq!(p3.older, None);

    let seen: BTreeSet<i64> = [p1, p2, p3]
        .iter()
        .flat_map(|p| p.items.iter().map(|m| m.timestamp()))
        .collect();
    assert_eq!(seen.len(), 45);
}
