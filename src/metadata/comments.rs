use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::api::client::MetadataApi;
use crate::api::CommentRaw;
use crate::errors::Result;
use crate::utils::{ceil_div, normalize_text};

/// Position of a comment thread in the tree: alternating (page, index) pairs from the root.
/// Sorting by path gives the same order as a depth-first walk.
type ThreadPath = Vec<u64>;

struct PageRequest {
    path: ThreadPath,
    parent: Option<String>,
    page: u64,
}

/// Fetches every comment of a video, including nested replies.
///
/// Threads are discovered through a worklist instead of recursion. A thread is only
/// fetched once even if several pages report it, and no more than `concurrency`
/// requests are in flight at any time. The first failed request aborts the walk.
pub async fn fetch_comment_tree(
    api: &dyn MetadataApi,
    video_id: &str,
    concurrency: usize,
) -> Result<Vec<CommentRaw>> {
    let concurrency = concurrency.max(1);
    let mut pending = VecDeque::from([PageRequest {
        path: Vec::new(),
        parent: None,
        page: 0,
    }]);
    let mut visited: HashSet<String> = HashSet::new();
    let mut pages: BTreeMap<(ThreadPath, u64), Vec<CommentRaw>> = BTreeMap::new();
    let mut in_flight = FuturesUnordered::new();

    let fetch = move |request: PageRequest| async move {
        let result = api
            .fetch_comments(video_id, request.parent.as_deref(), request.page)
            .await;
        (request, result)
    };

    loop {
        while in_flight.len() < concurrency {
            match pending.pop_front() {
                Some(request) => in_flight.push(fetch(request)),
                None => break,
            }
        }

        let Some((request, result)) = in_flight.next().await else {
            break;
        };
        let data = result?;

        if request.page == 0 && data.limit > 0 {
            for page in 1..ceil_div(data.count, data.limit) {
                pending.push_back(PageRequest {
                    path: request.path.clone(),
                    parent: request.parent.clone(),
                    page,
                });
            }
        }

        for (index, comment) in data.results.iter().enumerate() {
            if comment.num_replies == 0 || !visited.insert(comment.id.clone()) {
                continue;
            }
            let mut path = request.path.clone();
            path.extend([request.page, index as u64]);
            pending.push_back(PageRequest {
                path,
                parent: Some(comment.id.clone()),
                page: 0,
            });
        }

        pages.insert((request.path, request.page), data.results);
    }

    log::debug!(
        "[COMMENTS] Fetched {} pages for video {}",
        pages.len(),
        video_id
    );
    Ok(pages.into_values().flatten().collect())
}

/// Joins the description and all comment bodies into one searchable, NFKC-normalized text
pub fn comment_text(description: &str, comments: &[CommentRaw]) -> String {
    let bodies: Vec<&str> = comments.iter().map(|c| c.body.as_str()).collect();
    normalize_text(&format!("{}\n{}", description, bodies.join("\n")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{CommentPageRaw, VideoApiRaw};
    use crate::errors::AppError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves comment pages from a map keyed by (parent, page)
    #[derive(Default)]
    pub(crate) struct CommentFixture {
        pub pages: HashMap<(Option<String>, u64), CommentPageRaw>,
        pub calls: Mutex<Vec<(Option<String>, u64)>>,
        pub active: AtomicUsize,
        pub peak: AtomicUsize,
        pub fail_parent: Option<String>,
    }

    pub(crate) fn comment(id: &str, body: &str, replies: u64) -> CommentRaw {
        CommentRaw {
            id: id.to_string(),
            body: body.to_string(),
            num_replies: replies,
        }
    }

    pub(crate) fn page(count: u64, limit: u64, results: Vec<CommentRaw>) -> CommentPageRaw {
        CommentPageRaw {
            count,
            limit,
            page: 0,
            results,
        }
    }

    #[async_trait]
    impl MetadataApi for CommentFixture {
        async fn refresh_authorization(&self) -> Result<()> {
            Ok(())
        }

        async fn fetch_video(&self, _id: &str) -> Result<VideoApiRaw> {
            Ok(VideoApiRaw::default())
        }

        async fn fetch_file_sources(&self, _file_url: &str) -> Result<Value> {
            Ok(Value::Array(Vec::new()))
        }

        async fn fetch_comments(
            &self,
            _video_id: &str,
            parent: Option<&str>,
            page: u64,
        ) -> Result<CommentPageRaw> {
            let key = (parent.map(str::to_string), page);
            self.calls.lock().unwrap().push(key.clone());

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if parent.is_some() && parent == self.fail_parent.as_deref() {
                return Err(AppError::ParseError("broken page".to_string()));
            }
            Ok(self.pages.get(&key).cloned().unwrap_or_default())
        }

        async fn follow_user(&self, _user_id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn like_video(&self, _video_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn nested_fixture() -> CommentFixture {
        let mut fixture = CommentFixture::default();
        fixture.pages.insert(
            (None, 0),
            page(3, 2, vec![comment("c1", "first", 2), comment("c2", "second", 0)]),
        );
        fixture
            .pages
            .insert((None, 1), page(3, 2, vec![comment("c3", "third", 1)]));
        fixture.pages.insert(
            (Some("c1".to_string()), 0),
            page(2, 20, vec![comment("r1", "reply one", 1), comment("r2", "reply two", 0)]),
        );
        fixture.pages.insert(
            (Some("r1".to_string()), 0),
            page(1, 20, vec![comment("rr1", "deep reply", 0)]),
        );
        fixture.pages.insert(
            (Some("c3".to_string()), 0),
            page(1, 20, vec![comment("r3", "reply three", 0)]),
        );
        fixture
    }

    #[tokio::test]
    async fn walks_pages_and_replies_in_depth_first_order() {
        let fixture = nested_fixture();
        let comments = fetch_comment_tree(&fixture, "vid", 8).await.unwrap();
        let bodies: Vec<&str> = comments.iter().map(|c| c.body.as_str()).collect();
        assert_eq!(
            bodies,
            vec![
                "first",
                "second",
                "third",
                "reply one",
                "reply two",
                "deep reply",
                "reply three"
            ]
        );
        assert_eq!(fixture.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn never_exceeds_the_concurrency_cap() {
        let mut fixture = CommentFixture::default();
        let roots: Vec<CommentRaw> = (0..20)
            .map(|i| comment(&format!("c{}", i), "root", 1))
            .collect();
        fixture.pages.insert((None, 0), page(20, 20, roots));

        let comments = fetch_comment_tree(&fixture, "vid", 3).await.unwrap();
        assert_eq!(comments.len(), 20);
        assert_eq!(fixture.calls.lock().unwrap().len(), 21);
        assert!(fixture.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn duplicate_threads_are_fetched_once() {
        let mut fixture = CommentFixture::default();
        fixture.pages.insert(
            (None, 0),
            page(2, 1, vec![comment("dup", "a", 1)]),
        );
        fixture
            .pages
            .insert((None, 1), page(2, 1, vec![comment("dup", "a again", 1)]));

        fetch_comment_tree(&fixture, "vid", 4).await.unwrap();
        let calls = fixture.calls.lock().unwrap();
        let dup_calls = calls
            .iter()
            .filter(|(parent, _)| parent.as_deref() == Some("dup"))
            .count();
        assert_eq!(dup_calls, 1);
    }

    #[tokio::test]
    async fn failing_thread_aborts_the_walk() {
        let mut fixture = nested_fixture();
        fixture.fail_parent = Some("c3".to_string());
        assert!(fetch_comment_tree(&fixture, "vid", 2).await.is_err());
    }

    #[test]
    fn text_starts_with_description() {
        let text = comment_text("desc", &[comment("a", "one", 0), comment("b", "two", 0)]);
        assert_eq!(text, "desc\none\ntwo");
    }

    #[test]
    fn full_width_links_are_found() {
        let text = comment_text("desc", &[comment("a", "ｍｅｇａ．ｎｚ/ｆｉｌｅ", 0)]);
        assert_eq!(text, "desc\nmega.nz/file");
        assert_eq!(crate::utils::find_download_link_domain(&text), Some("mega.nz"));
    }
}
