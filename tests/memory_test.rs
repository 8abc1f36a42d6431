mod helpers;

use std::collections::HashSet;

use helpers::memory_store;
use tempfile::TempDir;

use arbor::memory::GLOBAL_SCOPE;

const NOTES: &str = "Ownership basics
Each value has exactly one owner.

Borrowing rules
Many readers or one writer at a time.

Lifetime annotations
References must not outlive the data they point to.";

fn ids<T: AsRef<str>>(items: impl IntoIterator<Item = T>) -> Vec<String> {
    let mut ids: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn ingest_is_idempotent() {
    let store = memory_store();
    let first = store.ingest(NOTES, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    assert_eq!(first.len(), 3);
    let log_entries = store.stats().unwrap().log_entries;

    let second = store.ingest(NOTES, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    assert_eq!(
        ids(first.iter().map(|f| &f.id)),
        ids(second.iter().map(|f| &f.id))
    );
    let stats = store.stats().unwrap();
    assert_eq!(stats.total_memories, 3);
    assert_eq!(stats.log_entries, log_entries);
}

#[tokio::test]
async fn changed_content_keeps_surviving_fragments() {
    let store = memory_store();
    let first = store.ingest(NOTES, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    let borrowing = first
        .iter()
        .find(|f| f.memory.title == "Borrowing rules")
        .unwrap()
        .clone();

    let edited = format!("Preface\nWritten for the team.\n\n{NOTES}");
    let second = store.ingest(&edited, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    assert_eq!(second.len(), 4);

    let moved = second.iter().find(|f| f.id == borrowing.id).unwrap();
    assert_eq!(moved.memory.start_line, borrowing.memory.start_line + 3);
    assert_eq!(moved.memory.end_line, borrowing.memory.end_line + 3);
    assert!(second.iter().any(|f| f.memory.title == "Preface"));
}

#[tokio::test]
async fn removed_paragraph_is_evicted_on_reingest() {
    let store = memory_store();
    store.ingest(NOTES, "notes.md", GLOBAL_SCOPE, false).await.unwrap();

    let trimmed = NOTES.replace("Borrowing rules\nMany readers or one writer at a time.\n\n", "");
    let fragments = store.ingest(&trimmed, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    let titles: HashSet<&str> = fragments.iter().map(|f| f.memory.title.as_str()).collect();
    assert_eq!(titles, HashSet::from(["Ownership basics", "Lifetime annotations"]));
}

#[tokio::test]
async fn retrieve_returns_at_most_k_distinct_fragments() {
    let store = memory_store();
    let doc = (0..8)
        .map(|i| format!("Topic number {i}\nDetails about borrowing item {i}."))
        .collect::<Vec<_>>()
        .join("\n\n");
    store.ingest(&doc, "topics.md", GLOBAL_SCOPE, false).await.unwrap();

    let results = store
        .retrieve("what about borrowing topic?", 3, &[GLOBAL_SCOPE.to_string()])
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 3);
    let unique: HashSet<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(unique.len(), results.len());
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    let none = store
        .retrieve("anything", 0, &[GLOBAL_SCOPE.to_string()])
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn huge_result_counts_return_everything_visible() {
    let store = memory_store();
    store.ingest(NOTES, "notes.md", GLOBAL_SCOPE, false).await.unwrap();
    let chain = [GLOBAL_SCOPE.to_string()];

    let many = store.retrieve("borrowing", 3000, &chain).await.unwrap();
    assert_eq!(many.len(), 3);

    let all = store.retrieve("borrowing", usize::MAX, &chain).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn retrieval_respects_scope_chain() {
    let store = memory_store();
    let private = store
        .add_memory("Launch plan for the secret project", "message:aaaa1111", "conv-a")
        .await
        .unwrap();
    let global = store
        .add_memory("Public plan for the open project", "doc.md", GLOBAL_SCOPE)
        .await
        .unwrap();

    let chain_b = vec![GLOBAL_SCOPE.to_string(), "conv-b".to_string()];
    let from_b = store.retrieve("project plan", 5, &chain_b).await.unwrap();
    let seen: Vec<&str> = from_b.iter().map(|r| r.memory.id.as_str()).collect();
    assert!(seen.contains(&global.id.as_str()));
    assert!(!seen.contains(&private.id.as_str()));

    let chain_a = vec![
        GLOBAL_SCOPE.to_string(),
        "conv-a".to_string(),
        "m1".to_string(),
    ];
    let from_a = store.retrieve("project plan", 5, &chain_a).await.unwrap();
    assert!(from_a.iter().any(|r| r.memory.id == private.id));
}

#[tokio::test]
async fn watched_source_moves_with_the_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("notes.md");
    std::fs::write(&path, NOTES).unwrap();
    let source = path.to_string_lossy().to_string();

    let store = memory_store();
    store.ingest(NOTES, &source, GLOBAL_SCOPE, true).await.unwrap();

    std::fs::write(&path, format!("New heading\n\n{NOTES}")).unwrap();
    let results = store
        .retrieve("borrowing rules readers writer", 5, &[GLOBAL_SCOPE.to_string()])
        .await
        .unwrap();
    let hit = results
        .iter()
        .find(|r| r.memory.memory.title == "Borrowing rules")
        .unwrap();
    assert_eq!(hit.memory.memory.start_line, 6);
    assert_eq!(hit.memory.memory.end_line, 7);

    let stored = store.get(&hit.memory.id).unwrap().unwrap();
    assert_eq!(stored.memory.start_line, 6);
}

#[tokio::test]
async fn deleted_source_is_evicted_on_retrieve() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("notes.md");
    std::fs::write(&path, NOTES).unwrap();
    let source = path.to_string_lossy().to_string();

    let store = memory_store();
    store.ingest(NOTES, &source, GLOBAL_SCOPE, true).await.unwrap();
    let before = store
        .retrieve("ownership owner", 5, &[GLOBAL_SCOPE.to_string()])
        .await
        .unwrap();
    assert!(!before.is_empty());

    std::fs::remove_file(&path).unwrap();
    let after = store
        .retrieve("ownership owner", 5, &[GLOBAL_SCOPE.to_string()])
        .await
        .unwrap();
    assert!(after.is_empty());
    assert_eq!(store.stats().unwrap().total_memories, 0);
    assert!(store.memories_for_source(&source).unwrap().is_empty());
}

#[tokio::test]
async fn edited_source_is_reingested_on_retrieve() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("notes.md");
    std::fs::write(&path, NOTES).unwrap();
    let source = path.to_string_lossy().to_string();

    let store = memory_store();
    store.ingest(NOTES, &source, GLOBAL_SCOPE, true).await.unwrap();

    let edited = NOTES.replace("one writer at a time", "a single writer");
    std::fs::write(&path, &edited).unwrap();
    let results = store
        .retrieve("borrowing rules readers writer", 5, &[GLOBAL_SCOPE.to_string()])
        .await
        .unwrap();
    let hit = results
        .iter()
        .find(|r| r.memory.memory.title == "Borrowing rules")
        .unwrap();
    assert!(hit.memory.meta.content.contains("a single writer"));
    assert_eq!(store.memories_for_source(&source).unwrap().len(), 3);
}

#[tokio::test]
async fn validate_source_reports_evictions() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("notes.md");
    std::fs::write(&path, NOTES).unwrap();
    let source = path.to_string_lossy().to_string();

    let store = memory_store();
    store.ingest(NOTES, &source, GLOBAL_SCOPE, true).await.unwrap();
    assert_eq!(store.validate_source(&source).await.unwrap(), 0);

    std::fs::remove_file(&path).unwrap();
    assert_eq!(store.validate_source(&source).await.unwrap(), 3);
}

#[tokio::test]
async fn forget_removes_a_fragment_once() {
    let store = memory_store();
    let fragment = store
        .add_memory("A single fact worth keeping", "message:bbbb2222", "conv-x")
        .await
        .unwrap();

    assert!(store.forget(&fragment.id).unwrap());
    assert!(store.get(&fragment.id).unwrap().is_none());
    assert!(!store.forget(&fragment.id).unwrap());
    assert!(store.memories_in_scope("conv-x").unwrap().is_empty());
}
