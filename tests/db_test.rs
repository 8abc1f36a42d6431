use arbor::db;
use arbor::memory::search::nearest_keys;
use arbor::memory::store::insert_memory;
use arbor::memory::types::{Memory, MemoryMeta, MemoryWithMeta};
use tempfile::TempDir;

fn spike(dimensions: usize, at: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dimensions];
    v[at % dimensions] = 1.0;
    v
}

fn fragment(title: &str) -> MemoryWithMeta {
    MemoryWithMeta::new(
        Memory {
            start_line: 1,
            end_line: 1,
            title: title.into(),
            relevant_questions: vec![],
            tags: vec![],
            context: None,
            symbol_id: None,
        },
        MemoryMeta::new("doc.md", title, "root", false),
    )
}

#[test]
fn open_creates_database_at_nested_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("memory.db");
    assert!(!db_path.exists());

    let conn = db::open_database(&db_path, 8).unwrap();
    assert!(db_path.exists());

    let version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .unwrap();
    assert!(!version.is_empty());
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn reopening_keeps_data_and_rejects_other_dimensions() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("memory.db");
    {
        let mut conn = db::open_database(&db_path, 8).unwrap();
        insert_memory(&mut conn, &fragment("kept"), &[("doc.md: kept".into(), spike(8, 1))])
            .unwrap();
    }

    let conn = db::open_database(&db_path, 8).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
    drop(conn);

    let err = db::open_database(&db_path, 16).unwrap_err();
    assert!(format!("{err:#}").contains("dimension"));
}

#[test]
fn nearest_keys_orders_by_similarity() {
    let mut conn = db::open_memory_database(8).unwrap();
    let a = fragment("alpha");
    let b = fragment("beta");
    insert_memory(&mut conn, &a, &[("doc.md: alpha".into(), spike(8, 0))]).unwrap();
    insert_memory(&mut conn, &b, &[("doc.md: beta".into(), spike(8, 5))]).unwrap();

    let mut query = spike(8, 0);
    query[5] = 0.5;
    arbor::embedding::normalize(&mut query);

    let hits = nearest_keys(&conn, &query, 10).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].memory_id, a.id);
    assert_eq!(hits[0].key, "doc.md: alpha");
    assert!(hits[0].score > hits[1].score);
    assert!(hits[0].score <= 1.0 + 1e-6);
}
