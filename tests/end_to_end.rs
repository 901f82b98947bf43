use std::path::PathBuf;
use std::sync::Arc;

use symdex::query::{IndexProvider, IndexSessionCache};
use symdex::{EntrySource, Index, IndexConfig, IntersectingQuery, MatchRule, SubPattern};

fn unique_tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("symdex-e2e-{}-{}", tag, nanos))
}

fn open(path: &PathBuf, reuse: bool) -> Index {
    Index::open(path, "/ws/proj", &IndexConfig::default(), reuse).unwrap()
}

fn foo_docs(index: &Index) -> Vec<String> {
    let hits = index
        .query(&["type"], Some("Foo"), MatchRule::exact())
        .unwrap();
    hits.iter()
        .flat_map(|r| r.document_names().unwrap())
        .collect()
}

#[test]
fn ingest_save_remove_save() {
    let path = unique_tmp_dir("scenario").join("index.sydx");
    let index = open(&path, false);

    index.add_index_entry("type", "Foo", "doc1");
    index.add_index_entry("type", "Bar", "doc1");
    index.add_index_entry("type", "Foo", "doc2");
    assert_eq!(foo_docs(&index), vec!["doc1", "doc2"]);

    index.save().unwrap();
    assert_eq!(foo_docs(&index), vec!["doc1", "doc2"]);

    index.remove("doc1");
    assert_eq!(foo_docs(&index), vec!["doc2"]);

    index.save().unwrap();
    assert_eq!(foo_docs(&index), vec!["doc2"]);

    let bar = index
        .query(&["type"], Some("Bar"), MatchRule::exact())
        .unwrap();
    assert!(bar.is_empty());
}

#[test]
fn match_rules_through_the_index() {
    let path = unique_tmp_dir("rules").join("index.sydx");
    let index = open(&path, false);
    index.add_index_entry("type", "NullPointerException", "A.java");
    index.add_index_entry("type", "nullPointerException", "B.java");
    index.save().unwrap();

    let words = |key: &str, rule: MatchRule| -> Vec<String> {
        index
            .query(&["type"], Some(key), rule)
            .unwrap()
            .iter()
            .map(|r| r.word().to_string())
            .collect()
    };

    assert_eq!(words("NPE", MatchRule::camel_case()), vec!["NullPointerException"]);
    assert!(words("npe", MatchRule::camel_case().case_sensitive()).is_empty());
    assert_eq!(
        words("Null", MatchRule::prefix()),
        vec!["NullPointerException", "nullPointerException"]
    );
    assert_eq!(words("*Exception", MatchRule::pattern()).len(), 2);
    assert_eq!(
        words("null.*", MatchRule::from_bits(0x0004 | 0x0008).unwrap()),
        vec!["nullPointerException"]
    );
}

#[test]
fn saved_entries_survive_restart() {
    let path = unique_tmp_dir("restart").join("index.sydx");
    {
        let index = open(&path, false);
        index.add_index_entry("type", "Foo", "doc1");
        index.save().unwrap();
    }
    let index = open(&path, true);
    assert!(!index.has_changed());
    assert_eq!(foo_docs(&index), vec!["doc1"]);
    assert!(index.index_last_modified().is_some());
}

#[test]
fn corrupt_file_opens_empty() {
    let path = unique_tmp_dir("corrupt").join("index.sydx");
    {
        let index = open(&path, false);
        index.add_index_entry("type", "Foo", "doc1");
        index.save().unwrap();
    }
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x5A;
    std::fs::write(&path, &bytes).unwrap();

    let index = open(&path, true);
    assert!(foo_docs(&index).is_empty());
    assert_eq!(index.query_document_names(None).unwrap(), None);

    std::fs::write(&path, b"not an index at all").unwrap();
    let index = open(&path, true);
    assert!(foo_docs(&index).is_empty());
}

#[test]
fn concurrent_readers_never_see_torn_merge() {
    let path = unique_tmp_dir("torn").join("index.sydx");
    let index = open(&path, false);
    for i in 0..40 {
        index.add_index_entry("type", "Foo", &format!("old{:02}", i));
    }
    index.save().unwrap();

    // 一次 save 同时删除旧文档、加入新文档：读者只能看到其中一边
    for i in 0..40 {
        index.remove(&format!("old{:02}", i));
        index.add_index_entry("type", "Foo", &format!("new{:02}", i));
    }
    let after: Vec<String> = (0..40).map(|i| format!("new{:02}", i)).collect();

    std::thread::scope(|s| {
        for _ in 0..6 {
            s.spawn(|| {
                for _ in 0..25 {
                    assert_eq!(foo_docs(&index), after);
                }
            });
        }
        s.spawn(|| index.save().unwrap());
    });
    assert_eq!(foo_docs(&index), after);
    assert!(!index.has_changed());
}

struct Workspace {
    indexes: Vec<Arc<Index>>,
}

impl IndexProvider for Workspace {
    type Job = &'static str;

    fn indexes_for(&self, _job: &&'static str) -> Vec<Arc<Index>> {
        self.indexes.clone()
    }
}

#[test]
fn intersection_inside_a_session() {
    let dir = unique_tmp_dir("session");
    let index = Arc::new(Index::open(
        dir.join("proj.sydx"),
        "/ws/proj",
        &IndexConfig::default(),
        false,
    )
    .unwrap());
    index.add_index_entry("ref", "List", "A.java");
    index.add_index_entry("ref", "Map", "A.java");
    index.add_index_entry("ref", "List", "B.java");
    index.add_index_entry("ref", "Set", "C.java");
    index.save().unwrap();
    index.add_index_entry("ref", "Map", "C.java");

    let cache = IndexSessionCache::new(Workspace {
        indexes: vec![index.clone()],
    });
    let query = IntersectingQuery::new(vec![
        SubPattern::key(&["ref"], Some("Map"), MatchRule::exact()),
        SubPattern::key(&["ref"], Some("List"), MatchRule::exact()),
    ]);
    let out = cache
        .with_sources(&"find-usages", |sources| {
            query.execute_all(sources.iter().map(|s| s as &dyn EntrySource), None)
        })
        .unwrap();
    assert_eq!(index.stats().monitor_status, 1);
    cache.finished(&"find-usages");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, "/ws/proj");
    assert_eq!(
        out[0].1.documents.iter().cloned().collect::<Vec<_>>(),
        vec!["A.java"]
    );
    assert_eq!(index.stats().monitor_status, 0);
}
