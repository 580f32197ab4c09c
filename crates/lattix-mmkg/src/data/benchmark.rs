//! OpenKE benchmark directories.
//!
//! A benchmark is a directory of whitespace-separated id files, each starting
//! with a count line:
//!
//! ```text
//! entity2id.txt     relation2id.txt     train2id.txt / valid2id.txt / test2id.txt
//! 3                 1                   2
//! /m/0abc  0        /film/genre  0      0 1 0        <- head tail relation
//! /m/0def  1                            2 1 0
//! /m/0ghi  2
//! ```
//!
//! Note the triple files are ordered `head tail relation`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::IdTriple;
use crate::error::{Error, Result};

/// Bidirectional name <-> id mapping.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anonymous vocabulary `0..n` named by their ids.
    pub fn with_len(n: usize) -> Self {
        let mut vocab = Self::new();
        for i in 0..n {
            vocab.insert(i.to_string());
        }
        vocab
    }

    /// Add a name, returning its id (existing names keep their id).
    pub fn insert(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(&id) = self.ids.get(&name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.ids.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn from_pairs(path: &Path, pairs: Vec<(String, u32)>) -> Result<Self> {
        let n = pairs.len();
        let mut names: Vec<Option<String>> = vec![None; n];
        for (name, id) in pairs {
            let slot = names.get_mut(id as usize).ok_or_else(|| Error::Parse {
                path: path.display().to_string(),
                line: 0,
                message: format!("id {id} out of range for {n} entries"),
            })?;
            if slot.replace(name).is_some() {
                return Err(Error::Parse {
                    path: path.display().to_string(),
                    line: 0,
                    message: format!("duplicate id {id}"),
                });
            }
        }
        // Ids come from the id column; a repeated name resolves to its first id.
        let mut vocab = Self::new();
        for (id, name) in names.into_iter().enumerate() {
            let name = name.ok_or_else(|| Error::Parse {
                path: path.display().to_string(),
                line: 0,
                message: format!("missing id {id}"),
            })?;
            vocab.ids.entry(name.clone()).or_insert(id as u32);
            vocab.names.push(name);
        }
        Ok(vocab)
    }
}

/// A loaded benchmark: vocabularies plus train/valid/test splits.
#[derive(Debug, Clone)]
pub struct Benchmark {
    pub entities: Vocab,
    pub relations: Vocab,
    pub train: Vec<IdTriple>,
    pub valid: Vec<IdTriple>,
    pub test: Vec<IdTriple>,
}

impl Benchmark {
    /// Build from in-memory splits; vocabularies are anonymous.
    pub fn from_splits(
        num_entities: usize,
        num_relations: usize,
        train: Vec<IdTriple>,
        valid: Vec<IdTriple>,
        test: Vec<IdTriple>,
    ) -> Result<Self> {
        let benchmark = Self {
            entities: Vocab::with_len(num_entities),
            relations: Vocab::with_len(num_relations),
            train,
            valid,
            test,
        };
        benchmark.check_ids()?;
        Ok(benchmark)
    }

    /// Load a benchmark directory. `valid2id.txt` may be absent.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entities = Vocab::from_pairs(&dir.join("entity2id.txt"), read_vocab(&dir.join("entity2id.txt"))?)?;
        let relations =
            Vocab::from_pairs(&dir.join("relation2id.txt"), read_vocab(&dir.join("relation2id.txt"))?)?;
        let train = read_triples(&dir.join("train2id.txt"))?;
        let valid_path = dir.join("valid2id.txt");
        let valid = if valid_path.exists() {
            read_triples(&valid_path)?
        } else {
            warn!(path = %valid_path.display(), "no validation split");
            Vec::new()
        };
        let test = read_triples(&dir.join("test2id.txt"))?;

        let benchmark = Self { entities, relations, train, valid, test };
        benchmark.check_ids()?;
        info!(
            dir = %dir.display(),
            entities = benchmark.num_entities(),
            relations = benchmark.num_relations(),
            train = benchmark.train.len(),
            valid = benchmark.valid.len(),
            test = benchmark.test.len(),
            "loaded benchmark"
        );
        Ok(benchmark)
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    /// Every triple in any split; used to filter ranks and negatives.
    pub fn known_triples(&self) -> HashSet<IdTriple> {
        self.train
            .iter()
            .chain(&self.valid)
            .chain(&self.test)
            .copied()
            .collect()
    }

    fn check_ids(&self) -> Result<()> {
        let n_ent = self.num_entities() as u32;
        let n_rel = self.num_relations() as u32;
        for t in self.train.iter().chain(&self.valid).chain(&self.test) {
            if t.head >= n_ent {
                return Err(Error::EntityNotFound(t.head.to_string()));
            }
            if t.tail >= n_ent {
                return Err(Error::EntityNotFound(t.tail.to_string()));
            }
            if t.relation >= n_rel {
                return Err(Error::RelationNotFound(t.relation.to_string()));
            }
        }
        Ok(())
    }
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> Error {
    Error::Parse {
        path: path.display().to_string(),
        line,
        message: message.into(),
    }
}

/// Read a count line and the data lines after it.
fn read_counted(path: &Path) -> Result<(usize, Vec<(usize, String)>)> {
    let text = fs::read_to_string(path)?;
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let (line_no, first) = lines
        .next()
        .ok_or_else(|| parse_error(path, 1, "empty file"))?;
    let count: usize = first
        .parse()
        .map_err(|_| parse_error(path, line_no, format!("expected count, got {first:?}")))?;

    let rows: Vec<(usize, String)> = lines.map(|(n, l)| (n, l.to_string())).collect();
    if rows.len() != count {
        warn!(
            path = %path.display(),
            declared = count,
            found = rows.len(),
            "count line disagrees with file contents"
        );
    }
    Ok((count, rows))
}

fn read_vocab(path: &Path) -> Result<Vec<(String, u32)>> {
    let (_, rows) = read_counted(path)?;
    let mut pairs = Vec::with_capacity(rows.len());
    for (line_no, row) in rows {
        // Names may contain spaces; the id is always the last field.
        let (name, id) = row
            .rsplit_once(|c: char| c.is_whitespace())
            .ok_or_else(|| parse_error(path, line_no, "expected `name id`"))?;
        let id: u32 = id
            .parse()
            .map_err(|_| parse_error(path, line_no, format!("bad id {id:?}")))?;
        pairs.push((name.trim().to_string(), id));
    }
    debug!(path = %path.display(), entries = pairs.len(), "read vocabulary");
    Ok(pairs)
}

fn read_triples(path: &Path) -> Result<Vec<IdTriple>> {
    let (_, rows) = read_counted(path)?;
    let mut triples = Vec::with_capacity(rows.len());
    for (line_no, row) in rows {
        let fields: Vec<u32> = row
            .split_whitespace()
            .map(|f| f.parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| parse_error(path, line_no, format!("bad triple {row:?}")))?;
        match fields.as_slice() {
            [h, t, r] => triples.push(IdTriple::new(*h, *r, *t)),
            _ => return Err(parse_error(path, line_no, "expected `head tail relation`")),
        }
    }
    Ok(triples)
}

/// Write a benchmark in the same layout [`Benchmark::load`] reads.
pub fn write_benchmark(dir: impl AsRef<Path>, benchmark: &Benchmark) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let vocab_file = |vocab: &Vocab| {
        let mut out = format!("{}\n", vocab.len());
        for id in 0..vocab.len() as u32 {
            out.push_str(&format!("{}\t{}\n", vocab.name(id).unwrap_or_default(), id));
        }
        out
    };
    let triple_file = |triples: &[IdTriple]| {
        let mut out = format!("{}\n", triples.len());
        for t in triples {
            out.push_str(&format!("{} {} {}\n", t.head, t.tail, t.relation));
        }
        out
    };

    fs::write(dir.join("entity2id.txt"), vocab_file(&benchmark.entities))?;
    fs::write(dir.join("relation2id.txt"), vocab_file(&benchmark.relations))?;
    fs::write(dir.join("train2id.txt"), triple_file(&benchmark.train))?;
    fs::write(dir.join("valid2id.txt"), triple_file(&benchmark.valid))?;
    fs::write(dir.join("test2id.txt"), triple_file(&benchmark.test))?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_vocab_insert_is_idempotent() {
        let mut vocab = Vocab::new();
        assert_eq!(vocab.insert("a"), 0);
        assert_eq!(vocab.insert("b"), 1);
        assert_eq!(vocab.insert("a"), 0);
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.name(1), Some("b"));
    }

    #[test]
    fn test_load_openke_layout() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "entity2id.txt", "3\nParis 0\nFrance 1\nNew York\t2\n");
        write(dir.path(), "relation2id.txt", "1\ncapitalOf\t0\n");
        write(dir.path(), "train2id.txt", "1\n0 1 0\n");
        write(dir.path(), "test2id.txt", "1\n2 1 0\n");

        let benchmark = Benchmark::load(dir.path()).unwrap();
        assert_eq!(benchmark.num_entities(), 3);
        assert_eq!(benchmark.entities.id("New York"), Some(2));
        assert_eq!(benchmark.train, vec![IdTriple::new(0, 0, 1)]);
        assert!(benchmark.valid.is_empty());
        assert_eq!(benchmark.known_triples().len(), 2);
    }

    #[test]
    fn test_repeated_names_keep_id_column() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "entity2id.txt", "3\nsame 0\nsame 1\nother 2\n");
        write(dir.path(), "relation2id.txt", "1\nr 0\n");
        write(dir.path(), "train2id.txt", "1\n0 2 0\n");
        write(dir.path(), "test2id.txt", "1\n1 2 0\n");

        let benchmark = Benchmark::load(dir.path()).unwrap();
        assert_eq!(benchmark.num_entities(), 3);
        assert_eq!(benchmark.entities.id("other"), Some(2));
        assert_eq!(benchmark.entities.id("same"), Some(0));
        assert_eq!(benchmark.entities.name(1), Some("same"));
        assert_eq!(benchmark.entities.name(2), Some("other"));
        assert_eq!(benchmark.train, vec![IdTriple::new(0, 0, 2)]);
    }

    #[test]
    fn test_rejects_out_of_range_entity() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "entity2id.txt", "1\na 0\n");
        write(dir.path(), "relation2id.txt", "1\nr 0\n");
        write(dir.path(), "train2id.txt", "1\n0 5 0\n");
        write(dir.path(), "test2id.txt", "0\n");

        assert!(matches!(Benchmark::load(dir.path()), Err(Error::EntityNotFound(_))));
    }

    #[test]
    fn test_reports_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "entity2id.txt", "1\na 0\n");
        write(dir.path(), "relation2id.txt", "1\nr 0\n");
        write(dir.path(), "train2id.txt", "1\n0 0\n");
        write(dir.path(), "test2id.txt", "0\n");

        match Benchmark::load(dir.path()) {
            Err(Error::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let benchmark = Benchmark::from_splits(
            4,
            2,
            vec![IdTriple::new(0, 1, 2), IdTriple::new(1, 0, 3)],
            vec![IdTriple::new(2, 0, 3)],
            vec![IdTriple::new(3, 1, 0)],
        )
        .unwrap();

        write_benchmark(dir.path(), &benchmark).unwrap();
        let loaded = Benchmark::load(dir.path()).unwrap();
        assert_eq!(loaded.train, benchmark.train);
        assert_eq!(loaded.valid, benchmark.valid);
        assert_eq!(loaded.test, benchmark.test);
    }
}
