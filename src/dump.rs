//! Gzip-compressed, line-delimited JSON state files.
//!
//! Each table is dumped to `<dir>/<name>.gz`. The dumper writes to
//! `<dir>/<name>.gz.new` and renames it over the previous dump only after the
//! encoder is finished and the file is synced, so a crash mid-dump leaves the
//! previous dump readable.

use crate::error::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

/// Final path of the dump of table `name`.
pub fn dump_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.gz", name))
}

fn staging_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.gz.new", name))
}

/// Deserializes an id written either as a JSON number or as a numeric string.
pub fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

// ================================================================================================
// DUMPER
// ================================================================================================

/// Writes one table dump.
pub struct StateDumper {
    name: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    encoder: GzEncoder<BufWriter<File>>,
    lines: usize,
}

impl StateDumper {
    /// Starts a dump of table `name` in `dir`, creating `dir` if needed.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let tmp_path = staging_path(dir, name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        debug!("Dumping {} to {}", name, tmp_path.display());

        Ok(Self {
            name: name.to_string(),
            tmp_path,
            final_path: dump_path(dir, name),
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
            lines: 0,
        })
    }

    /// Appends one line. `line` must not contain a newline.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.encoder.write_all(line.as_bytes())?;
        self.encoder.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    /// Serializes `record` as one JSON line.
    pub fn write_json<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.write_line(&line)
    }

    /// Lines written so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Completes the dump and replaces the previous one. Returns the line count.
    pub fn finish(self) -> Result<usize> {
        let writer = self.encoder.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        // Atomic rename
        fs::rename(&self.tmp_path, &self.final_path)?;
        debug!("Dump of {} finished, {} lines", self.name, self.lines);
        Ok(self.lines)
    }
}

impl std::fmt::Debug for StateDumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDumper")
            .field("name", &self.name)
            .field("path", &self.final_path)
            .field("lines", &self.lines)
            .finish()
    }
}

// ================================================================================================
// LOADER
// ================================================================================================

/// Reads one table dump line by line.
pub struct StateLoader {
    name: String,
    lines: Lines<BufReader<GzDecoder<File>>>,
    line_no: usize,
}

impl StateLoader {
    /// Opens the dump of table `name`. A missing dump is not an error: `Ok(None)`.
    pub fn open(dir: &Path, name: &str) -> Result<Option<Self>> {
        let path = dump_path(dir, name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No dump for {} at {}", name, path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Self {
            name: name.to_string(),
            lines: BufReader::new(GzDecoder::new(file)).lines(),
            line_no: 0,
        }))
    }

    /// Number of the line returned last
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Next non-empty line, `None` at the end of the dump.
    pub fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(Ok(line)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    /// Next line that parses as a JSON object. Malformed lines are logged and
    /// skipped; a read error ends the dump.
    pub fn next_record(&mut self) -> Option<Value> {
        loop {
            let line = match self.next_line()? {
                Ok(line) => line,
                Err(e) => {
                    warn!("Reading {} dump stopped at line {}: {}", self.name, self.line_no, e);
                    return None;
                }
            };
            match serde_json::from_str::<Value>(&line) {
                Ok(record) if record.is_object() => return Some(record),
                Ok(_) => warn!("{} dump line {}: not an object, skipped", self.name, self.line_no),
                Err(e) => warn!("{} dump line {}: broken JSON ({}), skipped", self.name, self.line_no, e),
            }
        }
    }
}

impl Iterator for StateLoader {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.next_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Deserialize)]
    struct IdOnly {
        #[serde(deserialize_with = "deserialize_id")]
        itemid: u64,
    }

    #[test]
    fn test_dump_and_load_lines() -> Result<()> {
        let dir = tempdir()?;
        let mut dumper = StateDumper::create(dir.path(), "items")?;
        dumper.write_json(&json!({"itemid": 1, "v": 2}))?;
        dumper.write_line("{\"itemid\": \"2\"}")?;
        assert_eq!(dumper.finish()?, 2);

        assert!(dump_path(dir.path(), "items").exists());
        assert!(!staging_path(dir.path(), "items").exists());

        let loader = StateLoader::open(dir.path(), "items")?.expect("dump exists");
        let ids: Vec<u64> = loader
            .map(|r| serde_json::from_value::<IdOnly>(r).map(|r| r.itemid))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(ids, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_id_forms() {
        let parsed: IdOnly = serde_json::from_value(json!({"itemid": " 42 "})).unwrap();
        assert_eq!(parsed.itemid, 42);
        assert!(serde_json::from_value::<IdOnly>(json!({"itemid": "x"})).is_err());
        assert!(serde_json::from_value::<IdOnly>(json!({"itemid": -1})).is_err());
    }

    #[test]
    fn test_missing_dump_is_empty() -> Result<()> {
        let dir = tempdir()?;
        assert!(StateLoader::open(dir.path(), "triggers")?.is_none());
        Ok(())
    }

    #[test]
    fn test_malformed_lines_skipped() -> Result<()> {
        let dir = tempdir()?;
        let mut dumper = StateDumper::create(dir.path(), "t")?;
        dumper.write_line("{\"id\": 1}")?;
        dumper.write_line("{broken")?;
        dumper.write_line("[1, 2]")?;
        dumper.write_line("")?;
        dumper.write_line("{\"id\": 4}")?;
        dumper.finish()?;

        let records: Vec<Value> = StateLoader::open(dir.path(), "t")?.expect("dump exists").collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], json!(4));
        Ok(())
    }

    #[test]
    fn test_unfinished_dump_keeps_previous() -> Result<()> {
        let dir = tempdir()?;
        let mut first = StateDumper::create(dir.path(), "items")?;
        first.write_line("{\"itemid\": 7}")?;
        first.finish()?;

        let mut second = StateDumper::create(dir.path(), "items")?;
        second.write_line("{\"itemid\": 8}")?;
        drop(second);

        let records: Vec<Value> = StateLoader::open(dir.path(), "items")?.expect("dump exists").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["itemid"], json!(7));
        Ok(())
    }
}
