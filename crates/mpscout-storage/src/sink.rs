//! Append-only writers for committed listing records.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use mpscout_core::ListingRecord;
use thiserror::Error;

pub const CSV_COLUMNS: [&str; 8] = [
    "id",
    "title",
    "price",
    "location",
    "post_time_str",
    "scraped_at",
    "link",
    "image_url",
];

const IMAGE_URL_SEPARATOR: &str = ";";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub trait RecordSink: Send + Sync {
    fn append(&self, record: &ListingRecord) -> Result<(), SinkError>;

    fn target(&self) -> &Path;
}

/// Picks the JSON-lines writer for `.jsonl`/`.json` targets and CSV otherwise.
pub fn sink_for_path(path: impl Into<PathBuf>) -> Box<dyn RecordSink> {
    let path = path.into();
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl") || ext.eq_ignore_ascii_case("json"));
    if is_json {
        Box::new(JsonLinesSink::new(path))
    } else {
        Box::new(CsvSink::new(path))
    }
}

fn open_for_append(path: &Path) -> Result<(fs::File, bool), SinkError> {
    let io_err = |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let is_new = match fs::metadata(path) {
        Ok(meta) => meta.len() == 0,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(io_err(err)),
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    Ok((file, is_new))
}

#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSink for CsvSink {
    fn append(&self, record: &ListingRecord) -> Result<(), SinkError> {
        let (file, is_new) = open_for_append(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(CSV_COLUMNS)?;
        }
        let scraped_at = record.scraped_at.to_rfc3339();
        let image_url = record.image_url.join(IMAGE_URL_SEPARATOR);
        writer.write_record([
            record.id.as_str(),
            record.title.as_str(),
            record.price.as_str(),
            record.location.as_str(),
            record.post_time_str.as_str(),
            scraped_at.as_str(),
            record.link.as_str(),
            image_url.as_str(),
        ])?;
        writer.flush().map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn target(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSink for JsonLinesSink {
    fn append(&self, record: &ListingRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let (mut file, _) = open_for_append(&self.path)?;
        file.write_all(line.as_bytes())
            .map_err(|source| SinkError::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn target(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    fn record(id: &str, title: &str) -> ListingRecord {
        ListingRecord {
            id: id.to_string(),
            title: title.to_string(),
            price: "$120".to_string(),
            location: "Portland, OR".to_string(),
            post_time_str: "an hour ago".to_string(),
            scraped_at: DateTime::parse_from_rfc3339("2026-03-02T08:30:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            link: format!("https://www.facebook.com/marketplace/item/{id}/"),
            image_url: vec!["https://cdn.example/a.jpg".to_string()],
        }
    }

    #[test]
    fn csv_header_is_written_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("listings.csv");
        let sink = CsvSink::new(&path);

        sink.append(&record("1", "Walnut dresser")).expect("first row");
        sink.append(&record("2", "Desk, \"standing\"")).expect("second row");

        let mut reader = csv::Reader::from_path(&path).expect("reader");
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_COLUMNS.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>().expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "Desk, \"standing\"");
        assert_eq!(&rows[0][5], "2026-03-02T08:30:00+00:00");
        assert_eq!(&rows[0][7], "https://cdn.example/a.jpg");
    }

    #[test]
    fn csv_joins_multiple_images() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("listings.csv");
        let mut rec = record("3", "Lamp");
        rec.image_url.push("https://cdn.example/b.jpg".to_string());
        CsvSink::new(&path).append(&rec).expect("row");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("https://cdn.example/a.jpg;https://cdn.example/b.jpg"));
    }

    #[test]
    fn jsonl_extension_selects_json_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("listings.jsonl");
        let sink = sink_for_path(&path);
        sink.append(&record("4", "Chair")).expect("line 1");
        sink.append(&record("5", "Table")).expect("line 2");

        let text = fs::read_to_string(&path).expect("read");
        let parsed: Vec<ListingRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].title, "Table");
        assert_eq!(sink.target(), path.as_path());
    }
}
