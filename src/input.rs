//! Table input: sources and the reader task speaking the pull protocol.
//!
//! The coordinator asks a reader for the header once and for batches
//! repeatedly; it only asks for the next batch after a non-empty one arrived,
//! which keeps a fast reader from flooding the coordinator. The empty batch
//! ends the table.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::MinerConfig;
use crate::coord::types::{MinerMessage, TableId};
use crate::core::errors::{MinerError, Result};

/// One table's rows, delivered header first and then in batches
#[async_trait]
pub trait TableSource: Send {
    /// Name used in reports and errors
    fn name(&self) -> &str;

    async fn read_header(&mut self) -> Result<Vec<String>>;

    /// Next batch of rows; empty once the table is exhausted
    async fn read_batch(&mut self) -> Result<Vec<Vec<String>>>;
}

/// Table held in memory, mostly for tests and embedding
#[derive(Debug, Clone)]
pub struct MemoryTableSource {
    name: String,
    header: Vec<String>,
    rows: VecDeque<Vec<String>>,
    batch_size: usize,
}

impl MemoryTableSource {
    pub fn new<S: Into<String>>(name: S, header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            header,
            rows: rows.into(),
            batch_size: 1_000,
        }
    }

    /// Build from string literals
    pub fn from_strs(name: &str, header: &[&str], rows: &[&[&str]]) -> Self {
        let owned = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        Self::new(name, owned(header), rows.iter().map(|r| owned(r)).collect())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl TableSource for MemoryTableSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_header(&mut self) -> Result<Vec<String>> {
        Ok(self.header.clone())
    }

    async fn read_batch(&mut self) -> Result<Vec<Vec<String>>> {
        let take = self.batch_size.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }
}

/// CSV file source. Reads happen on the blocking pool.
pub struct CsvTableSource {
    name: String,
    reader: Option<csv::Reader<File>>,
    header: Vec<String>,
    /// First data record, when the header had to be synthesized from it
    first_record: Option<Vec<String>>,
    batch_size: usize,
}

impl CsvTableSource {
    /// Open `path` using the CSV settings of `config`
    pub fn open(path: impl AsRef<Path>, config: &MinerConfig) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if !config.csv_delimiter.is_ascii() {
            return Err(MinerError::configuration_field(
                format!("csv_delimiter {:?} is not a single-byte ASCII character", config.csv_delimiter),
                "csv_delimiter",
            ));
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(config.csv_delimiter as u8)
            .has_headers(config.csv_has_headers)
            .flexible(true)
            .from_path(path)
            .map_err(|e| MinerError::load_with_source(&name, "cannot open input", e))?;

        let (header, first_record) = if config.csv_has_headers {
            let header = reader
                .headers()
                .map_err(|e| MinerError::load_with_source(&name, "cannot read header", e))?
                .iter()
                .map(str::to_string)
                .collect();
            (header, None)
        } else {
            let mut record = csv::StringRecord::new();
            let found = reader
                .read_record(&mut record)
                .map_err(|e| MinerError::load_with_source(&name, "cannot read first record", e))?;
            if found {
                let header = (0..record.len()).map(|i| format!("column{}", i)).collect();
                (header, Some(record.iter().map(str::to_string).collect()))
            } else {
                (Vec::new(), None)
            }
        };

        Ok(Self {
            name,
            reader: Some(reader),
            header,
            first_record,
            batch_size: config.batch_size.max(1),
        })
    }
}

fn read_records(reader: &mut csv::Reader<File>, limit: usize) -> std::result::Result<Vec<Vec<String>>, csv::Error> {
    let mut rows = Vec::with_capacity(limit.min(4_096));
    let mut record = csv::StringRecord::new();
    while rows.len() < limit && reader.read_record(&mut record)? {
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

#[async_trait]
impl TableSource for CsvTableSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_header(&mut self) -> Result<Vec<String>> {
        Ok(self.header.clone())
    }

    async fn read_batch(&mut self) -> Result<Vec<Vec<String>>> {
        let mut rows: Vec<Vec<String>> = self.first_record.take().into_iter().collect();
        let Some(mut reader) = self.reader.take() else {
            return Ok(rows);
        };

        let limit = self.batch_size - rows.len();
        let (reader, batch) = tokio::task::spawn_blocking(move || {
            let batch = read_records(&mut reader, limit);
            (reader, batch)
        })
        .await
        .map_err(|e| MinerError::load(&self.name, format!("reader task failed: {}", e)))?;

        let batch = batch.map_err(|e| MinerError::load_with_source(&self.name, "cannot read rows", e))?;
        if !batch.is_empty() || !rows.is_empty() {
            self.reader = Some(reader);
        }
        rows.extend(batch);
        Ok(rows)
    }
}

/// Requests the coordinator sends to an input reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRequest {
    Header,
    Batch,
}

/// Serves one table to the coordinator on request
pub struct InputReader {
    table: TableId,
    source: Box<dyn TableSource>,
    miner: mpsc::UnboundedSender<MinerMessage>,
}

impl InputReader {
    pub fn new(table: TableId, source: Box<dyn TableSource>, miner: mpsc::UnboundedSender<MinerMessage>) -> Self {
        Self { table, source, miner }
    }

    /// Answer requests until the table is exhausted, a read fails, or the
    /// request channel closes
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<ReadRequest>) {
        while let Some(request) = requests.recv().await {
            let message = match request {
                ReadRequest::Header => match self.source.read_header().await {
                    Ok(header) => MinerMessage::Header { table: self.table, header },
                    Err(e) => self.failure(e),
                },
                ReadRequest::Batch => match self.source.read_batch().await {
                    Ok(rows) => {
                        debug!("Table {} delivered {} rows", self.table, rows.len());
                        MinerMessage::Batch { table: self.table, rows }
                    }
                    Err(e) => self.failure(e),
                },
            };

            let done = match &message {
                MinerMessage::LoadFailed { .. } => true,
                MinerMessage::Batch { rows, .. } => rows.is_empty(),
                _ => false,
            };
            if self.miner.send(message).is_err() || done {
                break;
            }
        }
    }

    fn failure(&self, error: MinerError) -> MinerMessage {
        error!("Reading table {} ({}) failed: {}", self.table, self.source.name(), error);
        MinerMessage::LoadFailed { table: self.table, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[tokio::test]
    async fn test_memory_source_batches() {
        let mut source =
            MemoryTableSource::from_strs("T0", &["A"], &[&["1"], &["2"], &["3"]]).with_batch_size(2);
        assert_eq!(source.read_header().await.unwrap(), vec!["A".to_string()]);
        assert_eq!(source.read_batch().await.unwrap().len(), 2);
        assert_eq!(source.read_batch().await.unwrap().len(), 1);
        assert!(source.read_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_csv_source_reads_in_batches() {
        let file = write_csv("id;name\n1;x\n2;y\n3;z\n");
        let config = MinerConfig::builder().csv_delimiter(';').batch_size(2).build().unwrap();
        let mut source = CsvTableSource::open(file.path(), &config).unwrap();

        assert_eq!(source.read_header().await.unwrap(), vec!["id".to_string(), "name".to_string()]);
        let first = source.read_batch().await.unwrap();
        assert_eq!(first, vec![vec!["1".to_string(), "x".to_string()], vec!["2".to_string(), "y".to_string()]]);
        assert_eq!(source.read_batch().await.unwrap().len(), 1);
        assert!(source.read_batch().await.unwrap().is_empty());
        assert!(source.read_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_csv_source_without_header_row() {
        let file = write_csv("1,x\n2,y\n");
        let config = MinerConfig::builder().csv_has_headers(false).build().unwrap();
        let mut source = CsvTableSource::open(file.path(), &config).unwrap();

        assert_eq!(
            source.read_header().await.unwrap(),
            vec!["column0".to_string(), "column1".to_string()]
        );
        assert_eq!(source.read_batch().await.unwrap().len(), 2);
        assert!(source.read_batch().await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_is_a_load_error() {
        let err = CsvTableSource::open("/definitely/not/here.csv", &MinerConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.category(), "load");
        assert!(err.to_string().contains("here"));
    }

    #[test]
    fn test_non_ascii_delimiter_is_rejected() {
        let file = write_csv("A;B\n1;2\n");
        // built directly, skipping validate()
        let config = MinerConfig {
            csv_delimiter: 'é',
            ..MinerConfig::default()
        };
        let err = CsvTableSource::open(file.path(), &config).err().unwrap();
        assert_eq!(err.category(), "configuration");
        assert!(matches!(err, MinerError::Configuration { field: Some(ref f), .. } if f == "csv_delimiter"));
    }

    #[tokio::test]
    async fn test_reader_follows_pull_protocol() {
        let (miner_tx, mut miner_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let source = MemoryTableSource::from_strs("T0", &["A"], &[&["1"], &["2"]]).with_batch_size(1);
        let reader = tokio::spawn(InputReader::new(4, Box::new(source), miner_tx).run(req_rx));

        req_tx.send(ReadRequest::Header).unwrap();
        req_tx.send(ReadRequest::Batch).unwrap();
        assert!(matches!(miner_rx.recv().await, Some(MinerMessage::Header { table: 4, .. })));
        assert!(matches!(miner_rx.recv().await, Some(MinerMessage::Batch { ref rows, .. }) if rows.len() == 1));

        // nothing more until asked
        assert!(miner_rx.try_recv().is_err());
        req_tx.send(ReadRequest::Batch).unwrap();
        req_tx.send(ReadRequest::Batch).unwrap();
        assert!(matches!(miner_rx.recv().await, Some(MinerMessage::Batch { ref rows, .. }) if rows.len() == 1));
        assert!(matches!(miner_rx.recv().await, Some(MinerMessage::Batch { ref rows, .. }) if rows.is_empty()));

        reader.await.unwrap();
    }
}
