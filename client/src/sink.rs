//! Test-mode tee: a local, compressed CSV copy of everything submitted.

use {
    chrono::Local,
    fegem_wire::{LvTimestamp, Payload},
    flate2::{write::GzEncoder, Compression},
    log::*,
    std::{
        fmt::Write as _,
        fs::File,
        io::Write as _,
        path::PathBuf,
    },
};

/// Dump the in-memory buffer to disk once it grows past this size.
const CSV_BUFFER_LIMIT: usize = 10 * 1024;

const CSV_HEADER: &str = "seconds,fraction,category,varname,values\n";

/// Receives a copy of every accepted submission. The packer holds at most
/// one sink.
pub trait Sink: Send {
    fn write_row(
        &mut self,
        timestamp: &LvTimestamp,
        category: &str,
        varname: &str,
        payload: &Payload,
    );
}

/// Buffers CSV rows in memory and dumps them gzip-compressed to a
/// timestamped `MIDAS_GEM_LOG_*.csv.gz` file.
pub struct GzCsvSink {
    buffer: String,
    directory: PathBuf,
}

impl GzCsvSink {
    pub fn new() -> Self {
        Self::with_directory(".")
    }

    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            buffer: String::new(),
            directory: directory.into(),
        }
    }

    fn dump(&mut self) {
        let name = format!(
            "MIDAS_GEM_LOG_{}.csv.gz",
            Local::now().format("%Y%m%d-%H%M%S"),
        );
        let path = self.directory.join(name);
        let result = File::create(&path).and_then(|file| {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(CSV_HEADER.as_bytes())?;
            encoder.write_all(self.buffer.as_bytes())?;
            encoder.finish().map(|_| ())
        });
        match result {
            Ok(()) => info!(
                "dumped {} bytes of test-mode CSV to {}",
                self.buffer.len(),
                path.display(),
            ),
            Err(err) => warn!("failed to write test-mode CSV {}: {err}", path.display()),
        }
        self.buffer.clear();
    }
}

impl Default for GzCsvSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for GzCsvSink {
    fn write_row(
        &mut self,
        timestamp: &LvTimestamp,
        category: &str,
        varname: &str,
        payload: &Payload,
    ) {
        let _ = write!(
            self.buffer,
            "{},{},{category},{varname}",
            timestamp.seconds(),
            timestamp.fraction(),
        );
        match payload {
            Payload::Double(values) => {
                for value in values {
                    let _ = write!(self.buffer, ",{value}");
                }
            }
            Payload::Float(values) => {
                for value in values {
                    let _ = write!(self.buffer, ",{value}");
                }
            }
            Payload::Int32(values) => {
                for value in values {
                    let _ = write!(self.buffer, ",{value}");
                }
            }
            Payload::UInt32(values) => {
                for value in values {
                    let _ = write!(self.buffer, ",{value}");
                }
            }
            Payload::Text(text) => {
                let _ = write!(self.buffer, ",{}", text.trim_end_matches('\0'));
            }
            Payload::Bytes(bytes) => {
                for byte in bytes {
                    let _ = write!(self.buffer, ",{byte}");
                }
            }
        }
        self.buffer.push('\n');
        if self.buffer.len() > CSV_BUFFER_LIMIT {
            self.dump();
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        flate2::read::GzDecoder,
        std::{fs, io::Read},
    };

    fn ts() -> LvTimestamp {
        LvTimestamp::from_unix_parts(1_600_000_000, 0)
    }

    #[test]
    fn test_rows_accumulate_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = GzCsvSink::with_directory(dir.path());
        sink.write_row(&ts(), "Cat", "Var", &Payload::from(vec![1.5_f64, 2.5]));
        assert!(sink.buffer.ends_with(",Cat,Var,1.5,2.5\n"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_dump_past_buffer_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = GzCsvSink::with_directory(dir.path());
        while sink.buffer.len() <= CSV_BUFFER_LIMIT {
            let before = sink.buffer.len();
            sink.write_row(&ts(), "Cat", "Var", &Payload::from(vec![1.0_f64; 16]));
            if sink.buffer.len() < before {
                break; // dumped
            }
        }

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("MIDAS_GEM_LOG_"));
        assert!(file_name.ends_with(".csv.gz"));

        let mut decoded = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert!(decoded.starts_with(CSV_HEADER));
        assert!(decoded.lines().count() > 100);
        assert!(sink.buffer.is_empty());
    }
}
