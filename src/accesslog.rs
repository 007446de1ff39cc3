//! Structured access records with a size-rotated file sink
//!
//! Connection tasks queue completed records over an unbounded channel; a
//! single writer task owns the file, so concurrent records never
//! interleave. Fields disabled in `log_fields` are omitted from the
//! serialized line entirely rather than written empty.

use crate::config::schema::{LogFields, LoggingConfig};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One completed connection, created once at close and immutable after.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub id: u64,
    pub remote_ip: IpAddr,
    pub method: Option<String>,
    pub url: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
}

impl AccessRecord {
    pub fn new(id: u64, remote_ip: IpAddr) -> Self {
        Self {
            id,
            remote_ip,
            method: None,
            url: None,
            status_code: None,
            duration_ms: None,
            headers: None,
            body: None,
            response_headers: None,
            response_body: None,
        }
    }
}

/// Cloneable handle for emitting records
#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::UnboundedSender<AccessRecord>,
}

impl AccessLog {
    /// Spawn the writer task that owns the log file. The returned join
    /// handle resolves once every `AccessLog` clone is dropped and all
    /// pending records are flushed.
    pub fn spawn(config: &LoggingConfig, fields: LogFields) -> io::Result<(Self, JoinHandle<()>)> {
        let mut writer = RotatingWriter::open(
            config.path.clone(),
            config.rotate_size_mb * 1024 * 1024,
            config.rotate_backups,
        )?;

        let (tx, mut rx) = mpsc::unbounded_channel::<AccessRecord>();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let line = format_record(&fields, &record);
                if let Err(e) = writer.write_line(&line) {
                    tracing::warn!("access log write failed: {}", e);
                }
            }
            let _ = writer.flush();
        });

        Ok((Self { tx }, handle))
    }

    /// Queue a record; never blocks the calling connection task.
    pub fn emit(&self, record: AccessRecord) {
        let _ = self.tx.send(record);
    }
}

/// Append-only file that rotates `path -> path.1 -> ... -> path.N` once
/// the configured size is exceeded.
struct RotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingWriter {
    fn open(path: PathBuf, max_bytes: u64, backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }

        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += len;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups == 0 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let backup = |i: usize| PathBuf::from(format!("{}.{}", self.path.display(), i));
        let _ = fs::remove_file(backup(self.backups));
        for i in (1..self.backups).rev() {
            let _ = fs::rename(backup(i), backup(i + 1));
        }
        fs::rename(&self.path, backup(1))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn format_record(fields: &LogFields, record: &AccessRecord) -> String {
    let mut pieces: Vec<String> = Vec::new();

    if fields.remote_ip {
        pieces.push(format!("IP={}", record.remote_ip));
    }
    if fields.method {
        if let Some(method) = &record.method {
            pieces.push(format!("METHOD={}", method));
        }
    }
    if fields.url {
        if let Some(url) = &record.url {
            pieces.push(format!("URL={}", url));
        }
    }
    if fields.status_code {
        if let Some(status) = record.status_code {
            pieces.push(format!("STATUS={}", status));
        }
    }
    if fields.duration_ms {
        if let Some(duration) = record.duration_ms {
            pieces.push(format!("TIME={}ms", duration));
        }
    }
    if fields.headers {
        if let Some(headers) = &record.headers {
            pieces.push(format!("HEADERS={}", headers));
        }
    }
    if fields.body {
        if let Some(body) = &record.body {
            pieces.push(format!("BODY={}", body));
        }
    }
    if fields.response_headers {
        if let Some(headers) = &record.response_headers {
            pieces.push(format!("RESP_HEADERS={}", headers));
        }
    }
    if fields.response_body {
        if let Some(body) = &record.response_body {
            pieces.push(format!("RESP_BODY={}", body));
        }
    }

    format!(
        "{} [{:08x}] {}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.id,
        pieces.join(" | ")
    )
}
