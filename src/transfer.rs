//! File transfer engine: chunk sizing, upload reassembly, stored-file index
//! and listing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{FileEntry, LanshareError, Result};

pub const SMALL_FILE_THRESHOLD: u64 = 1024 * 1024;
pub const MEDIUM_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

pub const SMALL_FILE_CHUNK: usize = 512 * 1024;
pub const MEDIUM_FILE_CHUNK: usize = 1024 * 1024;
pub const LARGE_FILE_CHUNK: usize = 2 * 1024 * 1024;
pub const HUGE_FILE_CHUNK: usize = 4 * 1024 * 1024;

/// Sidecar index kept next to the stored files
pub const INDEX_FILE_NAME: &str = ".lanshare-index.json";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Download chunk size for a file of `file_size` bytes
pub fn chunk_size_for(file_size: u64) -> usize {
    if file_size < SMALL_FILE_THRESHOLD {
        SMALL_FILE_CHUNK
    } else if file_size < MEDIUM_FILE_THRESHOLD {
        MEDIUM_FILE_CHUNK
    } else if file_size < LARGE_FILE_THRESHOLD {
        LARGE_FILE_CHUNK
    } else {
        HUGE_FILE_CHUNK
    }
}

pub fn total_chunks(file_size: u64, chunk_size: usize) -> u64 {
    file_size.div_ceil(chunk_size as u64)
}

/// Human readable size with up to two decimals, e.g. "1.5 KB"
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let mut number = format!("{value:.2}");
    if number.contains('.') {
        let trimmed = number.trim_end_matches('0').trim_end_matches('.').len();
        number.truncate(trimmed);
    }
    format!("{} {}", number, UNITS[unit])
}

/// Coarse file category derived from the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Image,
    Video,
    Document,
    Archive,
    Audio,
    Other,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("png" | "jpg" | "jpeg" | "gif" | "bmp") => FileKind::Image,
            Some("mp4" | "avi" | "mov" | "mkv") => FileKind::Video,
            Some("pdf" | "docx" | "xlsx" | "pptx" | "txt") => FileKind::Document,
            Some("zip" | "rar" | "7z" | "tar" | "gz") => FileKind::Archive,
            Some("mp3" | "wav" | "aac" | "flac") => FileKind::Audio,
            _ => FileKind::Other,
        }
    }
}

/// Reject names that could escape the files directory
pub fn validate_file_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name == INDEX_FILE_NAME;
    if invalid {
        return Err(LanshareError::Transfer(format!("invalid file name: {name:?}")));
    }
    Ok(())
}

/// On-disk name of a file uploaded by `sender`
pub fn stored_name(sender: &str, file_name: &str) -> String {
    format!("{sender}_{file_name}")
}

/// Legacy split of a stored name into `(sender, original name)` on the first
/// `_`. Ambiguous when the sender contains `_`; only used for files with no
/// index record.
pub fn split_stored_name(stored: &str) -> (String, String) {
    match stored.split_once('_') {
        Some((sender, original)) => (sender.to_string(), original.to_string()),
        None => ("Unknown".to_string(), stored.to_string()),
    }
}

fn format_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(time).format(DATE_FORMAT).to_string()
}

/// Server-side progress of one in-flight upload
#[derive(Debug, Clone)]
pub struct UploadState {
    pub file_name: String,
    pub path: PathBuf,
    pub total_chunks: u64,
    pub received_chunks: u64,
    pub declared_size: String,
    pub sender: String,
    pub date: String,
}

impl UploadState {
    /// Whether `current_chunk` is the next chunk this upload expects
    pub fn expects(&self, current_chunk: u64) -> bool {
        current_chunk == self.received_chunks + 1 && current_chunk <= self.total_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }
}

/// Sidecar record for one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_name: String,
    pub sender: String,
    pub date: String,
}

/// A stored file resolved for download
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
    pub entry: FileEntry,
}

impl StoredFile {
    pub fn chunk_size(&self) -> usize {
        chunk_size_for(self.size)
    }

    pub fn total_chunks(&self) -> u64 {
        total_chunks(self.size, self.chunk_size())
    }

    pub async fn open_reader(&self) -> Result<ChunkReader> {
        let file = fs::File::open(&self.path).await?;
        Ok(ChunkReader {
            file,
            chunk_size: self.chunk_size(),
            next_chunk: 1,
        })
    }
}

/// Sequential reader yielding `(chunk_number, bytes)` pairs
pub struct ChunkReader {
    file: fs::File,
    chunk_size: usize,
    next_chunk: u64,
}

impl ChunkReader {
    pub async fn next_chunk(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        let number = self.next_chunk;
        self.next_chunk += 1;
        Ok(Some((number, buffer)))
    }
}

/// Flat directory of uploaded files plus the sidecar index describing them
pub struct FileStore {
    dir: PathBuf,
    index: Mutex<BTreeMap<String, FileRecord>>,
}

impl FileStore {
    /// Open (creating if needed) the files directory and load its index
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if fs::try_exists(&dir).await? {
            tracing::info!(dir = %dir.display(), "Using existing files directory");
        } else {
            fs::create_dir_all(&dir).await?;
            tracing::info!(dir = %dir.display(), "Created files directory");
        }

        let index_path = dir.join(INDEX_FILE_NAME);
        let index = match fs::read_to_string(&index_path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start tracking an upload of `file_name` by `sender`
    pub fn begin_upload(&self, file_name: &str, sender: &str, total_chunks: u64, declared_size: &str, date: &str) -> Result<UploadState> {
        validate_file_name(file_name)?;
        if total_chunks == 0 {
            return Err(LanshareError::Transfer("total_chunks must be at least 1".to_string()));
        }

        Ok(UploadState {
            file_name: file_name.to_string(),
            path: self.dir.join(stored_name(sender, file_name)),
            total_chunks,
            received_chunks: 0,
            declared_size: declared_size.to_string(),
            sender: sender.to_string(),
            date: date.to_string(),
        })
    }

    /// Write the next chunk of `upload`. The first chunk truncates the
    /// destination, later ones append.
    pub async fn write_chunk(&self, upload: &mut UploadState, data: &[u8]) -> Result<()> {
        let mut options = fs::OpenOptions::new();
        options.create(true);
        if upload.received_chunks == 0 {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }

        let mut file = options.open(&upload.path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        upload.received_chunks += 1;
        Ok(())
    }

    /// Record a finished upload in the index and describe it
    pub async fn commit(&self, upload: &UploadState) -> Result<FileEntry> {
        let stored = stored_name(&upload.sender, &upload.file_name);
        let record = FileRecord {
            file_name: upload.file_name.clone(),
            sender: upload.sender.clone(),
            date: upload.date.clone(),
        };

        let mut index = self.index.lock().await;
        index.insert(stored, record);
        self.persist_index(&index).await?;

        Ok(FileEntry {
            file_name: upload.file_name.clone(),
            file_size: upload.declared_size.clone(),
            file_type: FileKind::from_name(&upload.file_name),
            sender: upload.sender.clone(),
            date: upload.date.clone(),
        })
    }

    async fn persist_index(&self, index: &BTreeMap<String, FileRecord>) -> Result<()> {
        let content = serde_json::to_string_pretty(index)?;
        let tmp = self.dir.join(format!("{INDEX_FILE_NAME}.tmp"));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE_NAME)).await?;
        Ok(())
    }

    fn is_internal(name: &str) -> bool {
        name.starts_with(INDEX_FILE_NAME)
    }

    fn describe(stored: &str, record: Option<&FileRecord>, meta: &std::fs::Metadata) -> FileEntry {
        let modified = meta.modified().ok().map(format_time).unwrap_or_else(|| "Unknown".to_string());
        let (sender, file_name, date) = match record {
            Some(record) => {
                let date = if record.date.is_empty() || record.date == "Unknown" {
                    modified
                } else {
                    record.date.clone()
                };
                (record.sender.clone(), record.file_name.clone(), date)
            }
            None => {
                let (sender, file_name) = split_stored_name(stored);
                (sender, file_name, modified)
            }
        };

        FileEntry {
            file_type: FileKind::from_name(&file_name),
            file_name,
            file_size: human_size(meta.len()),
            sender,
            date,
        }
    }

    /// Describe every stored file. Recomputed from disk on each call.
    pub async fn list(&self) -> Result<Vec<FileEntry>> {
        let index = self.index.lock().await.clone();
        let mut files = Vec::new();

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::is_internal(&name) {
                continue;
            }
            // removed (or a dangling link) since read_dir saw it
            let meta = match fs::metadata(entry.path()).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                continue;
            }
            files.push(Self::describe(&name, index.get(&name), &meta));
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name).then_with(|| a.sender.cmp(&b.sender)));
        Ok(files)
    }

    /// Find a stored file by its original name. Index records win; files
    /// without a record match when their stored name ends in `_{file_name}`.
    pub async fn find(&self, file_name: &str) -> Result<Option<StoredFile>> {
        if validate_file_name(file_name).is_err() {
            return Ok(None);
        }

        let index = self.index.lock().await.clone();
        let mut candidates: Vec<(String, Option<FileRecord>)> = index
            .iter()
            .filter(|(_, record)| record.file_name == file_name)
            .map(|(stored, record)| (stored.clone(), Some(record.clone())))
            .collect();

        let suffix = format!("_{file_name}");
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::is_internal(&name) || index.contains_key(&name) {
                continue;
            }
            if name.ends_with(&suffix) {
                candidates.push((name, None));
            }
        }

        for (stored, record) in candidates {
            let path = self.dir.join(&stored);
            let meta = match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let mut entry = Self::describe(&stored, record.as_ref(), &meta);
            // the requested name is authoritative for legacy files
            entry.file_name = file_name.to_string();
            entry.file_type = FileKind::from_name(file_name);
            return Ok(Some(StoredFile {
                path,
                size: meta.len(),
                entry,
            }));
        }

        Ok(None)
    }
}
