use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use super::{validate_append, HistoryStore, ProviderError};
use crate::Event;

const HISTORY_EXT: &str = "jsonl";

/// Filesystem-backed history store writing one JSONL file per instance.
///
/// Appends are serialized by a store-wide lock and `fsync`ed before the call
/// returns. Instance creation writes a temporary file and hard-links it into
/// place, so a half-written first event is never visible and concurrent
/// creators race on the link, not on file contents.
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
    write_lock: Mutex<()>,
}

struct Loaded {
    events: Vec<Event>,
    /// Length of the well-formed prefix; a torn trailing line is excluded.
    valid_len: u64,
    file_len: u64,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, ProviderError> {
        let path = root.as_ref().to_path_buf();
        if reset_on_create && path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| ProviderError::from_io("open", &e))?;
        }
        std::fs::create_dir_all(&path).map_err(|e| ProviderError::from_io("open", &e))?;
        Ok(Self {
            root: path,
            cap: 1024,
            write_lock: Mutex::new(()),
        })
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Result<Self, ProviderError> {
        let mut s = Self::new(root, reset_on_create)?;
        s.cap = cap;
        Ok(s)
    }

    fn inst_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.{HISTORY_EXT}", encode_instance(instance)))
    }

    async fn load(&self, path: &Path) -> Result<Option<Loaded>, ProviderError> {
        let data = match fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProviderError::from_io("read", &e)),
        };
        let mut events = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = data[offset..].iter().position(|b| *b == b'\n');
            let (line, next, terminated) = match end {
                Some(n) => (&data[offset..offset + n], offset + n + 1, true),
                None => (&data[offset..], data.len(), false),
            };
            if !terminated {
                // Records are acknowledged only with their newline; the next append truncates this tail.
                if !line.iter().all(u8::is_ascii_whitespace) {
                    warn!(
                        target: "durable_ingest::providers::fs",
                        path = %path.display(),
                        bytes = line.len(),
                        "ignoring unterminated trailing history record"
                    );
                }
                break;
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<Event>(line) {
                    Ok(ev) => events.push(ev),
                    Err(e) => {
                        return Err(ProviderError::permanent(
                            "read",
                            format!("corrupt history record in {}: {e}", path.display()),
                        ));
                    }
                }
            }
            offset = next;
        }
        Ok(Some(Loaded {
            events,
            valid_len: offset as u64,
            file_len: data.len() as u64,
        }))
    }

    async fn sync_root(&self) {
        // Directory fsync is not available on every platform.
        if let Ok(dir) = fs::File::open(&self.root).await {
            let _ = dir.sync_all().await;
        }
    }
}

fn encode_lines(events: &[Event]) -> Result<Vec<u8>, ProviderError> {
    let mut buf = Vec::new();
    for ev in events {
        let line = serde_json::to_vec(ev)
            .map_err(|e| ProviderError::permanent("append", format!("serialization error: {e}")))?;
        buf.extend_from_slice(&line);
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Percent-encode everything outside `[A-Za-z0-9._-]` so any instance id maps
/// to a single flat file name.
pub(crate) fn encode_instance(instance: &str) -> String {
    let mut out = String::with_capacity(instance.len());
    for b in instance.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub(crate) fn decode_instance(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    fn name(&self) -> &str {
        "fs"
    }

    fn history_cap(&self) -> Option<usize> {
        Some(self.cap)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self
            .load(&self.inst_path(instance))
            .await?
            .map(|l| l.events)
            .unwrap_or_default())
    }

    async fn create_instance(&self, instance: &str, initial_events: Vec<Event>) -> Result<bool, ProviderError> {
        let _g = self.write_lock.lock().await;
        let path = self.inst_path(instance);
        if fs::try_exists(&path)
            .await
            .map_err(|e| ProviderError::from_io("create_instance", &e))?
        {
            return Ok(false);
        }
        validate_append(instance, &[], &initial_events)?;

        let tmp = self.root.join(format!(".{}.tmp", encode_instance(instance)));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| ProviderError::from_io("create_instance", &e))?;
        file.write_all(&encode_lines(&initial_events)?)
            .await
            .map_err(|e| ProviderError::from_io("create_instance", &e))?;
        file.sync_all()
            .await
            .map_err(|e| ProviderError::from_io("create_instance", &e))?;
        drop(file);

        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                self.sync_root().await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(ProviderError::from_io("create_instance", &e)),
        }
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let _g = self.write_lock.lock().await;
        let path = self.inst_path(instance);
        let loaded = self
            .load(&path)
            .await?
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        if loaded.events.len() + new_events.len() > self.cap {
            return Err(ProviderError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    self.cap,
                    loaded.events.len(),
                    new_events.len()
                ),
            ));
        }
        validate_append(instance, &loaded.events, &new_events)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| ProviderError::from_io("append", &e))?;
        if loaded.valid_len < loaded.file_len {
            file.set_len(loaded.valid_len)
                .await
                .map_err(|e| ProviderError::from_io("append", &e))?;
        }
        file.seek(std::io::SeekFrom::Start(loaded.valid_len))
            .await
            .map_err(|e| ProviderError::from_io("append", &e))?;
        file.write_all(&encode_lines(&new_events)?)
            .await
            .map_err(|e| ProviderError::from_io("append", &e))?;
        file.sync_all()
            .await
            .map_err(|e| ProviderError::from_io("append", &e))?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&self.root)
            .await
            .map_err(|e| ProviderError::from_io("list_instances", &e))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| ProviderError::from_io("list_instances", &e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(&format!(".{HISTORY_EXT}")) {
                if let Some(id) = decode_instance(stem) {
                    out.push(id);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
