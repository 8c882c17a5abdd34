use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use session_runtime_error::RuntimeError;
use sha2::{Digest, Sha256};

use super::{ConversationLayer, ConversationRecord, ConversationStore};

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Longest encoded stem used as-is. Leaves room for `.json.tmp-<n>` under
/// the usual 255 byte file name limit.
const MAX_PLAIN_STEM: usize = 200;
/// Encoded prefix kept in front of the digest for longer stems.
const HASHED_STEM_PREFIX: usize = 128;

/// One JSON [`ConversationRecord`] per session under a directory.
///
/// With an `expiration`, a record whose `saved_at` is older than that is
/// treated as absent and removed on the next access.
#[derive(Debug)]
pub struct FileConversationStore {
    directory: PathBuf,
    expiration: Option<Duration>,
}

impl FileConversationStore {
    pub async fn open(
        directory: impl Into<PathBuf>,
        expiration: Option<Duration>,
    ) -> Result<Self, RuntimeError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|err| io_error("create store directory", &directory, err))?;
        tracing::info!(
            directory = %directory.display(),
            expiration_secs = expiration.map(|value| value.as_secs()),
            "file conversation store ready"
        );
        Ok(Self {
            directory,
            expiration,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Resets the expiry clock of a stored session. Returns `false` if the
    /// session has no (unexpired) record.
    pub async fn refresh_expiration(&self, session_id: &str) -> Result<bool, RuntimeError> {
        let path = self.path_for(session_id)?;
        let Some(mut record) = self.read_record(&path).await? else {
            return Ok(false);
        };
        record.saved_at = Utc::now();
        self.write_record(&path, &record).await?;
        Ok(true)
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, RuntimeError> {
        if session_id.is_empty() {
            return Err(RuntimeError::InvalidRequest {
                message: "session id must not be empty".to_string(),
            });
        }
        Ok(self
            .directory
            .join(format!("{}.json", encode_file_stem(session_id))))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<ConversationRecord>, RuntimeError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read conversation", path, err)),
        };
        let record: ConversationRecord = serde_json::from_slice(&raw).map_err(|err| {
            RuntimeError::persistence(format!(
                "failed to parse conversation record {}: {err}",
                path.display()
            ))
        })?;

        if self.is_expired(&record) {
            tracing::debug!(path = %path.display(), "conversation record expired");
            remove_if_present(path).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn write_record(
        &self,
        path: &Path,
        record: &ConversationRecord,
    ) -> Result<(), RuntimeError> {
        let bytes = serde_json::to_vec(record).map_err(|err| {
            RuntimeError::persistence(format!("failed to serialize conversation record: {err}"))
        })?;
        let temp = path.with_extension(format!(
            "json.tmp-{}",
            TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|err| io_error("write conversation", &temp, err))?;
        if let Err(err) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("replace conversation", path, err));
        }
        Ok(())
    }

    fn is_expired(&self, record: &ConversationRecord) -> bool {
        let Some(expiration) = self.expiration else {
            return false;
        };
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => record.saved_at + expiration < Utc::now(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn save(&self, session_id: &str, layer: &ConversationLayer) -> Result<(), RuntimeError> {
        let path = self.path_for(session_id)?;
        self.write_record(&path, &ConversationRecord::from_layer(layer))
            .await
    }

    async fn load(&self, session_id: &str) -> Result<Option<ConversationLayer>, RuntimeError> {
        let path = self.path_for(session_id)?;
        Ok(self
            .read_record(&path)
            .await?
            .map(ConversationRecord::into_layer))
    }

    async fn delete(&self, session_id: &str) -> Result<(), RuntimeError> {
        let path = self.path_for(session_id)?;
        remove_if_present(&path).await
    }

    async fn exists(&self, session_id: &str) -> Result<bool, RuntimeError> {
        let path = self.path_for(session_id)?;
        Ok(self.read_record(&path).await?.is_some())
    }
}

/// Keeps `[A-Za-z0-9_-]` and percent-encodes every other byte so session
/// ids can never escape the store directory. Stems too long for a file
/// name are cut and suffixed with `~` and the SHA-256 of the full id; `~`
/// is always encoded, so a cut stem cannot collide with a plain one.
fn encode_file_stem(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    if out.len() > MAX_PLAIN_STEM {
        // The stem is pure ASCII, so any byte index is a char boundary.
        out.truncate(HASHED_STEM_PREFIX);
        out.push('~');
        out.push_str(&format!("{:x}", Sha256::digest(session_id.as_bytes())));
    }
    out
}

async fn remove_if_present(path: &Path) -> Result<(), RuntimeError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("delete conversation", path, err)),
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> RuntimeError {
    RuntimeError::persistence(format!("failed to {action} {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationRound;

    fn layer_with_rounds(count: usize) -> ConversationLayer {
        let mut layer = ConversationLayer::new();
        for n in 0..count {
            layer.push_round(ConversationRound::new(
                Some(format!("q{n}")),
                Some(format!("a{n}")),
                10 + n,
            ));
        }
        layer.summary_content = "the story so far".to_string();
        layer.summarized_rounds = 4;
        layer
    }

    #[tokio::test]
    async fn round_trip_preserves_counts_and_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();

        store.save("s1", &layer_with_rounds(3)).await.unwrap();
        let loaded = store.load("s1").await.unwrap().expect("stored layer");
        assert_eq!(loaded.recent_len(), 3);
        assert_eq!(loaded.summary_content, "the story so far");
        assert_eq!(loaded.summarized_rounds, 4);
        assert_eq!(loaded.recent_rounds[2].token_count, 12);
        assert!(store.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_session_loads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();
        assert_eq!(store.load("missing").await.unwrap(), None);
        assert!(!store.exists("missing").await.unwrap());
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn session_ids_are_confined_to_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();
        store
            .save("../escape:agent", &layer_with_rounds(1))
            .await
            .unwrap();

        let names = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["%2E%2E%2Fescape%3Aagent.json".to_string()]);
        assert!(store.load("../escape:agent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn long_session_ids_fit_in_a_file_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();
        let slashes = "/".repeat(300);
        // Same encoded prefix, different ids.
        let other = format!("{}x", "/".repeat(299));
        store.save(&slashes, &layer_with_rounds(1)).await.unwrap();
        store.save(&other, &layer_with_rounds(2)).await.unwrap();

        let names = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names.len(), 2);
        for name in &names {
            assert!(name.len() <= 255, "{name}");
            assert!(name.contains('~'), "{name}");
        }
        assert_eq!(store.load(&slashes).await.unwrap().unwrap().recent_len(), 1);
        assert_eq!(store.load(&other).await.unwrap().unwrap().recent_len(), 2);

        let short = encode_file_stem("short-id");
        assert_eq!(short, "short-id");
        assert_eq!(encode_file_stem("a~b"), "a%7Eb");
    }

    #[tokio::test]
    async fn expired_records_load_as_absent_and_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let mut record = ConversationRecord::from_layer(&layer_with_rounds(1));
        record.saved_at = Utc::now() - chrono::Duration::seconds(120);
        let path = dir.path().join("old.json");
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert_eq!(store.load("old").await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn refresh_expiration_rewrites_saved_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let mut record = ConversationRecord::from_layer(&layer_with_rounds(1));
        record.saved_at = Utc::now() - chrono::Duration::seconds(30);
        std::fs::write(
            dir.path().join("s1.json"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        assert!(store.refresh_expiration("s1").await.unwrap());
        let raw = std::fs::read(dir.path().join("s1.json")).unwrap();
        let refreshed: ConversationRecord = serde_json::from_slice(&raw).unwrap();
        assert!(refreshed.saved_at > record.saved_at);
        assert!(!store.refresh_expiration("absent").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_persistence_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();

        let err = store.load("bad").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Persistence { .. }));
    }

    #[tokio::test]
    async fn empty_assistant_turn_reloads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();
        let mut layer = ConversationLayer::new();
        layer.push_round(ConversationRound::new(Some("q".into()), Some(String::new()), 1));
        store.save("s1", &layer).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.recent_rounds[0].assistant_content, None);
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileConversationStore::open(dir.path(), None).await.unwrap();
        let err = store.load("").await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidRequest { .. }));
    }
}
